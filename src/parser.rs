//! Incremental HTTP/1.1 request parsing.
//!
//! The connection buffers raw bytes and calls in here: `header_end` on every read until the header
//! block is complete, `parse_header` once, then either `parse_chunks` on every read or
//! `parse_body` once the announced length arrived. Every failure is reported as a `ParseError`
//! and also recorded on the request as its status with the connection marked for closing.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str;

use thiserror::Error;

use crate::request::{Method, Request, Uri};
use crate::status::StatusCode;
use crate::util::{find, hex_to_digit};

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing request line")]
    MissingRequestLine,
    #[error("missing single space")]
    MissingSingleSpace,
    #[error("missing CRLF")]
    MissingCrlf,
    #[error("header is not valid UTF-8")]
    InvalidEncoding,
    #[error("obsolete line folding detected")]
    ObsoleteLineFolding,
    #[error("method not implemented")]
    MethodNotImplemented,
    #[error("missing slash in URI")]
    UriMissingSlash,
    #[error("invalid char in URI")]
    UriInvalidChar,
    #[error("incomplete percent encoding in URI")]
    PercentIncomplete,
    #[error("invalid hex digit in percent encoding")]
    PercentInvalidHex,
    #[error("encoded NUL byte in URI")]
    PercentNull,
    #[error("path ascends above the root")]
    DirectoryTraversal,
    #[error("invalid format of version")]
    InvalidVersionFormat,
    #[error("invalid version major")]
    InvalidVersionMajor,
    #[error("invalid version delimiter")]
    InvalidVersionDelimiter,
    #[error("invalid version minor")]
    InvalidVersionMinor,
    #[error("HTTP version not supported")]
    NonSupportedVersion,
    #[error("missing colon in header line")]
    HeaderMissingColon,
    #[error("whitespace between header field-name and colon")]
    HeaderColonWhitespace,
    #[error("invalid char in header field name")]
    HeaderNameInvalidChar,
    #[error("multiple differing content-length values")]
    MultipleContentLength,
    #[error("invalid content-length provided")]
    InvalidContentLength,
    #[error("chunked encoding not the final encoding")]
    NonFinalChunkedEncoding,
    #[error("chunked encoding not detected")]
    NonExistentChunkedEncoding,
    #[error("multiple host headers")]
    MultipleHost,
    #[error("missing host header")]
    MissingHost,
    #[error("invalid host header")]
    InvalidHost,
    #[error("invalid connection header")]
    InvalidConnection,
    #[error("multipart/form-data without boundary")]
    BadMultipartFormdata,
    #[error("body not allowed for this method")]
    UnexpectedBody,
    #[error("chunk size missing")]
    ChunkSizeMissing,
    #[error("invalid chunk size")]
    InvalidChunkSize,
    #[error("chunk size too large")]
    ChunkTooLarge,
    #[error("chunk size does not match chunk data")]
    ChunkSizeMismatch,
    #[error("body length does not match content-length")]
    ContentLengthMismatch,
    #[error("multipart body does not start with boundary")]
    MultipartMissingBoundary,
    #[error("multipart body has no closing boundary")]
    MultipartMissingClosingBoundary,
    #[error("multipart part has no blank line after its headers")]
    MultipartMissingSeparator,
    #[error("multipart body has no file part")]
    MultipartMissingFilename,
    #[error("invalid multipart filename")]
    MultipartInvalidFilename,
    #[error("multipart file part has no content type")]
    MultipartMissingContentType,
    #[error("multiple file uploads are not supported")]
    MultipleUploads,
}

impl ParseError {
    pub fn status(self) -> StatusCode {
        match self {
            Self::MethodNotImplemented => StatusCode::METHOD_NOT_IMPLEMENTED,
            Self::NonSupportedVersion => StatusCode::NON_SUPPORTED_VERSION,
            Self::ChunkTooLarge => StatusCode::REQUEST_ENTITY_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

fn fail(request: &mut Request, error: ParseError) -> ParseError {
    request.http_status = error.status();
    request.shall_close_connection = true;
    error
}

/// Length of the header block (including the blank line) once it has fully arrived.
pub fn header_end(buffer: &[u8]) -> Option<usize> {
    find(b"\r\n\r\n", buffer).map(|pos| pos + 4)
}

/// Parse the request line and header fields into `request`.
pub fn parse_header(buffer: &[u8], request: &mut Request) -> Result<(), ParseError> {
    parse_header_block(buffer, request).map_err(|e| fail(request, e))
}

fn parse_header_block(buffer: &[u8], request: &mut Request) -> Result<(), ParseError> {
    let text = str::from_utf8(buffer).map_err(|_| ParseError::InvalidEncoding)?;
    let mut lines = text.split('\n');
    let request_line = lines.next().unwrap_or_default();
    if request_line.is_empty() || request_line == "\r" {
        return Err(ParseError::MissingRequestLine);
    }
    let request_line = request_line
        .strip_suffix('\r')
        .ok_or(ParseError::MissingCrlf)?;
    parse_request_line(request_line, request)?;

    for line in lines {
        if line.is_empty() {
            break;
        }
        let line = line.strip_suffix('\r').ok_or(ParseError::MissingCrlf)?;
        if line.is_empty() {
            break;
        }
        parse_header_line(line, request)?;
    }
    validate_headers(request)
}

fn parse_request_line(line: &str, request: &mut Request) -> Result<(), ParseError> {
    let (method, rest) = line
        .split_once(' ')
        .ok_or(ParseError::MissingSingleSpace)?;
    if method.is_empty() {
        return Err(ParseError::MissingSingleSpace);
    }
    request.method = Some(
        method
            .parse::<Method>()
            .map_err(|_| ParseError::MethodNotImplemented)?,
    );

    let (target, version) = rest
        .split_once(' ')
        .ok_or(ParseError::MissingSingleSpace)?;
    if target.is_empty() || version.starts_with(' ') {
        return Err(ParseError::MissingSingleSpace);
    }
    request.uri = parse_uri(target)?;
    request.version = parse_version(version)?;
    Ok(())
}

fn is_uri_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"-._~:/?#[]@!$&'()*+,;=%".contains(&c)
}

/// Split an origin-form request target and decode its parts.
pub fn parse_uri(target: &str) -> Result<Uri, ParseError> {
    if !target.starts_with('/') {
        return Err(ParseError::UriMissingSlash);
    }
    if !target.bytes().all(is_uri_char) {
        return Err(ParseError::UriInvalidChar);
    }
    let (rest, fragment) = match target.split_once('#') {
        Some((rest, fragment)) => (rest, fragment),
        None => (target, ""),
    };
    if fragment.contains('#') {
        return Err(ParseError::UriInvalidChar);
    }
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, query),
        None => (rest, ""),
    };
    if query.contains('?') {
        return Err(ParseError::UriInvalidChar);
    }
    Ok(Uri {
        path: remove_dot_segments(&percent_decode(path)?)?,
        query: percent_decode(query)?,
        fragment: percent_decode(fragment)?,
    })
}

/// Decode `%XX` triplets. Encoded NUL bytes are rejected.
pub fn percent_decode(s: &str) -> Result<String, ParseError> {
    let bytes = s.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            decoded.push(bytes[i]);
            i += 1;
            continue;
        }
        if bytes.len() - i < 3 {
            return Err(ParseError::PercentIncomplete);
        }
        let (hi, lo) = (bytes[i + 1], bytes[i + 2]);
        if !hi.is_ascii_hexdigit() || !lo.is_ascii_hexdigit() {
            return Err(ParseError::PercentInvalidHex);
        }
        let value = hex_to_digit(hi) * 16 + hex_to_digit(lo);
        if value == 0 {
            return Err(ParseError::PercentNull);
        }
        decoded.push(value);
        i += 3;
    }
    String::from_utf8(decoded).map_err(|_| ParseError::UriInvalidChar)
}

/// Collapse `.` and `..` segments and repeated slashes.
///
/// A `..` that arrives before any named segment would leave the root and is rejected. Later
/// surplus `..` segments stop at the root.
pub fn remove_dot_segments(path: &str) -> Result<String, ParseError> {
    let mut segments: Vec<&str> = Vec::new();
    let mut seen_segment = false;
    let mut trailing_slash = false;
    for segment in path.split('/').skip(1) {
        trailing_slash = true;
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() && !seen_segment {
                    return Err(ParseError::DirectoryTraversal);
                }
            }
            name => {
                segments.push(name);
                seen_segment = true;
                trailing_slash = false;
            }
        }
    }
    let mut normalized = String::with_capacity(path.len());
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if normalized.is_empty() || trailing_slash {
        normalized.push('/');
    }
    Ok(normalized)
}

fn parse_version(version: &str) -> Result<String, ParseError> {
    let rest = version
        .strip_prefix("HTTP/")
        .ok_or(ParseError::InvalidVersionFormat)?;
    let bytes = rest.as_bytes();
    match bytes.first() {
        Some(b'1') => {}
        Some(c) if c.is_ascii_digit() => return Err(ParseError::NonSupportedVersion),
        _ => return Err(ParseError::InvalidVersionMajor),
    }
    if bytes.get(1) != Some(&b'.') {
        return Err(ParseError::InvalidVersionDelimiter);
    }
    match bytes.get(2) {
        Some(b'0') | Some(b'1') => {}
        Some(c) if c.is_ascii_digit() => return Err(ParseError::NonSupportedVersion),
        _ => return Err(ParseError::InvalidVersionMinor),
    }
    if bytes.len() > 3 {
        return Err(ParseError::MissingCrlf);
    }
    Ok(rest.to_string())
}

fn is_token_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&c)
}

fn parse_header_line(line: &str, request: &mut Request) -> Result<(), ParseError> {
    if line.starts_with(' ') || line.starts_with('\t') {
        return Err(ParseError::ObsoleteLineFolding);
    }
    let (name, value) = line.split_once(':').ok_or(ParseError::HeaderMissingColon)?;
    if name.ends_with(' ') || name.ends_with('\t') {
        return Err(ParseError::HeaderColonWhitespace);
    }
    if name.is_empty() || !name.bytes().all(is_token_char) {
        return Err(ParseError::HeaderNameInvalidChar);
    }
    let name = name.to_ascii_lowercase();
    let value = value.trim_matches(|c| c == ' ' || c == '\t');

    let value = match name.as_str() {
        "host" => {
            if request.headers.contains("host") {
                return Err(ParseError::MultipleHost);
            }
            value.to_string()
        }
        "content-length" => {
            let length = parse_content_length(value)?;
            if let Some(previous) = request.headers.get("content-length") {
                if previous != length.to_string() {
                    return Err(ParseError::MultipleContentLength);
                }
            }
            length.to_string()
        }
        "connection" => {
            let value = value.to_ascii_lowercase();
            if let Some(previous) = request.headers.get("connection") {
                if previous != value {
                    return Err(ParseError::InvalidConnection);
                }
            }
            value
        }
        _ => value.to_string(),
    };
    request.headers.insert(&name, value);
    Ok(())
}

/// A single length, or a list of identical lengths.
fn parse_content_length(value: &str) -> Result<usize, ParseError> {
    let mut length = None;
    for item in value.split(',') {
        let item = item.trim_matches(|c| c == ' ' || c == '\t');
        if item.is_empty() || !item.bytes().all(|c| c.is_ascii_digit()) {
            return Err(ParseError::InvalidContentLength);
        }
        let parsed = item
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(ParseError::MultipleContentLength)
            }
            _ => length = Some(parsed),
        }
    }
    length.ok_or(ParseError::InvalidContentLength)
}

fn validate_headers(request: &mut Request) -> Result<(), ParseError> {
    match request.headers.get("host") {
        None => return Err(ParseError::MissingHost),
        Some(host) => validate_host(host)?,
    }

    if let Some(length) = request.content_length() {
        request.has_body = length > 0;
    }

    if let Some(encoding) = request.headers.get("transfer-encoding") {
        let codings: Vec<String> = encoding
            .split(',')
            .map(|coding| coding.trim().to_ascii_lowercase())
            .collect();
        if encoding.trim().is_empty() || !codings.iter().any(|coding| coding == "chunked") {
            return Err(ParseError::NonExistentChunkedEncoding);
        }
        if codings.last().map(String::as_str) != Some("chunked") {
            return Err(ParseError::NonFinalChunkedEncoding);
        }
        if request.headers.contains("content-length") {
            request.headers.remove("content-length");
            request.shall_close_connection = true;
        }
        request.is_chunked = true;
        request.has_body = true;
    }

    match request.headers.get("connection") {
        Some("close") => request.shall_close_connection = true,
        Some("keep-alive") => {}
        Some(_) => return Err(ParseError::InvalidConnection),
        None if request.version == "1.0" => request.shall_close_connection = true,
        None => {}
    }

    if let Some(content_type) = request.headers.get("content-type") {
        if content_type
            .to_ascii_lowercase()
            .starts_with("multipart/form-data")
        {
            let boundary = parameter(content_type, "boundary")
                .filter(|boundary| !boundary.is_empty())
                .ok_or(ParseError::BadMultipartFormdata)?
                .to_string();
            request.has_multipart_formdata = true;
            request.boundary = boundary;
        }
    }

    if request.has_body && matches!(request.method, Some(Method::Get) | Some(Method::Delete)) {
        return Err(ParseError::UnexpectedBody);
    }
    Ok(())
}

/// Value of a `; key=value` parameter, with surrounding quotes removed.
fn parameter<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    header.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case(key) {
            let value = value.trim();
            Some(
                value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value),
            )
        } else {
            None
        }
    })
}

/// Hostname, IPv4 address or bracketed IPv6 address, optionally followed by `:port`.
pub fn validate_host(host: &str) -> Result<(), ParseError> {
    if host.is_empty() {
        return Err(ParseError::InvalidHost);
    }
    let (name, port) = if let Some(rest) = host.strip_prefix('[') {
        let (address, rest) = rest.split_once(']').ok_or(ParseError::InvalidHost)?;
        address
            .parse::<Ipv6Addr>()
            .map_err(|_| ParseError::InvalidHost)?;
        match rest {
            "" => return Ok(()),
            _ => (None, Some(rest.strip_prefix(':').ok_or(ParseError::InvalidHost)?)),
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) => (Some(name), Some(port)),
            None => (Some(host), None),
        }
    };

    if let Some(port) = port {
        let valid = !port.is_empty()
            && port.bytes().all(|c| c.is_ascii_digit())
            && port.parse::<u16>().map_or(false, |port| port != 0);
        if !valid {
            return Err(ParseError::InvalidHost);
        }
    }
    match name {
        None => Ok(()),
        Some(name) if name.bytes().all(|c| c.is_ascii_digit() || c == b'.') => name
            .parse::<Ipv4Addr>()
            .map(|_| ())
            .map_err(|_| ParseError::InvalidHost),
        Some(name) => validate_hostname(name),
    }
}

fn validate_hostname(name: &str) -> Result<(), ParseError> {
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return Err(ParseError::InvalidHost);
    }
    for label in name.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'-');
        if !valid {
            return Err(ParseError::InvalidHost);
        }
    }
    if !name.bytes().any(|c| c.is_ascii_alphabetic()) {
        return Err(ParseError::InvalidHost);
    }
    Ok(())
}

/// Decode the fixed-length body in `buffer` into `request.body`.
///
/// The body must be exactly as long as announced and has its line endings normalized to LF. A
/// multipart/form-data body is reduced to its single file part, retargeted at the upload
/// directory, unless it is going to a CGI program.
pub fn parse_body(buffer: &[u8], request: &mut Request) -> Result<(), ParseError> {
    decode_body(buffer, request).map_err(|e| fail(request, e))
}

fn decode_body(buffer: &[u8], request: &mut Request) -> Result<(), ParseError> {
    if buffer.len() != request.content_length().unwrap_or(0) {
        return Err(ParseError::ContentLengthMismatch);
    }
    request.body = if request.has_multipart_formdata {
        buffer.to_vec()
    } else {
        normalize_line_endings(buffer)
    };
    decode_form(request)
}

fn decode_form(request: &mut Request) -> Result<(), ParseError> {
    if request.has_multipart_formdata && !request.has_cgi {
        decode_multipart(request)?;
    }
    Ok(())
}

/// Feed the start of `buffer` to `decoder` and return how many bytes it consumed; the caller
/// drops those and keeps the rest for the next call.
///
/// Once the last chunk is in, the decoded body is moved into `request.body` with its length
/// recorded as the content length, and handled like a fixed-length multipart body.
pub fn parse_chunks(
    decoder: &mut ChunkDecoder,
    buffer: &[u8],
    request: &mut Request,
) -> Result<usize, ParseError> {
    let consumed = decoder.advance(buffer).map_err(|e| fail(request, e))?;
    if decoder.is_done() {
        let body = std::mem::take(&mut decoder.body);
        request
            .headers
            .insert("content-length", body.len().to_string());
        request.body = body;
        decode_form(request).map_err(|e| fail(request, e))?;
    }
    Ok(consumed)
}

fn normalize_line_endings(buffer: &[u8]) -> Vec<u8> {
    let mut normalized = Vec::with_capacity(buffer.len());
    for (i, &c) in buffer.iter().enumerate() {
        let next = buffer.get(i + 1);
        if c == b'\r' && (next == Some(&b'\n') || next.is_none()) {
            continue;
        }
        normalized.push(c);
    }
    normalized
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let digits = match line.iter().position(|&c| c == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    if digits.is_empty() {
        return Err(ParseError::ChunkSizeMissing);
    }
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(ParseError::InvalidChunkSize);
    }
    digits.iter().try_fold(0usize, |size, &c| {
        size.checked_mul(16)
            .and_then(|size| size.checked_add(hex_to_digit(c) as usize))
            .ok_or(ParseError::ChunkTooLarge)
    })
}

/// Chunked transfer decoding that picks up where the previous read left off.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    body: Vec<u8>,
    done: bool,
}

impl ChunkDecoder {
    /// Decode the complete chunks at the start of `buffer`, returning the bytes they took. A
    /// partial chunk is left for a later call.
    pub fn advance(&mut self, buffer: &[u8]) -> Result<usize, ParseError> {
        let mut pos = 0;
        while !self.done {
            let rest = &buffer[pos..];
            let eol = match rest.iter().position(|&c| c == b'\n') {
                Some(eol) => eol,
                None => break,
            };
            let line = rest[..eol]
                .strip_suffix(b"\r")
                .ok_or(ParseError::MissingCrlf)?;
            let size = parse_chunk_size(line)?;
            let data = &rest[eol + 1..];

            if size == 0 {
                match data.get(..2) {
                    None => break,
                    Some(b"\r\n") => {}
                    Some(_) => return Err(ParseError::MissingCrlf),
                }
                self.done = true;
                pos += eol + 3;
                break;
            }
            let end = size.checked_add(2).ok_or(ParseError::ChunkTooLarge)?;
            match data.get(size..end) {
                None => break,
                Some(b"\r\n") => {}
                Some([b'\r', _]) | Some([b'\n', _]) => return Err(ParseError::MissingCrlf),
                Some(_) => return Err(ParseError::ChunkSizeMismatch),
            }
            self.body.extend_from_slice(&data[..size]);
            pos += eol + 1 + end;
        }
        Ok(pos)
    }

    /// Whether the terminating zero-size chunk was seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Body bytes decoded so far.
    pub fn decoded_len(&self) -> usize {
        self.body.len()
    }
}

/// Reduce a multipart/form-data body to its one file part.
pub fn decode_multipart(request: &mut Request) -> Result<(), ParseError> {
    let delimiter = format!("--{}", request.boundary).into_bytes();
    let mut next_delimiter = b"\r\n".to_vec();
    next_delimiter.extend_from_slice(&delimiter);

    let body = std::mem::take(&mut request.body);
    let mut rest = body
        .strip_prefix(delimiter.as_slice())
        .ok_or(ParseError::MultipartMissingBoundary)?;
    let mut upload = None;
    while !rest.starts_with(b"--") {
        rest = rest.strip_prefix(b"\r\n").ok_or(ParseError::MissingCrlf)?;
        let end = find(&next_delimiter, rest).ok_or(ParseError::MultipartMissingClosingBoundary)?;
        if let Some(part) = parse_part(&rest[..end])? {
            if upload.is_some() {
                return Err(ParseError::MultipleUploads);
            }
            upload = Some(part);
        }
        rest = &rest[end + next_delimiter.len()..];
    }
    let (filename, content) = upload.ok_or(ParseError::MultipartMissingFilename)?;

    let mut target = request.target_resource.clone();
    if !request.is_directory {
        let dir_end = target.rfind('/').map_or(0, |pos| pos + 1);
        target.truncate(dir_end);
    }
    if !target.ends_with('/') {
        target.push('/');
    }
    target.push_str(&filename);
    request.target_resource = target;
    request.is_directory = false;
    request.body = content.to_vec();
    request
        .headers
        .insert("content-length", request.body.len().to_string());
    Ok(())
}

/// File name and content of a file part, `None` for a plain form field.
fn parse_part(part: &[u8]) -> Result<Option<(String, &[u8])>, ParseError> {
    let split = find(b"\r\n\r\n", part).ok_or(ParseError::MultipartMissingSeparator)?;
    let headers = str::from_utf8(&part[..split]).map_err(|_| ParseError::BadMultipartFormdata)?;
    let mut disposition = None;
    let mut has_content_type = false;
    for line in headers.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-disposition") {
                disposition = Some(value.trim());
            } else if name.trim().eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
        }
    }
    let disposition = disposition.ok_or(ParseError::BadMultipartFormdata)?;
    if !disposition.to_ascii_lowercase().starts_with("form-data") {
        return Err(ParseError::BadMultipartFormdata);
    }
    let filename = match parameter(disposition, "filename") {
        Some(filename) => filename,
        None => return Ok(None),
    };
    if filename.is_empty() {
        return Err(ParseError::MultipartMissingFilename);
    }
    if filename.contains('/') || filename == "." || filename == ".." {
        return Err(ParseError::MultipartInvalidFilename);
    }
    if !has_content_type {
        return Err(ParseError::MultipartMissingContentType);
    }
    Ok(Some((filename.to_string(), &part[split + 4..])))
}
