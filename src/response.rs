//! Turning a resolved request, or a CGI program's output, into response bytes.

use std::fmt;
use std::time::SystemTime;

use crate::autoindex::generate_listing;
use crate::config::ServerConfig;
use crate::mime::MimeMap;
use crate::request::{Method, Request};
use crate::status::StatusCode;
use crate::sys::{FileSystemOps, FileType};
use crate::target::{io_status, TargetResolver};
use crate::util::{find, HeaderEncoded, HtmlEscaped, HttpDate, JsonEscaped, ShortDate};

pub const SERVER_SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const HTML: &str = "text/html; charset=UTF-8";
const JSON: &str = "application/json";

/// Signature line at the bottom of generated pages.
pub struct GeneratedOn(pub SystemTime);

impl fmt::Display for GeneratedOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Generated by {} on {}", SERVER_SOFTWARE, HttpDate(self.0))
    }
}

/// A serialized response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub content: Vec<u8>,
    pub body_length: usize,
}

/// Builds responses for one virtual server.
pub struct ResponseBuilder<'a, F> {
    fs: &'a F,
    mime: &'a MimeMap,
    server: &'a ServerConfig,
    max_depth: usize,
}

struct Body {
    content_type: String,
    content: Vec<u8>,
    extra_headers: Vec<(String, String)>,
}

impl Body {
    fn new(content_type: &str, content: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.to_string(),
            content: content.into(),
            extra_headers: Vec::new(),
        }
    }
}

impl<'a, F: FileSystemOps> ResponseBuilder<'a, F> {
    pub fn new(fs: &'a F, mime: &'a MimeMap, server: &'a ServerConfig, max_depth: usize) -> Self {
        Self {
            fs,
            mime,
            server,
            max_depth,
        }
    }

    /// Serve the resolved request: file contents, listing, upload, deletion or an error page.
    /// Failures while doing so update `request.http_status`.
    pub fn build(&self, request: &mut Request, location: Option<usize>, now: SystemTime) -> Response {
        let mut body = None;
        if !request.http_status.is_error_or_redirect() {
            match self.serve(request, now) {
                Ok((status, served)) => {
                    request.http_status = status;
                    body = Some(served);
                }
                Err(status) => request.http_status = status,
            }
        }
        let body = match body {
            Some(body) => body,
            None => self.error_body(request, location, now),
        };
        self.serialize(request, body, now)
    }

    /// Serve the output of a finished CGI program.
    pub fn build_cgi(
        &self,
        request: &mut Request,
        location: Option<usize>,
        output: &[u8],
        now: SystemTime,
    ) -> Response {
        match parse_cgi_output(output) {
            Some((status, body)) => {
                request.http_status = status;
                if let Some((_, location)) = body
                    .extra_headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("location"))
                {
                    request.target_resource = location.clone();
                }
                if status.is_error_or_redirect() && body.content.is_empty() {
                    let mut error_body = self.error_body(request, location, now);
                    error_body.extra_headers = body.extra_headers;
                    return self.serialize(request, error_body, now);
                }
                self.serialize(request, body, now)
            }
            None => {
                request.http_status = StatusCode::INTERNAL_SERVER_ERROR;
                let body = self.error_body(request, location, now);
                self.serialize(request, body, now)
            }
        }
    }

    fn serve(&self, request: &Request, now: SystemTime) -> Result<(StatusCode, Body), StatusCode> {
        if request.has_autoindex {
            let listing = generate_listing(
                self.fs,
                &request.target_resource,
                &request.uri.path,
                now,
            )
            .map_err(|e| io_status(&e))?;
            return Ok((StatusCode::OK, Body::new(HTML, listing)));
        }
        match request.method {
            Some(Method::Post) => self.upload(request),
            Some(Method::Delete) => self.delete(request),
            _ => {
                let content = self
                    .fs
                    .get_file_contents(&request.target_resource)
                    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
                let content_type = self.mime.content_type(&request.target_resource);
                Ok((StatusCode::OK, Body::new(content_type, content)))
            }
        }
    }

    fn upload(&self, request: &Request) -> Result<(StatusCode, Body), StatusCode> {
        if request.is_directory {
            return Err(StatusCode::FORBIDDEN);
        }
        let target = &request.target_resource;
        let existed = matches!(self.fs.check_file_type(target), Ok(FileType::Regular));
        self.fs
            .write_to_file(target, &request.body)
            .map_err(|e| io_status(&e))?;
        let stat = self.fs.get_file_stat(target).map_err(|e| io_status(&e))?;
        let (status, state) = if existed {
            (StatusCode::OK, "updated")
        } else {
            (StatusCode::CREATED, "created")
        };
        let json = format!(
            "{{\"message\": \"File {} successfully\", \"file\": \"{}\", \"file_size\": {}, \
            \"last_modified\": \"{}\", \"status\": \"{}\"}}\n",
            state,
            JsonEscaped(target),
            stat.size,
            ShortDate(stat.modified),
            state,
        );
        Ok((status, Body::new(JSON, json)))
    }

    fn delete(&self, request: &Request) -> Result<(StatusCode, Body), StatusCode> {
        let target = &request.target_resource;
        if request.is_directory {
            return Err(StatusCode::FORBIDDEN);
        }
        match self.fs.check_file_type(target) {
            Ok(FileType::Regular) => {}
            Ok(FileType::NotFound) => return Err(StatusCode::NOT_FOUND),
            Ok(_) => return Err(StatusCode::FORBIDDEN),
            Err(e) => return Err(io_status(&e)),
        }
        self.fs.delete_file(target).map_err(|e| io_status(&e))?;
        let json = format!(
            "{{\"message\": \"File deleted successfully\", \"file\": \"{}\"}}\n",
            JsonEscaped(target)
        );
        Ok((StatusCode::OK, Body::new(JSON, json)))
    }

    /// Redirect page, configured error page or the built-in default page.
    fn error_body(&self, request: &Request, location: Option<usize>, now: SystemTime) -> Body {
        let status = request.http_status;
        if status.is_redirect() {
            let target = &request.target_resource;
            return Body::new(
                HTML,
                format!(
                    "<html><head><title>{}</title></head><body>\n\
                    <h1>{}</h1>\n\
                    Moved to: <a href=\"{}\">{}</a>\n\
                    <hr>\n\
                    {}\
                    </body></html>\n",
                    status,
                    status.reason_phrase(),
                    HtmlEscaped(target),
                    HtmlEscaped(target),
                    GeneratedOn(now),
                ),
            );
        }
        let pages = match location {
            Some(index) => &self.server.locations[index].error_pages,
            None => &self.server.error_pages,
        };
        if let Some(page) = pages.get(&status.as_u16()) {
            if let Some(content) = self.read_error_page(page) {
                return Body::new(self.mime.content_type(page), content);
            }
        }
        Body::new(
            HTML,
            format!(
                "<html><head><title>{}</title></head><body>\n\
                <h1>{}</h1>\n\
                <hr>\n\
                {}\
                </body></html>\n",
                status,
                status,
                GeneratedOn(now),
            ),
        )
    }

    fn read_error_page(&self, uri: &str) -> Option<Vec<u8>> {
        let resolution =
            TargetResolver::new(self.fs, self.server, self.max_depth).resolve(Method::Get, uri, 0);
        if resolution.status != StatusCode::OK || resolution.has_autoindex || resolution.has_cgi {
            return None;
        }
        self.fs.get_file_contents(&resolution.target).ok()
    }

    fn serialize(&self, request: &Request, body: Body, now: SystemTime) -> Response {
        let status = request.http_status;
        let mut head = format!(
            "HTTP/1.1 {}\r\n\
            Server: {}\r\n\
            Date: {}\r\n\
            Content-Type: {}\r\n\
            Content-Length: {}\r\n",
            status,
            SERVER_SOFTWARE,
            HttpDate(now),
            body.content_type,
            body.content.len(),
        );
        let has_location = body
            .extra_headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("location"));
        if status.is_redirect() && !has_location {
            head.push_str(&format!(
                "Location: {}\r\n",
                HeaderEncoded(&request.target_resource)
            ));
        }
        for (name, value) in &body.extra_headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(if request.shall_close_connection {
            "Connection: close\r\n\r\n"
        } else {
            "Connection: keep-alive\r\n\r\n"
        });
        let body_length = body.content.len();
        let mut content = head.into_bytes();
        content.extend_from_slice(&body.content);
        Response {
            status,
            content,
            body_length,
        }
    }
}

/// Split CGI output into status and body, keeping headers other than `Status` and `Content-Type`.
/// `None` if the output has no header block.
fn parse_cgi_output(output: &[u8]) -> Option<(StatusCode, Body)> {
    let (head_end, body_start) = match (find(b"\r\n\r\n", output), find(b"\n\n", output)) {
        (Some(crlf), Some(lf)) if lf < crlf => (lf, lf + 2),
        (Some(crlf), _) => (crlf, crlf + 4),
        (None, Some(lf)) => (lf, lf + 2),
        (None, None) => return None,
    };
    let head = std::str::from_utf8(&output[..head_end]).ok()?;
    let mut status = None;
    let mut body = Body::new(HTML, &output[body_start..]);
    let mut has_location = false;
    for line in head.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let (name, value) = line.split_once(':')?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            let code = value.split(' ').next()?.parse::<u16>().ok()?;
            status = Some(StatusCode::from_u16(code)?);
        } else if name.eq_ignore_ascii_case("content-type") {
            body.content_type = value.to_string();
        } else if name.eq_ignore_ascii_case("content-length") {
            // recomputed from the body
        } else {
            if name.eq_ignore_ascii_case("location") {
                has_location = true;
            }
            body.extra_headers.push((name.trim().to_string(), value.to_string()));
        }
    }
    let status = match status {
        Some(status) => status,
        None if has_location => StatusCode::FOUND,
        None => StatusCode::OK,
    };
    Some((status, body))
}
