use std::time::SystemTime;

use chrono::{DateTime, Local, Utc};

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl std::fmt::Display for HttpDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub SystemTime);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Modification time as shown in directory listings and upload reports.
pub struct ShortDate(pub SystemTime);

impl std::fmt::Display for ShortDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Encode string to be an RFC3986-compliant URL path. Slashes are kept.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0.bytes() {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'/') {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{:02X}", b)?;
            }
        }
        Ok(())
    }
}

/// Percent-encode bytes that are not visible ASCII, so the value stays on one header line.
pub struct HeaderEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for HeaderEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0.bytes() {
            if b.is_ascii_graphic() {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{:02X}", b)?;
            }
        }
        Ok(())
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> std::fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Escape a string for embedding in a JSON string literal.
pub struct JsonEscaped<'a>(pub &'a str);

impl<'a> std::fmt::Display for JsonEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '"' => write!(f, "\\\"")?,
                '\\' => write!(f, "\\\\")?,
                '\n' => write!(f, "\\n")?,
                '\r' => write!(f, "\\r")?,
                '\t' => write!(f, "\\t")?,
                c if c.is_control() => write!(f, "\\u{:04x}", c as u32)?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Encode string for logging. Logs should not contain control characters or double quotes.
pub struct LogEncoded<'a>(pub &'a str);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// Convert hex digit to integer.
pub fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Return index of first occurrence of `needle` in `haystack`.
pub fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// File extension of the last path segment, without the dot.
pub fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rfind('.')
        .filter(|&dot| dot + 1 < name.len())
        .map(|dot| &name[dot + 1..])
}

#[cfg(test)]
mod test {
    use super::*;

    use std::time::Duration;

    use test_case::test_case;

    #[test]
    fn url_encoded_works() {
        assert_eq!(
            UrlEncoded("/escape(this)name\tcrab\u{1F980}").to_string(),
            "/escape%28this%29name%09crab%F0%9F%A6%80"
        );
    }

    #[test_case("/dir/", "/dir/")]
    #[test_case("http://example.test/a?b=c", "http://example.test/a?b=c")]
    #[test_case("/a\r\nSet-Cookie: x/", "/a%0D%0ASet-Cookie:%20x/")]
    #[test_case("/caf\u{e9}/", "/caf%C3%A9/")]
    fn header_encoded_works(value: &str, expected: &str) {
        assert_eq!(HeaderEncoded(value).to_string(), expected);
    }

    #[test]
    fn html_escaped_works() {
        assert_eq!(
            HtmlEscaped("foo<>&'\"").to_string(),
            "foo&lt;&gt;&amp;&apos;&quot;"
        );
    }

    #[test]
    fn json_escaped_works() {
        assert_eq!(
            JsonEscaped("a\"b\\c\nd").to_string(),
            "a\\\"b\\\\c\\nd"
        );
    }

    #[test]
    fn log_encoded_works() {
        assert_eq!(
            LogEncoded("some\"log\tcrab\u{1F980}").to_string(),
            "some%22log%09crab%F0%9F%A6%80"
        );
    }

    #[test]
    fn clf_date_works() {
        // contains system's local timezone
        assert!(
            ClfDate(SystemTime::UNIX_EPOCH + Duration::from_secs(1620965123))
                .to_string()
                .contains("May/2021")
        );
    }

    #[test]
    fn http_date_works() {
        assert_eq!(
            HttpDate(SystemTime::UNIX_EPOCH + Duration::from_secs(1622040683)).to_string(),
            "Wed, 26 May 2021 14:51:23 GMT"
        );
    }

    #[test]
    fn short_date_works() {
        assert_eq!(
            ShortDate(SystemTime::UNIX_EPOCH + Duration::from_secs(1622040683)).to_string(),
            "2021-05-26 14:51:23"
        );
    }

    #[test_case(b"\r\n\r\n", b"GET / HTTP/1.1\r\n\r\n", Some(14) ; "header end")]
    #[test_case(b"xyz", b"abc", None ; "missing")]
    #[test_case(b"", b"abc", Some(0) ; "empty needle")]
    fn find_works(needle: &[u8], haystack: &[u8], expected: Option<usize>) {
        assert_eq!(find(needle, haystack), expected);
    }

    #[test_case("/index.html", Some("html"))]
    #[test_case("/dir.d/file", None)]
    #[test_case("/archive.tar.gz", Some("gz"))]
    #[test_case("/trailing.", None)]
    fn extension_works(path: &str, expected: Option<&str>) {
        assert_eq!(extension(path), expected);
    }
}
