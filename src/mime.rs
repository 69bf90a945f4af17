use std::collections::HashMap;

use crate::util::extension;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/javascript  js mjs",
    "application/json        json",
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "image/x-icon            ico",
    "text/css                css",
    "text/html               html htm",
    "text/plain              txt asc",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
    "video/mp4               mp4",
];

/// Maps file extensions to content types.
#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    default_mimetype: String,
}

impl MimeMap {
    /// Add line from an extension map.
    pub fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| matches!(c, ' ' | '\t'))
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for extension in fields {
            self.mimetypes
                .insert(extension.to_ascii_lowercase(), mimetype.to_string());
        }
    }

    /// Get content type for a filesystem path or URL.
    pub fn content_type(&self, path: &str) -> &str {
        extension(path)
            .and_then(|extension| self.mimetypes.get(&extension.to_ascii_lowercase()))
            .unwrap_or(&self.default_mimetype)
    }
}

impl Default for MimeMap {
    /// Create MimeMap using the default extension map.
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("/index.html", "text/html")]
    #[test_case("/img/LOGO.PNG", "image/png")]
    #[test_case("/notes.txt", "text/plain")]
    #[test_case("/binary", DEFAULT_MIME_TYPE ; "no extension")]
    #[test_case("/archive.unknown", DEFAULT_MIME_TYPE ; "unknown extension")]
    fn content_type_works(path: &str, expected: &str) {
        assert_eq!(MimeMap::default().content_type(path), expected);
    }

    #[test]
    fn later_lines_override() {
        let mut mime_map = MimeMap::default();
        mime_map.add_mimetype_line("# comment html");
        mime_map.add_mimetype_line("");
        mime_map.add_mimetype_line("text/x-custom\thtml");
        assert_eq!(mime_map.content_type("/a.html"), "text/x-custom");
    }
}
