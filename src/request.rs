use std::collections::BTreeMap;
use std::str::FromStr;

use crate::status::StatusCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "DELETE" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded request target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uri {
    pub path: String,
    pub query: String,
    pub fragment: String,
}

/// Header fields keyed by lowercased name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.to_ascii_lowercase(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One HTTP request as it is parsed and resolved.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Option<Method>,
    pub uri: Uri,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub has_body: bool,
    pub is_chunked: bool,
    pub has_multipart_formdata: bool,
    pub boundary: String,
    pub has_cgi: bool,
    pub has_autoindex: bool,
    pub has_return: bool,
    pub is_directory: bool,
    pub shall_close_connection: bool,
    pub http_status: StatusCode,
    /// Filesystem path, upload path or redirect URL.
    pub target_resource: String,
    /// Script part of the path when it is served by a CGI program.
    pub script_name: String,
    /// Path after the script name, passed to the CGI program.
    pub path_info: String,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: None,
            uri: Uri::default(),
            version: String::new(),
            headers: Headers::default(),
            body: Vec::new(),
            has_body: false,
            is_chunked: false,
            has_multipart_formdata: false,
            boundary: String::new(),
            has_cgi: false,
            has_autoindex: false,
            has_return: false,
            is_directory: false,
            shall_close_connection: false,
            http_status: StatusCode::OK,
            target_resource: String::new(),
            script_name: String::new(),
            path_info: String::new(),
        }
    }
}

impl Request {
    /// Reset to an empty request, ready for the next one on a kept-alive connection.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get("content-length")
            .and_then(|value| value.parse().ok())
    }

    /// Request line as written by the client, for logging.
    pub fn request_line(&self) -> String {
        let mut target = self.uri.path.clone();
        if !self.uri.query.is_empty() {
            target.push('?');
            target.push_str(&self.uri.query);
        }
        format!(
            "{} {} HTTP/{}",
            self.method.map(Method::as_str).unwrap_or("-"),
            target,
            if self.version.is_empty() {
                "1.1"
            } else {
                &self.version
            }
        )
    }
}
