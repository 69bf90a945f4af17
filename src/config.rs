//! Parsed configuration: global knobs, virtual servers and their locations.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::log::LogLevel;
use crate::request::Method;
use crate::status::StatusCode;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_ROOT: &str = "html";
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8 * 1024;
pub const DEFAULT_MAX_INDEX_DEPTH: usize = 8;
pub const DEFAULT_ERROR_LOG: &str = "stdout";

/// Settings for requests whose path starts with `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub root: String,
    /// Replaces the matched prefix instead of being prepended to the path.
    pub alias: Option<String>,
    pub indices: Vec<String>,
    pub autoindex: bool,
    pub allow_methods: Vec<Method>,
    pub cgi_ext: Option<String>,
    pub cgi_path: Option<String>,
    pub redirect: Option<(StatusCode, String)>,
    pub max_body_size: usize,
    pub error_pages: BTreeMap<u16, String>,
}

impl Location {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            root: DEFAULT_ROOT.to_string(),
            alias: None,
            indices: Vec::new(),
            autoindex: false,
            allow_methods: vec![Method::Get],
            cgi_ext: None,
            cgi_path: None,
            redirect: None,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            error_pages: BTreeMap::new(),
        }
    }

    pub fn allows(&self, method: Method) -> bool {
        self.allow_methods.contains(&method)
    }

    pub fn has_cgi(&self) -> bool {
        self.cgi_ext.is_some() && self.cgi_path.is_some()
    }
}

/// One virtual server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub server_name: Option<String>,
    pub root: String,
    pub max_body_size: usize,
    pub error_pages: BTreeMap<u16, String>,
    pub locations: Vec<Location>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            server_name: None,
            root: DEFAULT_ROOT.to_string(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            error_pages: BTreeMap::new(),
            locations: vec![Location::new("/")],
        }
    }
}

impl ServerConfig {
    /// Index of the location with the longest path prefix of `path`.
    pub fn find_location(&self, path: &str) -> Option<usize> {
        self.locations
            .iter()
            .enumerate()
            .filter(|(_, location)| path.starts_with(&location.path))
            .max_by_key(|(_, location)| location.path.len())
            .map(|(i, _)| i)
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub servers: Vec<ServerConfig>,
    pub client_timeout: Duration,
    pub max_header_size: usize,
    pub max_index_depth: usize,
    pub error_log: String,
    pub log_level: LogLevel,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_index_depth: DEFAULT_MAX_INDEX_DEPTH,
            error_log: DEFAULT_ERROR_LOG.to_string(),
            log_level: LogLevel::default(),
        }
    }
}

impl ConfigFile {
    /// Pick the virtual server for a request that arrived on `local_host:local_port`.
    ///
    /// Servers bound to exactly that address win over wildcard ones. Among those, the one whose
    /// `server_name` equals the Host header (without port) is chosen, otherwise the first.
    pub fn select_server(&self, local_host: &str, local_port: u16, host_header: Option<&str>) -> usize {
        let on_port = |host: &str| {
            self.servers
                .iter()
                .enumerate()
                .filter(|(_, server)| server.port == local_port && server.host == host)
                .map(|(i, _)| i)
                .collect::<Vec<_>>()
        };
        let mut candidates = on_port(local_host);
        if candidates.is_empty() {
            candidates = on_port(DEFAULT_HOST);
        }
        let name = host_header.map(strip_port);
        candidates
            .iter()
            .copied()
            .find(|&i| match (&self.servers[i].server_name, name) {
                (Some(server_name), Some(name)) => server_name.eq_ignore_ascii_case(name),
                _ => false,
            })
            .or_else(|| candidates.first().copied())
            .unwrap_or(0)
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split(']').next().map_or(host, |name| &name[1..]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
