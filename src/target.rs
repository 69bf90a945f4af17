//! Mapping a request path onto a location and a filesystem resource.

use std::io;

use crate::config::{Location, ServerConfig};
use crate::request::{Method, Request};
use crate::status::StatusCode;
use crate::sys::{FileSystemOps, FileType};

/// Outcome of resolving one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub location: Option<usize>,
    pub status: StatusCode,
    pub target: String,
    pub script_name: String,
    pub path_info: String,
    pub has_cgi: bool,
    pub has_autoindex: bool,
    pub has_return: bool,
    pub is_directory: bool,
}

impl Resolution {
    fn new(status: StatusCode) -> Self {
        Self {
            location: None,
            status,
            target: String::new(),
            script_name: String::new(),
            path_info: String::new(),
            has_cgi: false,
            has_autoindex: false,
            has_return: false,
            is_directory: false,
        }
    }

    fn fail(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Copy the outcome onto the request.
    pub fn apply(self, request: &mut Request) -> Option<usize> {
        request.http_status = self.status;
        request.target_resource = self.target;
        request.script_name = self.script_name;
        request.path_info = self.path_info;
        request.has_cgi = self.has_cgi;
        request.has_autoindex = self.has_autoindex;
        request.has_return = self.has_return;
        request.is_directory = self.is_directory;
        self.location
    }
}

/// Status for a failed filesystem operation on the target.
pub fn io_status(e: &io::Error) -> StatusCode {
    match e.kind() {
        io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Resolves request paths against one virtual server.
pub struct TargetResolver<'a, F> {
    fs: &'a F,
    server: &'a ServerConfig,
    max_depth: usize,
}

impl<'a, F: FileSystemOps> TargetResolver<'a, F> {
    pub fn new(fs: &'a F, server: &'a ServerConfig, max_depth: usize) -> Self {
        Self {
            fs,
            server,
            max_depth,
        }
    }

    /// Resolve the request's path for its method and record the result on the request.
    /// Returns the index of the matched location.
    pub fn execute(&self, request: &mut Request) -> Option<usize> {
        let method = request.method.unwrap_or(Method::Get);
        let path = request.uri.path.clone();
        self.resolve(method, &path, 0).apply(request)
    }

    pub fn resolve(&self, method: Method, path: &str, depth: usize) -> Resolution {
        let mut resolution = Resolution::new(StatusCode::OK);
        if depth >= self.max_depth {
            return resolution.fail(StatusCode::INTERNAL_SERVER_ERROR);
        }
        let index = match self.server.find_location(path) {
            Some(index) => index,
            None => return resolution.fail(StatusCode::NOT_FOUND),
        };
        resolution.location = Some(index);
        let location = &self.server.locations[index];

        if let Some((status, target)) = &location.redirect {
            resolution.has_return = true;
            resolution.target = target.clone();
            return resolution.fail(*status);
        }
        if !location.allows(method) {
            return resolution.fail(StatusCode::METHOD_NOT_ALLOWED);
        }
        resolution.target = map_path(location, path);

        if let Some((script_name, path_info)) = split_script(location, path) {
            resolution.has_cgi = true;
            resolution.target = map_path(location, script_name);
            resolution.script_name = script_name.to_string();
            resolution.path_info = path_info.to_string();
            return match self.fs.check_file_type(&resolution.target) {
                Ok(FileType::Regular) => resolution,
                Ok(_) => resolution.fail(StatusCode::NOT_FOUND),
                Err(e) => resolution.fail(io_status(&e)),
            };
        }

        match method {
            Method::Post => self.resolve_upload(resolution),
            Method::Delete => self.resolve_delete(resolution),
            Method::Get => self.resolve_file(resolution, location, path, depth),
        }
    }

    fn resolve_upload(&self, resolution: Resolution) -> Resolution {
        match self.fs.check_file_type(&resolution.target) {
            Ok(FileType::Directory) => Resolution {
                is_directory: true,
                ..resolution
            },
            Ok(FileType::Regular) | Ok(FileType::NotFound) => resolution,
            Ok(FileType::Other) => resolution.fail(StatusCode::FORBIDDEN),
            Err(e) => resolution.fail(io_status(&e)),
        }
    }

    fn resolve_delete(&self, resolution: Resolution) -> Resolution {
        match self.fs.check_file_type(&resolution.target) {
            Ok(FileType::Regular) => resolution,
            Ok(FileType::Directory) => Resolution {
                is_directory: true,
                ..resolution
            },
            Ok(FileType::Other) => resolution.fail(StatusCode::FORBIDDEN),
            Ok(FileType::NotFound) => resolution.fail(StatusCode::NOT_FOUND),
            Err(e) => resolution.fail(io_status(&e)),
        }
    }

    fn resolve_file(
        &self,
        mut resolution: Resolution,
        location: &Location,
        path: &str,
        depth: usize,
    ) -> Resolution {
        match self.fs.check_file_type(&resolution.target) {
            Ok(FileType::Regular) => resolution,
            Ok(FileType::Directory) => {
                resolution.is_directory = true;
                if !path.ends_with('/') {
                    resolution.target = format!("{}/", path);
                    return resolution.fail(StatusCode::MOVED_PERMANENTLY);
                }
                for index in &location.indices {
                    let candidate = self.resolve(Method::Get, &format!("{}{}", path, index), depth + 1);
                    if candidate.status != StatusCode::NOT_FOUND && !candidate.has_return {
                        return candidate;
                    }
                }
                if location.autoindex {
                    resolution.has_autoindex = true;
                    resolution
                } else {
                    resolution.fail(StatusCode::FORBIDDEN)
                }
            }
            Ok(FileType::Other) => resolution.fail(StatusCode::FORBIDDEN),
            Ok(FileType::NotFound) => resolution.fail(StatusCode::NOT_FOUND),
            Err(e) => resolution.fail(io_status(&e)),
        }
    }
}

/// Filesystem path for `path` under `location`: the alias replaces the matched prefix, a root is
/// prepended to the whole path.
pub fn map_path(location: &Location, path: &str) -> String {
    match &location.alias {
        Some(alias) => {
            let rest = &path[location.path.len().min(path.len())..];
            match (alias.ends_with('/'), rest.strip_prefix('/')) {
                (true, Some(rest)) => format!("{}{}", alias, rest),
                (false, None) if !rest.is_empty() => format!("{}/{}", alias, rest),
                _ => format!("{}{}", alias, rest),
            }
        }
        None => format!("{}{}", location.root.trim_end_matches('/'), path),
    }
}

/// Split `path` into script name and path info when the location runs a CGI program for it.
fn split_script<'p>(location: &Location, path: &'p str) -> Option<(&'p str, &'p str)> {
    if !location.has_cgi() {
        return None;
    }
    let ext = location.cgi_ext.as_deref()?;
    path.match_indices(ext)
        .map(|(pos, _)| pos + ext.len())
        .find(|&end| end == path.len() || path[end..].starts_with('/'))
        .map(|end| path.split_at(end))
}
