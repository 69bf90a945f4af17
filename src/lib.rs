//! A single-process HTTP/1.1 server with virtual hosts, static files, uploads and CGI.

pub mod autoindex;
pub mod cgi;
pub mod config;
pub mod config_parser;
pub mod connection;
pub mod fd;
pub mod log;
pub mod mime;
pub mod parser;
pub mod poller;
pub mod request;
pub mod response;
pub mod server;
pub mod status;
pub mod sys;
pub mod target;
pub mod util;

#[cfg(test)]
mod mock;
