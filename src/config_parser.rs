//! Reader for the nginx-like configuration file.
//!
//! ```text
//! http {
//!     client_timeout 30;
//!     server {
//!         listen 127.0.0.1:8080;
//!         root /var/www;
//!         location /upload { allow_methods GET POST; }
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::config::{ConfigFile, Location, ServerConfig};
use crate::log::LogLevel;
use crate::request::Method;
use crate::status::StatusCode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to open config file")]
    Open(#[source] io::Error),
    #[error("Config file is empty")]
    Empty,
    #[error("Missing http block")]
    MissingHttpBlock,
    #[error("Missing server block(s)")]
    MissingServerBlock,
    #[error("Open bracket(s) in config file")]
    OpenBrackets,
    #[error("Unexpected '}}'")]
    UnexpectedClosingBracket,
    #[error("Open double quotes")]
    OpenDoubleQuotes,
    #[error("Missing ';' after '{0}' directive")]
    MissingSemicolon(String),
    #[error("Invalid directive")]
    InvalidDirective,
    #[error("Invalid server directive")]
    InvalidServerDirective,
    #[error("Invalid location directive")]
    InvalidLocationDirective,
    #[error("Duplicate location")]
    DuplicateLocation,
    #[error("Location path does not start with a slash")]
    LocationNoSlash,
    #[error("'{0}' directive has no value")]
    NoValue(String),
    #[error("Invalid amount of parameters for {0}")]
    ParameterCount(String),
    #[error("Invalid value for {0}")]
    InvalidValue(String),
    #[error("Invalid ip address")]
    InvalidIp,
    #[error("Invalid port")]
    InvalidPort,
    #[error("More than one listen directive")]
    MultipleListen,
    #[error("Root path does not start with a slash")]
    RootNoSlash,
    #[error("Alias path does not start with a slash")]
    AliasNoSlash,
    #[error("CGI path does not start with a slash")]
    CgiPathNoSlash,
    #[error("Error page path does not start with a slash")]
    ErrorPageNoSlash,
    #[error("More than one root path")]
    MultipleRoot,
    #[error("More than one alias path")]
    MultipleAlias,
    #[error("More than one server name")]
    MultipleServerName,
    #[error("More than one CGI extension")]
    MultipleCgiExt,
    #[error("More than one CGI path")]
    MultipleCgiPath,
    #[error("Defining root and alias in the same location block is not allowed")]
    RootAndAlias,
    #[error("Invalid client_max_body_size value")]
    InvalidBodySize,
    #[error("Invalid client_max_body_size unit")]
    InvalidBodySizeUnit,
    #[error("Invalid client_max_body_size number: Overflow")]
    BodySizeOverflow,
    #[error("Invalid autoindex value")]
    InvalidAutoindex,
    #[error("Invalid allow_methods value")]
    InvalidAllowMethods,
    #[error("Invalid CGI extension")]
    InvalidCgiExt,
    #[error("Invalid return code")]
    InvalidReturnCode,
    #[error("Invalid error code")]
    InvalidErrorCode,
}

/// Read and parse the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let input = fs::read_to_string(path).map_err(ConfigError::Open)?;
    parse_config(&input)
}

pub fn parse_config(input: &str) -> Result<ConfigFile, ConfigError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ConfigError::Empty);
    }
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_file()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    OpenBrace,
    CloseBrace,
    Semicolon,
}

fn is_delimiter(c: char) -> bool {
    c.is_ascii_whitespace() || matches!(c, '{' | '}' | ';' | '#' | '"')
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConfigError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '{' => {
                chars.next();
                tokens.push(Token::OpenBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::CloseBrace);
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semicolon);
            }
            '#' => {
                for ch in chars.by_ref() {
                    if ch == '\n' {
                        break;
                    }
                }
            }
            '"' => {
                chars.next();
                let mut word = String::new();
                let mut terminated = false;
                for ch in chars.by_ref() {
                    if ch == '"' {
                        terminated = true;
                        break;
                    }
                    word.push(ch);
                }
                if !terminated {
                    return Err(ConfigError::OpenDoubleQuotes);
                }
                tokens.push(Token::Word(word));
            }
            c if c.is_ascii_whitespace() => {
                chars.next();
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if is_delimiter(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

/// Location settings that fall back to the server's when absent.
struct ParsedLocation {
    location: Location,
    root: Option<String>,
    max_body_size: Option<usize>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse_file(&mut self) -> Result<ConfigFile, ConfigError> {
        match self.next() {
            Some(Token::Word(word)) if word == "http" => {}
            Some(Token::CloseBrace) => return Err(ConfigError::UnexpectedClosingBracket),
            _ => return Err(ConfigError::MissingHttpBlock),
        }
        if self.next() != Some(Token::OpenBrace) {
            return Err(ConfigError::MissingHttpBlock);
        }
        let config = self.parse_http()?;
        match self.next() {
            None => Ok(config),
            Some(Token::CloseBrace) => Err(ConfigError::UnexpectedClosingBracket),
            Some(_) => Err(ConfigError::InvalidDirective),
        }
    }

    fn parse_http(&mut self) -> Result<ConfigFile, ConfigError> {
        let mut config = ConfigFile::default();
        loop {
            let name = match self.next() {
                Some(Token::CloseBrace) => break,
                Some(Token::Word(name)) => name,
                None => return Err(ConfigError::OpenBrackets),
                Some(_) => return Err(ConfigError::InvalidDirective),
            };
            if name == "server" {
                if self.next() != Some(Token::OpenBrace) {
                    return Err(ConfigError::InvalidDirective);
                }
                config.servers.push(self.parse_server()?);
                continue;
            }
            let args = self.arguments(&name)?;
            match name.as_str() {
                "client_timeout" => {
                    let seconds = parse_number(&name, single(&name, &args)?)?;
                    config.client_timeout = Duration::from_secs(seconds as u64);
                }
                "client_max_header_size" => {
                    config.max_header_size = parse_size(single(&name, &args)?)
                        .map_err(|_| ConfigError::InvalidValue(name.clone()))?;
                }
                "max_index_depth" => {
                    config.max_index_depth = parse_number(&name, single(&name, &args)?)?;
                }
                "error_log" => config.error_log = single(&name, &args)?.to_string(),
                "log_level" => {
                    config.log_level = single(&name, &args)?
                        .parse::<LogLevel>()
                        .map_err(|_| ConfigError::InvalidValue(name.clone()))?;
                }
                _ => return Err(ConfigError::InvalidDirective),
            }
        }
        if config.servers.is_empty() {
            return Err(ConfigError::MissingServerBlock);
        }
        Ok(config)
    }

    fn parse_server(&mut self) -> Result<ServerConfig, ConfigError> {
        let mut server = ServerConfig {
            locations: Vec::new(),
            ..ServerConfig::default()
        };
        let mut listen_seen = false;
        let mut root_seen = false;
        let mut parsed_locations: Vec<ParsedLocation> = Vec::new();
        loop {
            let name = match self.next() {
                Some(Token::CloseBrace) => break,
                Some(Token::Word(name)) => name,
                None => return Err(ConfigError::OpenBrackets),
                Some(_) => return Err(ConfigError::InvalidServerDirective),
            };
            if name == "location" {
                let path = match self.next() {
                    Some(Token::Word(path)) => path,
                    _ => return Err(ConfigError::NoValue(name)),
                };
                if !path.starts_with('/') {
                    return Err(ConfigError::LocationNoSlash);
                }
                if self.next() != Some(Token::OpenBrace) {
                    return Err(ConfigError::ParameterCount(name));
                }
                if parsed_locations.iter().any(|p| p.location.path == path) {
                    return Err(ConfigError::DuplicateLocation);
                }
                parsed_locations.push(self.parse_location(&path)?);
                continue;
            }
            let args = self.arguments(&name)?;
            match name.as_str() {
                "listen" => {
                    if listen_seen {
                        return Err(ConfigError::MultipleListen);
                    }
                    listen_seen = true;
                    let (host, port) = parse_listen(single(&name, &args)?)?;
                    server.host = host;
                    server.port = port;
                }
                "server_name" => {
                    if server.server_name.is_some() {
                        return Err(ConfigError::MultipleServerName);
                    }
                    server.server_name = Some(single(&name, &args)?.to_string());
                }
                "root" => {
                    if root_seen {
                        return Err(ConfigError::MultipleRoot);
                    }
                    root_seen = true;
                    server.root = absolute(single(&name, &args)?, ConfigError::RootNoSlash)?;
                }
                "client_max_body_size" => {
                    server.max_body_size = parse_size(single(&name, &args)?)?;
                }
                "error_page" => parse_error_page(&name, &args, &mut server.error_pages)?,
                _ => return Err(ConfigError::InvalidServerDirective),
            }
        }

        if parsed_locations.is_empty() {
            parsed_locations.push(ParsedLocation {
                location: Location::new("/"),
                root: None,
                max_body_size: None,
            });
        }
        for parsed in parsed_locations {
            let mut location = parsed.location;
            location.root = parsed.root.unwrap_or_else(|| server.root.clone());
            location.max_body_size = parsed.max_body_size.unwrap_or(server.max_body_size);
            for (code, page) in &server.error_pages {
                location
                    .error_pages
                    .entry(*code)
                    .or_insert_with(|| page.clone());
            }
            server.locations.push(location);
        }
        Ok(server)
    }

    fn parse_location(&mut self, path: &str) -> Result<ParsedLocation, ConfigError> {
        let mut parsed = ParsedLocation {
            location: Location::new(path),
            root: None,
            max_body_size: None,
        };
        let location = &mut parsed.location;
        loop {
            let name = match self.next() {
                Some(Token::CloseBrace) => break,
                Some(Token::Word(name)) => name,
                None => return Err(ConfigError::OpenBrackets),
                Some(_) => return Err(ConfigError::InvalidLocationDirective),
            };
            let args = self.arguments(&name)?;
            match name.as_str() {
                "root" => {
                    if parsed.root.is_some() {
                        return Err(ConfigError::MultipleRoot);
                    }
                    if location.alias.is_some() {
                        return Err(ConfigError::RootAndAlias);
                    }
                    parsed.root = Some(absolute(single(&name, &args)?, ConfigError::RootNoSlash)?);
                }
                "alias" => {
                    if location.alias.is_some() {
                        return Err(ConfigError::MultipleAlias);
                    }
                    if parsed.root.is_some() {
                        return Err(ConfigError::RootAndAlias);
                    }
                    location.alias = Some(absolute(single(&name, &args)?, ConfigError::AliasNoSlash)?);
                }
                "index" => {
                    if args.is_empty() {
                        return Err(ConfigError::NoValue(name.clone()));
                    }
                    location.indices.extend(args);
                }
                "autoindex" => {
                    let value = single(&name, &args)?;
                    location.autoindex = if value.eq_ignore_ascii_case("on") {
                        true
                    } else if value.eq_ignore_ascii_case("off") {
                        false
                    } else {
                        return Err(ConfigError::InvalidAutoindex);
                    };
                }
                "allow_methods" => {
                    if args.is_empty() {
                        return Err(ConfigError::NoValue(name.clone()));
                    }
                    location.allow_methods.clear();
                    for arg in &args {
                        let method = arg
                            .parse::<Method>()
                            .map_err(|_| ConfigError::InvalidAllowMethods)?;
                        if !location.allow_methods.contains(&method) {
                            location.allow_methods.push(method);
                        }
                    }
                }
                "cgi_ext" => {
                    if location.cgi_ext.is_some() {
                        return Err(ConfigError::MultipleCgiExt);
                    }
                    let ext = single(&name, &args)?;
                    if !ext.starts_with('.') || ext.len() < 2 || ext[1..].contains(&['.', '/'][..]) {
                        return Err(ConfigError::InvalidCgiExt);
                    }
                    location.cgi_ext = Some(ext.to_string());
                }
                "cgi_path" => {
                    if location.cgi_path.is_some() {
                        return Err(ConfigError::MultipleCgiPath);
                    }
                    location.cgi_path = Some(absolute(single(&name, &args)?, ConfigError::CgiPathNoSlash)?);
                }
                "return" => {
                    if args.len() != 2 {
                        return Err(if args.is_empty() {
                            ConfigError::NoValue(name.clone())
                        } else {
                            ConfigError::ParameterCount(name.clone())
                        });
                    }
                    let code = args[0]
                        .parse::<u16>()
                        .ok()
                        .map(StatusCode)
                        .filter(|code| code.is_redirect())
                        .ok_or(ConfigError::InvalidReturnCode)?;
                    location.redirect = Some((code, args[1].clone()));
                }
                "client_max_body_size" => {
                    parsed.max_body_size = Some(parse_size(single(&name, &args)?)?);
                }
                "error_page" => parse_error_page(&name, &args, &mut location.error_pages)?,
                _ => return Err(ConfigError::InvalidLocationDirective),
            }
        }
        Ok(parsed)
    }

    /// Values of the directive `name`, up to its semicolon.
    fn arguments(&mut self, name: &str) -> Result<Vec<String>, ConfigError> {
        let mut args = Vec::new();
        loop {
            match self.next() {
                Some(Token::Semicolon) => return Ok(args),
                Some(Token::Word(arg)) => args.push(arg),
                None => return Err(ConfigError::OpenBrackets),
                Some(_) => return Err(ConfigError::MissingSemicolon(name.to_string())),
            }
        }
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }
}

fn single<'a>(name: &str, args: &'a [String]) -> Result<&'a str, ConfigError> {
    match args {
        [] => Err(ConfigError::NoValue(name.to_string())),
        [value] => Ok(value),
        _ => Err(ConfigError::ParameterCount(name.to_string())),
    }
}

fn absolute(path: &str, error: ConfigError) -> Result<String, ConfigError> {
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Err(error)
    }
}

fn parse_number(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .parse::<usize>()
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| ConfigError::InvalidValue(name.to_string()))
}

/// `<port>`, `<ip>`, `<ip>:<port>` or `localhost:<port>`.
fn parse_listen(value: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = match value.split_once(':') {
        Some((host, port)) => (Some(host), Some(port)),
        None if value.bytes().all(|c| c.is_ascii_digit()) => (None, Some(value)),
        None => (Some(value), None),
    };
    let host = match host {
        None => crate::config::DEFAULT_HOST.to_string(),
        Some("localhost") => Ipv4Addr::LOCALHOST.to_string(),
        Some(host) => host
            .parse::<Ipv4Addr>()
            .map_err(|_| ConfigError::InvalidIp)?
            .to_string(),
    };
    let port = match port {
        None => crate::config::DEFAULT_PORT,
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|&port| port != 0)
            .ok_or(ConfigError::InvalidPort)?,
    };
    Ok((host, port))
}

/// Parse `<n>[k|m|g]` into a byte count.
fn parse_size(value: &str) -> Result<usize, ConfigError> {
    let digits_end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| value.len());
    let (digits, unit) = value.split_at(digits_end);
    if digits.is_empty() {
        return Err(ConfigError::InvalidBodySize);
    }
    let multiplier: usize = match unit.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return Err(ConfigError::InvalidBodySizeUnit),
    };
    digits
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or(ConfigError::BodySizeOverflow)
}

fn parse_error_page(
    name: &str,
    args: &[String],
    pages: &mut BTreeMap<u16, String>,
) -> Result<(), ConfigError> {
    let (path, codes) = match args.split_last() {
        None => return Err(ConfigError::NoValue(name.to_string())),
        Some((_, [])) => return Err(ConfigError::ParameterCount(name.to_string())),
        Some((path, codes)) => (path, codes),
    };
    let path = absolute(path, ConfigError::ErrorPageNoSlash)?;
    for code in codes {
        let code = code
            .parse::<u16>()
            .ok()
            .filter(|code| (300..=599).contains(code))
            .ok_or(ConfigError::InvalidErrorCode)?;
        pages.insert(code, path.clone());
    }
    Ok(())
}
