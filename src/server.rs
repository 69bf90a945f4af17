//! The event loop: listening sockets, client connections and CGI pipes on one poller.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use nix::unistd::Pid;

use crate::cgi::{self, CgiProcess, ExitState};
use crate::config::{ConfigFile, DEFAULT_HOST};
use crate::connection::{Connection, ConnectionStatus, Socket};
use crate::fd::Fd;
use crate::log::Logger;
use crate::mime::MimeMap;
use crate::parser::{header_end, parse_body, parse_chunks, parse_header};
use crate::poller::{Event, Interest, Poller};
use crate::response::ResponseBuilder;
use crate::status::StatusCode;
use crate::sys::{would_block, FileSystemOps, ProcessOps, SocketOps};
use crate::target::TargetResolver;
use crate::util::{ClfDate, LogEncoded};

/// Longest wait for readiness, so timeouts are swept even when nothing happens.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);
const READ_SIZE: usize = 8192;
const BACKLOG: usize = 128;
/// Undecoded chunked body bytes allowed on top of the body size limit: one pending chunk and its
/// size line.
const CHUNK_FRAMING: usize = 4096;

struct Listener {
    fd: Fd,
    /// Configured address, used when the local end of an accepted socket cannot be queried.
    socket: Socket,
}

/// Single-threaded HTTP server over a readiness poller.
///
/// Each map owns what it holds: `listeners` the listening sockets, `connections` the clients and
/// through them any CGI pipes. `cgi_pipes` only maps a pipe descriptor back to its client.
pub struct Server<P, S, F, X> {
    config: ConfigFile,
    poller: P,
    socket_ops: S,
    fs: F,
    process_ops: X,
    mime: MimeMap,
    logger: Logger,
    listeners: HashMap<RawFd, Listener>,
    connections: HashMap<RawFd, Connection>,
    cgi_pipes: HashMap<RawFd, RawFd>,
    /// CGI children that still have to be waited for.
    children: Vec<Pid>,
    shutting_down: bool,
}

impl<P, S, F, X> Server<P, S, F, X>
where
    P: Poller,
    S: SocketOps,
    F: FileSystemOps,
    X: ProcessOps,
{
    pub fn new(
        config: ConfigFile,
        logger: Logger,
        poller: P,
        socket_ops: S,
        fs: F,
        process_ops: X,
    ) -> Self {
        Self {
            config,
            poller,
            socket_ops,
            fs,
            process_ops,
            mime: MimeMap::default(),
            logger,
            listeners: HashMap::new(),
            connections: HashMap::new(),
            cgi_pipes: HashMap::new(),
            children: Vec::new(),
            shutting_down: false,
        }
    }

    /// Open one listening socket per distinct configured address.
    ///
    /// A wildcard address takes over every other address on its port. Addresses that fail to
    /// bind are logged and skipped; it is an error if none is left.
    pub fn init_virtual_servers(&mut self) -> io::Result<()> {
        let mut endpoints: Vec<(String, u16)> = Vec::new();
        for server in &self.config.servers {
            let endpoint = (server.host.clone(), server.port);
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
        let wildcard_ports: Vec<u16> = endpoints
            .iter()
            .filter(|(host, _)| host == DEFAULT_HOST)
            .map(|&(_, port)| port)
            .collect();
        for (host, port) in endpoints {
            if host != DEFAULT_HOST && wildcard_ports.contains(&port) {
                self.logger.debug(format_args!(
                    "{}:{} is served by the wildcard listener",
                    host, port
                ));
                continue;
            }
            if let Err(e) = self.listen(&host, port) {
                self.logger
                    .error(format_args!("failed to listen on {}:{}: {}", host, port, e));
            }
        }
        if self.listeners.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "no listening socket could be created",
            ));
        }
        Ok(())
    }

    fn listen(&mut self, host: &str, port: u16) -> io::Result<()> {
        for addr in self.socket_ops.resolve_listening_addresses(host, port)? {
            let fd = self.socket_ops.create_listening_socket(addr, BACKLOG)?;
            self.poller.register_interest(fd.raw(), Interest::Readable)?;
            self.logger.info(format_args!("listening on {}", addr));
            let socket = Socket {
                host: host.to_string(),
                port,
            };
            self.listeners.insert(fd.raw(), Listener { fd, socket });
        }
        Ok(())
    }

    /// Serve until `signals` counts a termination signal.
    ///
    /// The first signal stops accepting and lets open exchanges finish. A second one closes
    /// everything at once.
    pub fn run(&mut self, signals: &AtomicUsize) -> io::Result<()> {
        loop {
            match signals.load(Ordering::Relaxed) {
                0 => {}
                1 => {
                    if !self.shutting_down {
                        self.begin_shutdown();
                    }
                }
                _ => {
                    self.force_shutdown();
                    break;
                }
            }
            if self.shutting_down && self.connections.is_empty() {
                break;
            }
            self.poll_once()?;
        }
        self.kill_children();
        self.logger.info("server stopped");
        self.logger.flush();
        Ok(())
    }

    /// One loop iteration: wait, handle what is ready, then sweep.
    pub fn poll_once(&mut self) -> io::Result<()> {
        let events = match self.poller.wait_for_ready(POLL_TIMEOUT) {
            Ok(events) => events,
            Err(e) if would_block(&e) => Vec::new(),
            Err(e) => return Err(e),
        };
        for event in events {
            self.handle_event(event);
        }
        self.reap_children();
        self.sweep_timeouts(SystemTime::now());
        self.remove_closed();
        Ok(())
    }

    /// Add a client. Fails, handing the connection back untouched, if its descriptor is already
    /// live or cannot be watched.
    pub fn register_connection(&mut self, connection: Connection) -> Result<(), Connection> {
        let fd = connection.fd.raw();
        if self.connections.contains_key(&fd) {
            return Err(connection);
        }
        if let Err(e) = self.poller.register_interest(fd, Interest::Readable) {
            self.logger
                .error(format_args!("failed to watch client socket: {}", e));
            return Err(connection);
        }
        self.connections.insert(fd, connection);
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        let fd = event.fd;
        if self.listeners.contains_key(&fd) {
            if event.ready.is_failure() {
                self.close_listener(fd);
            } else {
                self.accept_connections(fd);
            }
        } else if let Some(&client) = self.cgi_pipes.get(&fd) {
            self.with_connection(client, |server, connection| {
                server.handle_cgi(connection, fd)
            });
        } else {
            // Errors and hang-ups surface through the next read or write.
            self.with_connection(fd, |server, connection| server.handle_client(connection));
        }
    }

    /// Run `handle` on a connection taken out of the map for the duration.
    fn with_connection(&mut self, fd: RawFd, handle: impl FnOnce(&mut Self, &mut Connection)) {
        if let Some(mut connection) = self.connections.remove(&fd) {
            handle(self, &mut connection);
            self.connections.insert(fd, connection);
        }
    }

    fn close_listener(&mut self, fd: RawFd) {
        if let Some(listener) = self.listeners.remove(&fd) {
            let _ = self.poller.remove_interest(fd);
            self.logger.error(format_args!(
                "listening socket for {}:{} failed, closing it",
                listener.socket.host, listener.socket.port
            ));
        }
    }

    fn accept_connections(&mut self, fd: RawFd) {
        loop {
            let (client, peer) = match self.socket_ops.accept_single_connection(fd) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    self.logger.error(format_args!("accept failed: {}", e));
                    break;
                }
            };
            let local = match self.socket_ops.retrieve_bound_socket_info(client.raw()) {
                Ok(addr) => Socket::from(addr),
                Err(_) => self.listeners.get(&fd).map_or_else(
                    || Socket {
                        host: DEFAULT_HOST.to_string(),
                        port: 0,
                    },
                    |listener| listener.socket.clone(),
                ),
            };
            let peer = Socket::from(peer);
            self.logger.debug(format_args!(
                "accepted {}:{} on {}:{}",
                peer.host, peer.port, local.host, local.port
            ));
            let connection = Connection::new(client, local, peer, SystemTime::now());
            if let Err(rejected) = self.register_connection(connection) {
                self.logger.warn(format_args!(
                    "dropping connection from {}",
                    rejected.client_socket.host
                ));
            }
        }
    }

    fn handle_client(&mut self, connection: &mut Connection) {
        connection.last_event = SystemTime::now();
        match connection.status {
            ConnectionStatus::Idle | ConnectionStatus::ReceiveHeader => {
                self.receive_header(connection)
            }
            ConnectionStatus::ReceiveBody => self.receive_body(connection),
            ConnectionStatus::BuildResponse | ConnectionStatus::Timeout => {
                self.build_response(connection)
            }
            ConnectionStatus::SendResponse => self.send_response(connection),
            // The client is not watched while a CGI program runs.
            ConnectionStatus::SendToCgi
            | ConnectionStatus::ReceiveFromCgi
            | ConnectionStatus::Closed => {}
        }
        self.serve_pipelined(connection);
    }

    /// Serve requests that arrived along with the one just answered.
    fn serve_pipelined(&mut self, connection: &mut Connection) {
        while connection.status == ConnectionStatus::Idle && !connection.buffer.is_empty() {
            self.parse_request(connection);
        }
    }

    /// Append what the client sent to the buffer. False if nothing arrived; a closed or failed
    /// connection is marked `Closed` on the way.
    fn read_client(&mut self, connection: &mut Connection) -> bool {
        let mut buf = [0; READ_SIZE];
        match self
            .socket_ops
            .read_from_socket(connection.fd.raw(), &mut buf)
        {
            Ok(0) => {
                connection.status = ConnectionStatus::Closed;
                false
            }
            Ok(n) => {
                connection.buffer.extend_from_slice(&buf[..n]);
                true
            }
            Err(e) if would_block(&e) => false,
            Err(e) => {
                self.logger.debug(format_args!(
                    "read from {} failed: {}",
                    connection.client_socket.host, e
                ));
                connection.status = ConnectionStatus::Closed;
                false
            }
        }
    }

    fn receive_header(&mut self, connection: &mut Connection) {
        if self.read_client(connection) {
            self.parse_request(connection);
        }
    }

    /// Route the request whose header block starts the buffer, once it is complete.
    fn parse_request(&mut self, connection: &mut Connection) {
        connection.status = ConnectionStatus::ReceiveHeader;
        let max = self.config.max_header_size;
        let end = match header_end(&connection.buffer) {
            Some(end) if end <= max => end,
            None if connection.buffer.len() <= max => return,
            _ => return self.reject(connection, StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE),
        };
        let header: Vec<u8> = connection.buffer.drain(..end).collect();
        let parsed = parse_header(&header, &mut connection.request);
        connection.server = self.config.select_server(
            &connection.server_socket.host,
            connection.server_socket.port,
            connection.request.headers.get("host"),
        );
        if let Err(e) = parsed {
            self.logger.debug(format_args!(
                "bad request from {}: {}",
                connection.client_socket.host, e
            ));
            return self.build_response(connection);
        }

        let server = &self.config.servers[connection.server];
        connection.location = TargetResolver::new(&self.fs, server, self.config.max_index_depth)
            .execute(&mut connection.request);
        if connection.request.http_status.is_error_or_redirect() {
            // The body is never read, so the stream cannot be reused.
            if connection.request.has_body {
                connection.request.shall_close_connection = true;
            }
            return self.build_response(connection);
        }
        if connection.request.has_body {
            let limit = self.max_body_size(connection);
            if connection
                .request
                .content_length()
                .map_or(false, |length| length > limit)
            {
                return self.reject(connection, StatusCode::REQUEST_ENTITY_TOO_LARGE);
            }
            connection.status = ConnectionStatus::ReceiveBody;
            return self.check_body(connection);
        }
        if connection.request.has_cgi {
            return self.start_cgi(connection);
        }
        self.build_response(connection);
    }

    fn receive_body(&mut self, connection: &mut Connection) {
        if self.read_client(connection) {
            self.check_body(connection);
        }
    }

    /// Move on once the whole body arrived. Bytes after it stay buffered.
    fn check_body(&mut self, connection: &mut Connection) {
        let limit = self.max_body_size(connection);
        let parsed = if connection.request.is_chunked {
            match parse_chunks(
                &mut connection.chunks,
                &connection.buffer,
                &mut connection.request,
            ) {
                Ok(consumed) => {
                    connection.buffer.drain(..consumed);
                    if !connection.chunks.is_done() {
                        if connection.chunks.decoded_len() > limit
                            || connection.buffer.len() > limit.saturating_add(CHUNK_FRAMING)
                        {
                            self.reject(connection, StatusCode::REQUEST_ENTITY_TOO_LARGE);
                        }
                        return;
                    }
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            let length = connection.request.content_length().unwrap_or(0);
            if connection.buffer.len() < length {
                return;
            }
            let body: Vec<u8> = connection.buffer.drain(..length).collect();
            parse_body(&body, &mut connection.request)
        };
        if let Err(e) = parsed {
            self.logger.debug(format_args!(
                "bad request body from {}: {}",
                connection.client_socket.host, e
            ));
            return self.build_response(connection);
        }
        if connection.request.body.len() > limit {
            return self.reject(connection, StatusCode::REQUEST_ENTITY_TOO_LARGE);
        }
        if connection.request.has_cgi {
            self.start_cgi(connection);
        } else {
            self.build_response(connection);
        }
    }

    fn max_body_size(&self, connection: &Connection) -> usize {
        let server = &self.config.servers[connection.server];
        match connection.location {
            Some(index) => server.locations[index].max_body_size,
            None => server.max_body_size,
        }
    }

    /// Answer with an error status and close afterwards.
    fn reject(&mut self, connection: &mut Connection, status: StatusCode) {
        connection.request.http_status = status;
        connection.request.shall_close_connection = true;
        self.build_response(connection);
    }

    /// Interpreter and environment for the connection's CGI request, if its location runs one.
    fn cgi_setup(&self, connection: &Connection) -> Option<(String, cgi::Environment)> {
        let server = &self.config.servers[connection.server];
        let location = &server.locations[connection.location?];
        let interpreter = location.cgi_path.clone()?;
        let env = cgi::environment(
            &connection.request,
            location,
            server,
            &connection.client_socket,
            &connection.server_socket,
        );
        Some((interpreter, env))
    }

    fn start_cgi(&mut self, connection: &mut Connection) {
        let (interpreter, env) = match self.cgi_setup(connection) {
            Some(setup) => setup,
            None => return self.fail_cgi(connection),
        };
        let script = &connection.request.target_resource;
        let mut process = match cgi::spawn(&self.process_ops, &interpreter, script, &env) {
            Ok(process) => process,
            Err(e) => {
                self.logger
                    .error(format_args!("failed to start CGI program {}: {}", script, e));
                return self.fail_cgi(connection);
            }
        };
        self.logger.debug(format_args!(
            "started CGI program {} as pid {}",
            script, process.pid
        ));

        let client = connection.fd.raw();
        let _ = self.poller.remove_interest(client);
        if connection.request.body.is_empty() {
            // Closing the program's stdin right away.
            process.to_cgi = None;
        }
        let watched = self.watch_pipes(&process, client);
        connection.status = if process.to_cgi.is_some() {
            ConnectionStatus::SendToCgi
        } else {
            ConnectionStatus::ReceiveFromCgi
        };
        connection.cgi = Some(process);
        if let Err(e) = watched {
            self.logger
                .error(format_args!("failed to watch CGI pipe: {}", e));
            self.fail_cgi(connection);
        }
    }

    fn watch_pipes(&mut self, process: &CgiProcess, client: RawFd) -> io::Result<()> {
        if let Some(fd) = process.from_cgi_fd() {
            self.watch_pipe(fd, client, Interest::Readable)?;
        }
        if let Some(fd) = process.to_cgi_fd() {
            self.watch_pipe(fd, client, Interest::Writable)?;
        }
        Ok(())
    }

    fn watch_pipe(&mut self, fd: RawFd, client: RawFd, interest: Interest) -> io::Result<()> {
        self.poller.register_interest(fd, interest)?;
        self.cgi_pipes.insert(fd, client);
        Ok(())
    }

    fn unwatch_pipe(&mut self, fd: RawFd) {
        let _ = self.poller.remove_interest(fd);
        self.cgi_pipes.remove(&fd);
    }

    fn handle_cgi(&mut self, connection: &mut Connection, fd: RawFd) {
        connection.last_event = SystemTime::now();
        let process = match &connection.cgi {
            Some(process) => process,
            None => return,
        };
        if process.to_cgi_fd() == Some(fd) {
            self.send_to_cgi(connection);
        } else if process.from_cgi_fd() == Some(fd) {
            self.receive_from_cgi(connection);
        }
        self.serve_pipelined(connection);
    }

    fn send_to_cgi(&mut self, connection: &mut Connection) {
        if connection.request.body.is_empty() {
            self.logger.error("nothing to send to the CGI program");
            return self.fail_cgi(connection);
        }
        let process = match connection.cgi.as_mut() {
            Some(process) => process,
            None => return,
        };
        let fd = match process.to_cgi_fd() {
            Some(fd) => fd,
            None => return,
        };
        let body = &connection.request.body;
        match self.process_ops.write_process(fd, &body[process.written..]) {
            Ok(n) => process.written += n,
            Err(e) if would_block(&e) => return,
            Err(e) => {
                self.logger
                    .error(format_args!("write to CGI program failed: {}", e));
                return self.fail_cgi(connection);
            }
        }
        if process.written < body.len() {
            return;
        }
        self.unwatch_pipe(fd);
        process.to_cgi = None;
        connection.status = ConnectionStatus::ReceiveFromCgi;
        if process.from_cgi.is_none() {
            self.finish_cgi(connection);
        }
    }

    fn receive_from_cgi(&mut self, connection: &mut Connection) {
        let process = match connection.cgi.as_mut() {
            Some(process) => process,
            None => return,
        };
        let fd = match process.from_cgi_fd() {
            Some(fd) => fd,
            None => return,
        };
        let mut buf = [0; READ_SIZE];
        match self.process_ops.read_process(fd, &mut buf) {
            Ok(0) => {
                self.unwatch_pipe(fd);
                process.from_cgi = None;
                if process.to_cgi.is_none() {
                    self.finish_cgi(connection);
                }
            }
            Ok(n) => process.output.extend_from_slice(&buf[..n]),
            Err(e) if would_block(&e) => {}
            Err(e) => {
                self.logger
                    .error(format_args!("read from CGI program failed: {}", e));
                self.fail_cgi(connection);
            }
        }
    }

    /// The program closed its output: answer with it, unless it failed.
    fn finish_cgi(&mut self, connection: &mut Connection) {
        let process = match connection.cgi.take() {
            Some(process) => process,
            None => return,
        };
        let output = match cgi::exit_state(&self.process_ops, process.pid) {
            ExitState::Success => Some(process.output),
            ExitState::Running => {
                self.children.push(process.pid);
                Some(process.output)
            }
            ExitState::Failure => {
                self.logger.warn(format_args!(
                    "CGI program {} failed",
                    connection.request.target_resource
                ));
                connection.request.http_status = StatusCode::INTERNAL_SERVER_ERROR;
                None
            }
        };
        self.watch_client(connection);
        self.respond(connection, output);
    }

    /// Give up on the CGI program and answer with an internal error.
    fn fail_cgi(&mut self, connection: &mut Connection) {
        let had_cgi = self.stop_cgi(connection);
        connection.request.http_status = StatusCode::INTERNAL_SERVER_ERROR;
        if had_cgi {
            self.watch_client(connection);
        }
        self.build_response(connection);
    }

    /// Close the pipes of the connection's CGI program and kill it. False if there was none.
    fn stop_cgi(&mut self, connection: &mut Connection) -> bool {
        let process = match connection.cgi.take() {
            Some(process) => process,
            None => return false,
        };
        for fd in process.to_cgi_fd().into_iter().chain(process.from_cgi_fd()) {
            self.unwatch_pipe(fd);
        }
        if let Err(e) = self.process_ops.kill_process(process.pid) {
            self.logger
                .warn(format_args!("failed to kill pid {}: {}", process.pid, e));
        }
        self.children.push(process.pid);
        true
    }

    /// Watch the client again after a CGI exchange.
    fn watch_client(&mut self, connection: &Connection) {
        if let Err(e) = self
            .poller
            .register_interest(connection.fd.raw(), Interest::Writable)
        {
            self.logger
                .debug(format_args!("failed to watch client again: {}", e));
        }
    }

    fn build_response(&mut self, connection: &mut Connection) {
        self.respond(connection, None);
    }

    /// Serialize the response, from CGI output if given, and start sending it.
    fn respond(&mut self, connection: &mut Connection, cgi_output: Option<Vec<u8>>) {
        connection.status = ConnectionStatus::BuildResponse;
        let server = &self.config.servers[connection.server];
        let builder =
            ResponseBuilder::new(&self.fs, &self.mime, server, self.config.max_index_depth);
        let now = SystemTime::now();
        let response = match cgi_output {
            Some(output) => {
                builder.build_cgi(&mut connection.request, connection.location, &output, now)
            }
            None => builder.build(&mut connection.request, connection.location, now),
        };
        connection.response_status = response.status;
        connection.body_length = response.body_length;
        connection.response = response.content;
        connection.bytes_sent = 0;
        connection.status = ConnectionStatus::SendResponse;
        if let Err(e) = self
            .poller
            .modify_interest(connection.fd.raw(), Interest::Writable)
        {
            self.logger
                .debug(format_args!("failed to watch client for writing: {}", e));
        }
        self.send_response(connection);
    }

    fn send_response(&mut self, connection: &mut Connection) {
        let pending = &connection.response[connection.bytes_sent..];
        match self.socket_ops.write_to_socket(connection.fd.raw(), pending) {
            Ok(0) if !pending.is_empty() => {
                connection.status = ConnectionStatus::Closed;
                return;
            }
            Ok(n) => connection.bytes_sent += n,
            Err(e) if would_block(&e) => return,
            Err(e) => {
                self.logger.debug(format_args!(
                    "write to {} failed: {}",
                    connection.client_socket.host, e
                ));
                connection.status = ConnectionStatus::Closed;
                return;
            }
        }
        if connection.bytes_sent < connection.response.len() {
            return;
        }
        self.log_access(connection);
        if connection.request.shall_close_connection || self.shutting_down {
            connection.status = ConnectionStatus::Closed;
            return;
        }
        connection.reset();
        if let Err(e) = self
            .poller
            .modify_interest(connection.fd.raw(), Interest::Readable)
        {
            self.logger
                .debug(format_args!("failed to watch client for reading: {}", e));
        }
    }

    fn log_access(&mut self, connection: &Connection) {
        let request = &connection.request;
        self.logger.access(format_args!(
            "{} - - {} \"{}\" {} {} \"{}\" \"{}\"",
            connection.client_socket.host,
            ClfDate(SystemTime::now()),
            LogEncoded(&request.request_line()),
            connection.response_status.as_u16(),
            connection.body_length,
            LogEncoded(request.headers.get("referer").unwrap_or("")),
            LogEncoded(request.headers.get("user-agent").unwrap_or("")),
        ));
    }

    /// Time out connections that saw no event for longer than the client timeout.
    fn sweep_timeouts(&mut self, now: SystemTime) {
        let timeout = self.config.client_timeout;
        let expired: Vec<RawFd> = self
            .connections
            .iter()
            .filter(|(_, connection)| {
                connection.status != ConnectionStatus::Closed
                    && connection.timed_out(now, timeout)
            })
            .map(|(&fd, _)| fd)
            .collect();
        for fd in expired {
            self.with_connection(fd, |server, connection| server.expire(connection, now));
        }
    }

    fn expire(&mut self, connection: &mut Connection, now: SystemTime) {
        match connection.status {
            ConnectionStatus::Closed => {}
            // The client never took the timeout response.
            ConnectionStatus::Timeout => connection.status = ConnectionStatus::Closed,
            ConnectionStatus::SendResponse
                if connection.request.http_status == StatusCode::REQUEST_TIMEOUT =>
            {
                connection.status = ConnectionStatus::Closed
            }
            // A response is already on its way.
            ConnectionStatus::BuildResponse | ConnectionStatus::SendResponse => {}
            _ => {
                self.logger.info(format_args!(
                    "request from {} timed out",
                    connection.client_socket.host
                ));
                if self.stop_cgi(connection) {
                    self.watch_client(connection);
                }
                connection.request.http_status = StatusCode::REQUEST_TIMEOUT;
                connection.request.shall_close_connection = true;
                connection.status = ConnectionStatus::Timeout;
                connection.last_event = now;
                if let Err(e) = self
                    .poller
                    .modify_interest(connection.fd.raw(), Interest::Writable)
                {
                    self.logger
                        .debug(format_args!("failed to watch client for writing: {}", e));
                }
            }
        }
    }

    /// Drop every connection that reached `Closed`, closing its descriptors.
    fn remove_closed(&mut self) {
        let closed: Vec<RawFd> = self
            .connections
            .iter()
            .filter(|(_, connection)| connection.status == ConnectionStatus::Closed)
            .map(|(&fd, _)| fd)
            .collect();
        for fd in closed {
            if let Some(mut connection) = self.connections.remove(&fd) {
                self.stop_cgi(&mut connection);
                let _ = self.poller.remove_interest(fd);
                self.logger.debug(format_args!(
                    "closed connection from {}:{}",
                    connection.client_socket.host, connection.client_socket.port
                ));
            }
        }
    }

    fn reap_children(&mut self) {
        let ops = &self.process_ops;
        self.children
            .retain(|&pid| cgi::exit_state(ops, pid) == ExitState::Running);
    }

    fn kill_children(&mut self) {
        for pid in self.children.drain(..) {
            let _ = self.process_ops.kill_process(pid);
            let _ = self.process_ops.wait_process(pid);
        }
    }

    fn begin_shutdown(&mut self) {
        self.logger
            .info("shutting down, waiting for open connections to finish");
        self.shutting_down = true;
        for (fd, _) in self.listeners.drain() {
            let _ = self.poller.remove_interest(fd);
        }
        for connection in self.connections.values_mut() {
            if connection.status == ConnectionStatus::Idle {
                connection.status = ConnectionStatus::Closed;
            }
        }
        self.remove_closed();
    }

    fn force_shutdown(&mut self) {
        self.logger.info("shutting down now");
        self.shutting_down = true;
        for (fd, _) in self.listeners.drain() {
            let _ = self.poller.remove_interest(fd);
        }
        for connection in self.connections.values_mut() {
            connection.status = ConnectionStatus::Closed;
        }
        self.remove_closed();
    }
}
