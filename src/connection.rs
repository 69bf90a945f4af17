use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use crate::cgi::CgiProcess;
use crate::fd::Fd;
use crate::parser::ChunkDecoder;
use crate::request::Request;
use crate::status::StatusCode;

/// Where a connection is in its request/response cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    ReceiveHeader,
    ReceiveBody,
    SendToCgi,
    ReceiveFromCgi,
    BuildResponse,
    SendResponse,
    /// Kept alive, waiting for the next request.
    Idle,
    Timeout,
    Closed,
}

/// One end of a TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socket {
    pub host: String,
    pub port: u16,
}

impl From<SocketAddr> for Socket {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Everything the server tracks about one client.
#[derive(Debug)]
pub struct Connection {
    pub fd: Fd,
    /// Local address the client connected to.
    pub server_socket: Socket,
    pub client_socket: Socket,
    pub status: ConnectionStatus,
    /// Received bytes not yet parsed. May hold the start of a pipelined request.
    pub buffer: Vec<u8>,
    /// Progress through a chunked request body.
    pub chunks: ChunkDecoder,
    /// The serialized response.
    pub response: Vec<u8>,
    /// Bytes of the response written so far.
    pub bytes_sent: usize,
    pub request: Request,
    /// Index of the virtual server handling the current request.
    pub server: usize,
    /// Index of the matched location in that server.
    pub location: Option<usize>,
    pub last_event: SystemTime,
    pub cgi: Option<CgiProcess>,
    /// Status and body size of the response being sent, for the access log.
    pub response_status: StatusCode,
    pub body_length: usize,
}

impl Connection {
    pub fn new(fd: Fd, server_socket: Socket, client_socket: Socket, now: SystemTime) -> Self {
        Self {
            fd,
            server_socket,
            client_socket,
            status: ConnectionStatus::ReceiveHeader,
            buffer: Vec::new(),
            chunks: ChunkDecoder::default(),
            response: Vec::new(),
            bytes_sent: 0,
            request: Request::default(),
            server: 0,
            location: None,
            last_event: now,
            cgi: None,
            response_status: StatusCode::OK,
            body_length: 0,
        }
    }

    /// Whether nothing happened on this connection for longer than `timeout`.
    pub fn timed_out(&self, now: SystemTime, timeout: Duration) -> bool {
        let elapsed = now
            .duration_since(self.last_event)
            .unwrap_or_else(|_| Duration::from_secs(0));
        elapsed >= timeout
    }

    /// Forget the finished exchange and wait for the next request. Bytes already received
    /// beyond it are kept.
    pub fn reset(&mut self) {
        self.status = ConnectionStatus::Idle;
        self.chunks = ChunkDecoder::default();
        self.response.clear();
        self.bytes_sent = 0;
        self.request.clear();
        self.location = None;
        self.cgi = None;
        self.response_status = StatusCode::OK;
        self.body_length = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::File;
    use std::os::unix::io::IntoRawFd;

    use crate::request::Method;

    fn connection() -> Connection {
        let fd = Fd::from_raw(File::open("/dev/null").unwrap().into_raw_fd());
        let local = Socket::from("127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        let peer = Socket::from("127.0.0.1:40000".parse::<SocketAddr>().unwrap());
        Connection::new(fd, local, peer, SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn socket_from_addr() {
        let socket = Socket::from("10.1.2.3:443".parse::<SocketAddr>().unwrap());
        assert_eq!(socket.host, "10.1.2.3");
        assert_eq!(socket.port, 443);
    }

    #[test]
    fn timeout_check() {
        let connection = connection();
        let timeout = Duration::from_secs(60);
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(59);
        assert!(!connection.timed_out(later, timeout));
        assert!(connection.timed_out(later + Duration::from_secs(1), timeout));
        // A clock going backwards never times out.
        let mut connection = connection;
        connection.last_event = later;
        assert!(!connection.timed_out(SystemTime::UNIX_EPOCH, timeout));
    }

    #[test]
    fn reset_keeps_client() {
        let mut connection = connection();
        connection.status = ConnectionStatus::SendResponse;
        connection.buffer = b"GET /next HTTP/1.1\r\n".to_vec();
        connection.response = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        connection.bytes_sent = 19;
        connection.request.method = Some(Method::Get);
        connection.location = Some(1);
        connection.server = 1;
        connection.reset();
        assert_eq!(connection.status, ConnectionStatus::Idle);
        assert_eq!(connection.buffer, b"GET /next HTTP/1.1\r\n");
        assert!(connection.response.is_empty());
        assert_eq!(connection.bytes_sent, 0);
        assert_eq!(connection.request.method, None);
        assert_eq!(connection.location, None);
        assert_eq!(connection.server, 1);
        assert_eq!(connection.client_socket.port, 40000);
    }
}
