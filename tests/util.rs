use std::collections::HashMap;
use std::fs::{create_dir_all, write, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if let Ok(_) = TcpStream::connect(("127.0.0.1", port)) {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// A running webserv process serving a temporary document root.
pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
    _config_dir: TempDir,
}
impl Server {
    /// Start with `directives` placed inside the server block. `{root}` in them is replaced by
    /// the document root.
    pub fn with_directives(directives: &str) -> Self {
        Self::with_config(&[], directives)
    }
    /// Start with extra `http` level `settings` as well.
    pub fn with_config(settings: &[&str], directives: &str) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        let config_dir = tempdir().expect("failed to create tempdir");
        let root_path = root.path().to_str().expect("path is not valid UTF-8");

        // Get an unused port. Assumes the port won't be reused before we start webserv.
        let port = get_unused_port().expect("failed to get unused port");

        let mut config = String::from("http {\n");
        for setting in settings {
            config.push_str(&format!("    {};\n", setting));
        }
        config.push_str(&format!(
            "    server {{\n        listen 127.0.0.1:{};\n        root {};\n{}\n    }}\n}}\n",
            port,
            root_path,
            directives.replace("{root}", root_path),
        ));
        let config_path = config_dir.path().join("webserv.conf");
        write(&config_path, config).expect("failed to write config file");

        let child = Command::new(env!("CARGO_BIN_EXE_webserv"))
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn webserv")
            .into();

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to webserv");

        Self {
            _child: child,
            port,
            root,
            _config_dir: config_dir,
        }
    }
    pub fn root(&self) -> &Path {
        self.root.path()
    }
    fn path(&self, name: &str) -> PathBuf {
        let mut path = self.root().to_path_buf();
        path.push(name);
        path
    }
    pub fn create_dir(&self, name: &str) {
        create_dir_all(self.path(name)).expect("failed to create directory");
    }
    pub fn create_file(&self, name: &str) -> File {
        File::create(self.path(name)).expect("failed to create file")
    }
    pub fn create_script(&self, name: &str, content: &str) {
        let path = self.path(name);
        write(&path, content).expect("failed to write script");
        let mut permissions = path.metadata().expect("failed to stat script").permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).expect("failed to make script executable");
    }
    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to webserv");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }
    /// Send one request with `Host` and `Connection: close` set, and read the response.
    pub fn request(
        &self,
        method: &str,
        path: &str,
        headers: HashMap<&str, &str>,
        body: &[u8],
    ) -> Response {
        let mut stream = self.stream();
        write_request(&mut stream, method, path, headers, body, true);
        Response::from_reader(&mut stream).expect("failed to read response")
    }
    pub fn get(&self, path: &str) -> Response {
        self.request("GET", path, HashMap::new(), b"")
    }
}

pub fn write_request<W: Write>(
    writer: &mut W,
    method: &str,
    path: &str,
    headers: HashMap<&str, &str>,
    body: &[u8],
    close: bool,
) {
    write!(writer, "{} {} HTTP/1.1\r\nHost: localhost\r\n", method, path).unwrap();
    if close {
        write!(writer, "Connection: close\r\n").unwrap();
    }
    if !body.is_empty() {
        write!(writer, "Content-Length: {}\r\n", body.len()).unwrap();
    }
    for (header_name, header_value) in headers {
        write!(writer, "{}: {}\r\n", header_name, header_value).unwrap();
    }
    write!(writer, "\r\n").unwrap();
    writer.write_all(body).unwrap();
}

/// HTTP Response from webserv.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}
impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }
    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }
    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }
    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        body.resize(content_length, 0);
        reader.read_exact(&mut body)?;
        Ok(body)
    }
    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, " ")
            .nth(1)
            .expect("invalid response line")
    }
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }
    pub fn text(&self) -> Option<&str> {
        self.body
            .as_ref()
            .map(|body| std::str::from_utf8(body).expect("body is not valid UTF-8"))
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
