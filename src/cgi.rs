//! Running CGI programs as child processes connected through two pipes.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::io::RawFd;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::{chdir, ForkResult, Pid};

use crate::config::{Location, ServerConfig};
use crate::connection::Socket;
use crate::fd::Fd;
use crate::request::{Method, Request};
use crate::response::SERVER_SOFTWARE;
use crate::sys::{io_error, ProcessOps};

/// What a child writes to its stdout when it cannot start the program.
const CHILD_FAILURE: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n";

/// Environment handed to the program, sorted by name.
pub type Environment = BTreeMap<String, String>;

/// A spawned CGI program and the parent's ends of its pipes.
///
/// `to_cgi` is dropped once the whole request body has been written, `from_cgi` once the
/// program closed its stdout.
#[derive(Debug)]
pub struct CgiProcess {
    pub pid: Pid,
    pub to_cgi: Option<Fd>,
    pub from_cgi: Option<Fd>,
    /// Bytes of the request body written so far.
    pub written: usize,
    pub output: Vec<u8>,
}

impl CgiProcess {
    pub fn to_cgi_fd(&self) -> Option<RawFd> {
        self.to_cgi.as_ref().map(Fd::raw)
    }

    pub fn from_cgi_fd(&self) -> Option<RawFd> {
        self.from_cgi.as_ref().map(Fd::raw)
    }
}

/// How a child process is doing, as far as a non-blocking wait can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Running,
    Success,
    Failure,
}

/// Build the CGI/1.1 environment for `request`, which was resolved to a script under `location`.
pub fn environment(
    request: &Request,
    location: &Location,
    server: &ServerConfig,
    client: &Socket,
    local: &Socket,
) -> Environment {
    let mut env = Environment::new();
    let mut set = |name: &str, value: String| {
        env.insert(name.to_string(), value);
    };
    if request.has_body {
        set("CONTENT_LENGTH", request.body.len().to_string());
    }
    if let Some(content_type) = request.headers.get("content-type") {
        set("CONTENT_TYPE", content_type.to_string());
    }
    set("GATEWAY_INTERFACE", "CGI/1.1".to_string());
    set("PATH_INFO", request.path_info.clone());
    set("PATH_TRANSLATED", path_translated(location, &request.path_info));
    set("QUERY_STRING", request.uri.query.clone());
    set("REDIRECT_STATUS", "200".to_string());
    set("REMOTE_ADDR", client.host.clone());
    set("REMOTE_PORT", client.port.to_string());
    set(
        "REQUEST_METHOD",
        request.method.unwrap_or(Method::Get).to_string(),
    );
    let mut uri = request.uri.path.clone();
    if !request.uri.query.is_empty() {
        uri.push('?');
        uri.push_str(&request.uri.query);
    }
    set("REQUEST_URI", uri);
    set("SCRIPT_NAME", request.script_name.clone());
    set("SCRIPT_FILENAME", request.target_resource.clone());
    set("SERVER_ADDR", local.host.clone());
    set(
        "SERVER_NAME",
        server.server_name.clone().unwrap_or_else(|| local.host.clone()),
    );
    set("SERVER_PORT", local.port.to_string());
    set("SERVER_PROTOCOL", "HTTP/1.1".to_string());
    set("SERVER_SOFTWARE", SERVER_SOFTWARE.to_string());
    for (name, value) in request.headers.iter() {
        if name == "content-type" || name == "content-length" {
            continue;
        }
        let name = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        set(&name, value.to_string());
    }
    env
}

fn path_translated(location: &Location, path_info: &str) -> String {
    if path_info.is_empty() {
        return String::new();
    }
    let base = location.alias.as_deref().unwrap_or(&location.root);
    format!("{}{}", base.trim_end_matches('/'), path_info)
}

fn set_nonblocking(fd: &Fd) -> io::Result<()> {
    fcntl(fd.raw(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map(|_| ())
        .map_err(io_error)
}

/// Directory the program runs in: the one holding the script.
fn working_directory(script: &str) -> &str {
    match script.rfind('/') {
        Some(0) => "/",
        Some(pos) => &script[..pos],
        None => ".",
    }
}

/// Start `interpreter script` with `env`, connected through two fresh pipes.
///
/// Every descriptor opened on the way is closed again if a later step fails. A failure to
/// start the program inside the child only shows up as the child's output and exit status.
pub fn spawn<P: ProcessOps>(
    ops: &P,
    interpreter: &str,
    script: &str,
    env: &Environment,
) -> io::Result<CgiProcess> {
    // Everything the child needs is allocated before forking.
    let path = CString::new(interpreter)?;
    let argv = vec![path.clone(), CString::new(script)?];
    let envp = env
        .iter()
        .map(|(name, value)| CString::new(format!("{}={}", name, value)))
        .collect::<Result<Vec<_>, _>>()?;
    let dir = CString::new(working_directory(script))?;

    let (stdin_read, stdin_write) = ops.pipe_process()?;
    let (stdout_read, stdout_write) = ops.pipe_process()?;
    set_nonblocking(&stdin_write)?;
    set_nonblocking(&stdout_read)?;

    match unsafe { ops.fork_process() }? {
        ForkResult::Child => run_child(ops, &stdin_read, &stdout_write, &dir, &path, &argv, &envp),
        ForkResult::Parent { child } => Ok(CgiProcess {
            pid: child,
            to_cgi: Some(stdin_write),
            from_cgi: Some(stdout_read),
            written: 0,
            output: Vec::new(),
        }),
    }
}

/// Child side of `spawn`. Only async-signal-safe calls happen here.
fn run_child<P: ProcessOps>(
    ops: &P,
    stdin: &Fd,
    stdout: &Fd,
    dir: &CStr,
    path: &CStr,
    argv: &[CString],
    envp: &[CString],
) -> ! {
    let reset = [
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGQUIT,
        Signal::SIGPIPE,
    ]
    .iter()
    .all(|&sig| unsafe { signal(sig, SigHandler::SigDfl) }.is_ok());
    // The pipe descriptors are close-on-exec, only the duplicates survive.
    if reset
        && ops.dup2_process(stdin.raw(), libc::STDIN_FILENO).is_ok()
        && ops.dup2_process(stdout.raw(), libc::STDOUT_FILENO).is_ok()
        && chdir(dir).is_ok()
    {
        let _ = ops.exec_process(path, argv, envp);
    }
    let _ = ops.write_process(libc::STDOUT_FILENO, CHILD_FAILURE);
    unsafe { libc::_exit(1) }
}

/// Check on a child without blocking.
pub fn exit_state<P: ProcessOps>(ops: &P, pid: Pid) -> ExitState {
    match ops.wait_process(pid) {
        Ok(WaitStatus::StillAlive) => ExitState::Running,
        Ok(WaitStatus::Exited(_, 0)) => ExitState::Success,
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => ExitState::Failure,
        Ok(_) => ExitState::Running,
        Err(_) => ExitState::Failure,
    }
}
