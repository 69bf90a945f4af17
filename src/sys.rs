//! Thin indirections over the OS calls the server makes.
//!
//! The event loop only talks to sockets, the filesystem and child processes through these traits,
//! so tests can swap any of them for a double. The `Os*` types are the real implementations.

use std::convert::Infallible;
use std::ffi::{CStr, CString};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::time::SystemTime;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::sys::socket::{
    self, sockopt, AddressFamily, InetAddr, MsgFlags, SockAddr, SockFlag, SockType,
};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, execve, fork, pipe2, ForkResult, Pid};

use crate::fd::Fd;

/// Convert a nix error into the `io::Error` the traits speak.
pub fn io_error(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}

/// Whether an error means "try again once the descriptor is ready".
pub fn would_block(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINTR)
}

pub trait SocketOps {
    /// Resolve a configured host/port pair into socket addresses.
    fn resolve_listening_addresses(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
    /// Create a bound, non-blocking, close-on-exec listening socket.
    fn create_listening_socket(&self, addr: SocketAddr, backlog: usize) -> io::Result<Fd>;
    /// Address a socket is bound to.
    fn retrieve_bound_socket_info(&self, fd: RawFd) -> io::Result<SocketAddr>;
    /// Accept one pending connection, `None` if nothing is pending.
    fn accept_single_connection(&self, fd: RawFd) -> io::Result<Option<(Fd, SocketAddr)>>;
    fn read_from_socket(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;
    fn write_to_socket(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Other,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub stat: FileStat,
}

pub trait FileSystemOps {
    /// Type of the file at `path`. Permission problems surface as `PermissionDenied` errors.
    fn check_file_type(&self, path: &str) -> io::Result<FileType>;
    /// Entries of a directory, without `.` and `..`.
    fn read_directory(&self, path: &str) -> io::Result<Vec<DirEntry>>;
    fn get_file_contents(&self, path: &str) -> io::Result<Vec<u8>>;
    /// Append to the file at `path`, creating it if needed.
    fn write_to_file(&self, path: &str, content: &[u8]) -> io::Result<()>;
    fn delete_file(&self, path: &str) -> io::Result<()>;
    fn get_file_stat(&self, path: &str) -> io::Result<FileStat>;
}

pub trait ProcessOps {
    /// Create a close-on-exec pipe, returning (read end, write end).
    fn pipe_process(&self) -> io::Result<(Fd, Fd)>;
    /// # Safety
    ///
    /// Same requirements as `fork(2)` in a multi-threaded program: the child may only call
    /// async-signal-safe functions before `exec`.
    unsafe fn fork_process(&self) -> io::Result<ForkResult>;
    fn dup2_process(&self, old: RawFd, new: RawFd) -> io::Result<()>;
    fn exec_process(&self, path: &CStr, argv: &[CString], env: &[CString])
        -> io::Result<Infallible>;
    fn read_process(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize>;
    fn write_process(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize>;
    /// Non-blocking wait; `StillAlive` if the child has not exited yet.
    fn wait_process(&self, pid: Pid) -> io::Result<WaitStatus>;
    fn kill_process(&self, pid: Pid) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsSocketOps;

impl SocketOps for OsSocketOps {
    fn resolve_listening_addresses(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        if host.is_empty() {
            return Ok(vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port,
            )]);
        }
        let mut addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()?
            .filter(|addr| addr.is_ipv4())
            .collect();
        addrs.dedup();
        Ok(addrs)
    }

    fn create_listening_socket(&self, addr: SocketAddr, backlog: usize) -> io::Result<Fd> {
        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let fd = socket::socket(
            family,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map(Fd::from_raw)
        .map_err(io_error)?;
        socket::setsockopt(fd.raw(), sockopt::ReuseAddr, &true).map_err(io_error)?;
        socket::bind(fd.raw(), &SockAddr::new_inet(InetAddr::from_std(&addr))).map_err(io_error)?;
        socket::listen(fd.raw(), backlog).map_err(io_error)?;
        Ok(fd)
    }

    fn retrieve_bound_socket_info(&self, fd: RawFd) -> io::Result<SocketAddr> {
        match socket::getsockname(fd).map_err(io_error)? {
            SockAddr::Inet(addr) => Ok(addr.to_std()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket is not an internet socket",
            )),
        }
    }

    fn accept_single_connection(&self, fd: RawFd) -> io::Result<Option<(Fd, SocketAddr)>> {
        let client = match socket::accept4(fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(client) => Fd::from_raw(client),
            Err(nix::Error::Sys(Errno::EAGAIN)) => return Ok(None),
            Err(e) => return Err(io_error(e)),
        };
        match socket::getpeername(client.raw()).map_err(io_error)? {
            SockAddr::Inet(addr) => Ok(Some((client, addr.to_std()))),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "peer is not an internet socket",
            )),
        }
    }

    fn read_from_socket(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        socket::recv(fd, buf, MsgFlags::empty()).map_err(io_error)
    }

    fn write_to_socket(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        // nix 0.21 has no `MsgFlags::MSG_NOSIGNAL`; build the same bit from libc.
        let flags = unsafe { MsgFlags::from_bits_unchecked(libc::MSG_NOSIGNAL) };
        socket::send(fd, buf, flags).map_err(io_error)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystemOps;

impl FileSystemOps for OsFileSystemOps {
    fn check_file_type(&self, path: &str) -> io::Result<FileType> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(FileType::NotFound),
            Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => return Ok(FileType::NotFound),
            Err(e) => return Err(e),
        };
        let file_type = metadata.file_type();
        if file_type.is_file() {
            Ok(FileType::Regular)
        } else if file_type.is_dir() {
            Ok(FileType::Directory)
        } else {
            Ok(FileType::Other)
        }
    }

    fn read_directory(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            // Entries can vanish between readdir and stat.
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                stat: FileStat {
                    size: metadata.len(),
                    modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                },
            });
        }
        Ok(entries)
    }

    fn get_file_contents(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write_to_file(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(content)
    }

    fn delete_file(&self, path: &str) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn get_file_stat(&self, path: &str) -> io::Result<FileStat> {
        let metadata = fs::metadata(path)?;
        Ok(FileStat {
            size: metadata.len(),
            modified: metadata.modified()?,
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessOps;

impl ProcessOps for OsProcessOps {
    fn pipe_process(&self) -> io::Result<(Fd, Fd)> {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(io_error)?;
        Ok((Fd::from_raw(read_end), Fd::from_raw(write_end)))
    }

    unsafe fn fork_process(&self) -> io::Result<ForkResult> {
        fork().map_err(io_error)
    }

    fn dup2_process(&self, old: RawFd, new: RawFd) -> io::Result<()> {
        dup2(old, new).map(|_| ()).map_err(io_error)
    }

    fn exec_process(
        &self,
        path: &CStr,
        argv: &[CString],
        env: &[CString],
    ) -> io::Result<Infallible> {
        execve(path, argv, env).map_err(io_error)
    }

    fn read_process(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(fd, buf).map_err(io_error)
    }

    fn write_process(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        nix::unistd::write(fd, buf).map_err(io_error)
    }

    fn wait_process(&self, pid: Pid) -> io::Result<WaitStatus> {
        waitpid(pid, Some(WaitPidFlag::WNOHANG)).map_err(io_error)
    }

    fn kill_process(&self, pid: Pid) -> io::Result<()> {
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::Error::Sys(Errno::ESRCH)) => Ok(()),
            Err(e) => Err(io_error(e)),
        }
    }
}
