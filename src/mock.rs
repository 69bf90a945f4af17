//! Test doubles for the OS traits and the poller.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::convert::Infallible;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::time::{Duration, SystemTime};

use nix::sys::wait::WaitStatus;
use nix::unistd::{ForkResult, Pid};

use crate::fd::Fd;
use crate::poller::{Event, Interest, Poller};
use crate::sys::{DirEntry, FileStat, FileSystemOps, FileType, ProcessOps, SocketOps};

/// A real descriptor with nothing behind it, so ownership and closing work as usual.
pub fn null_fd() -> Fd {
    let file = File::open("/dev/null").expect("failed to open /dev/null");
    Fd::from_raw(file.into_raw_fd())
}

fn would_block() -> io::Error {
    io::Error::from(io::ErrorKind::WouldBlock)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEntry {
    File(Vec<u8>),
    Dir,
    Other,
    /// Anything at this path fails with permission denied.
    Denied,
}

/// In-memory filesystem keyed by absolute path.
#[derive(Debug, Default)]
pub struct MockFileSystemOps {
    entries: RefCell<BTreeMap<String, MockEntry>>,
}

fn key(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => path,
    }
}

fn parent(path: &str) -> &str {
    let path = key(path);
    match path.rfind('/') {
        Some(0) => "/",
        Some(pos) => &path[..pos],
        None => "",
    }
}

fn denied() -> io::Error {
    io::Error::from(io::ErrorKind::PermissionDenied)
}

fn not_found() -> io::Error {
    io::Error::from(io::ErrorKind::NotFound)
}

fn is_a_directory() -> io::Error {
    io::Error::from_raw_os_error(libc::EISDIR)
}

impl MockFileSystemOps {
    pub fn new() -> Self {
        Self::default().with_dir("/")
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.insert(path, MockEntry::File(content.to_vec()));
        self
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.insert(path, MockEntry::Dir);
        self
    }

    pub fn with_entry(self, path: &str, entry: MockEntry) -> Self {
        self.insert(path, entry);
        self
    }

    fn insert(&self, path: &str, entry: MockEntry) {
        self.entries.borrow_mut().insert(key(path).to_string(), entry);
    }

    fn get(&self, path: &str) -> Option<MockEntry> {
        self.entries.borrow().get(key(path)).cloned()
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.get(path) {
            Some(MockEntry::File(content)) => Some(content),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.get(path).is_some()
    }
}

impl FileSystemOps for MockFileSystemOps {
    fn check_file_type(&self, path: &str) -> io::Result<FileType> {
        match self.get(path) {
            Some(MockEntry::File(_)) => Ok(FileType::Regular),
            Some(MockEntry::Dir) => Ok(FileType::Directory),
            Some(MockEntry::Other) => Ok(FileType::Other),
            Some(MockEntry::Denied) => Err(denied()),
            None => Ok(FileType::NotFound),
        }
    }

    fn read_directory(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        match self.get(path) {
            Some(MockEntry::Dir) => {}
            Some(MockEntry::Denied) => return Err(denied()),
            Some(_) => return Err(io::Error::from_raw_os_error(libc::ENOTDIR)),
            None => return Err(not_found()),
        }
        let dir = key(path);
        let entries = self.entries.borrow();
        Ok(entries
            .iter()
            .filter(|(entry_path, _)| entry_path.as_str() != dir && parent(entry_path) == dir)
            .map(|(entry_path, entry)| DirEntry {
                name: entry_path[entry_path.rfind('/').map_or(0, |pos| pos + 1)..].to_string(),
                is_dir: *entry == MockEntry::Dir,
                stat: FileStat {
                    size: match entry {
                        MockEntry::File(content) => content.len() as u64,
                        _ => 4096,
                    },
                    modified: SystemTime::UNIX_EPOCH,
                },
            })
            .collect())
    }

    fn get_file_contents(&self, path: &str) -> io::Result<Vec<u8>> {
        match self.get(path) {
            Some(MockEntry::File(content)) => Ok(content),
            Some(MockEntry::Denied) => Err(denied()),
            Some(_) => Err(is_a_directory()),
            None => Err(not_found()),
        }
    }

    fn write_to_file(&self, path: &str, content: &[u8]) -> io::Result<()> {
        match self.get(parent(path)) {
            Some(MockEntry::Dir) => {}
            Some(MockEntry::Denied) => return Err(denied()),
            _ => return Err(not_found()),
        }
        let mut entries = self.entries.borrow_mut();
        match entries.get_mut(key(path)) {
            Some(MockEntry::File(existing)) => existing.extend_from_slice(content),
            Some(MockEntry::Denied) => return Err(denied()),
            Some(_) => return Err(is_a_directory()),
            None => {
                entries.insert(key(path).to_string(), MockEntry::File(content.to_vec()));
            }
        }
        Ok(())
    }

    fn delete_file(&self, path: &str) -> io::Result<()> {
        match self.get(path) {
            Some(MockEntry::File(_)) => {
                self.entries.borrow_mut().remove(key(path));
                Ok(())
            }
            Some(MockEntry::Denied) => Err(denied()),
            Some(_) => Err(is_a_directory()),
            None => Err(not_found()),
        }
    }

    fn get_file_stat(&self, path: &str) -> io::Result<FileStat> {
        let size = match self.get(path) {
            Some(MockEntry::File(content)) => content.len() as u64,
            Some(MockEntry::Denied) => return Err(denied()),
            Some(_) => 4096,
            None => return Err(not_found()),
        };
        Ok(FileStat {
            size,
            modified: SystemTime::UNIX_EPOCH,
        })
    }
}

/// Scripted reads per descriptor. An empty chunk reads as end of file, an empty queue as
/// "would block".
#[derive(Debug, Default)]
struct ReadQueues(RefCell<HashMap<RawFd, VecDeque<Vec<u8>>>>);

impl ReadQueues {
    fn push(&self, fd: RawFd, data: &[u8]) {
        self.0
            .borrow_mut()
            .entry(fd)
            .or_default()
            .push_back(data.to_vec());
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let mut queues = self.0.borrow_mut();
        let queue = queues.get_mut(&fd).ok_or_else(would_block)?;
        let chunk = queue.front_mut().ok_or_else(would_block)?;
        if chunk.is_empty() {
            // End of file stays end of file.
            return Ok(0);
        }
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        chunk.drain(..n);
        if chunk.is_empty() {
            queue.pop_front();
        }
        Ok(n)
    }
}

#[derive(Debug, Default)]
pub struct MockSocketOps {
    reads: ReadQueues,
    written: RefCell<HashMap<RawFd, Vec<u8>>>,
    /// Accept at most this many bytes per write.
    write_limit: Cell<Option<usize>>,
    fail_writes: Cell<bool>,
    pending: RefCell<VecDeque<(Fd, SocketAddr)>>,
    fail_accept: Cell<bool>,
}

impl MockSocketOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_read(&self, fd: RawFd, data: &[u8]) {
        self.reads.push(fd, data);
    }

    pub fn push_eof(&self, fd: RawFd) {
        self.reads.push(fd, b"");
    }

    pub fn written(&self, fd: RawFd) -> Vec<u8> {
        self.written.borrow().get(&fd).cloned().unwrap_or_default()
    }

    pub fn written_text(&self, fd: RawFd) -> String {
        String::from_utf8_lossy(&self.written(fd)).into_owned()
    }

    pub fn clear_written(&self, fd: RawFd) {
        self.written.borrow_mut().remove(&fd);
    }

    pub fn set_write_limit(&self, limit: usize) {
        self.write_limit.set(Some(limit));
    }

    pub fn fail_writes(&self) {
        self.fail_writes.set(true);
    }

    /// Queue a client for the next accept; returns its descriptor.
    pub fn push_client(&self, addr: &str) -> RawFd {
        let fd = null_fd();
        let raw = fd.raw();
        let addr = addr.parse().expect("invalid client address");
        self.pending.borrow_mut().push_back((fd, addr));
        raw
    }

    pub fn fail_accept(&self) {
        self.fail_accept.set(true);
    }
}

impl SocketOps for MockSocketOps {
    fn resolve_listening_addresses(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let addr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        Ok(vec![addr])
    }

    fn create_listening_socket(&self, _addr: SocketAddr, _backlog: usize) -> io::Result<Fd> {
        Ok(null_fd())
    }

    fn retrieve_bound_socket_info(&self, _fd: RawFd) -> io::Result<SocketAddr> {
        Err(io::Error::from(io::ErrorKind::InvalidInput))
    }

    fn accept_single_connection(&self, _fd: RawFd) -> io::Result<Option<(Fd, SocketAddr)>> {
        if self.fail_accept.get() {
            return Err(io::Error::from_raw_os_error(libc::EMFILE));
        }
        Ok(self.pending.borrow_mut().pop_front())
    }

    fn read_from_socket(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.read(fd, buf)
    }

    fn write_to_socket(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes.get() {
            return Err(io::Error::from_raw_os_error(libc::EPIPE));
        }
        let n = self.write_limit.get().map_or(buf.len(), |limit| limit.min(buf.len()));
        self.written
            .borrow_mut()
            .entry(fd)
            .or_default()
            .extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Process operations that never really fork: the "child" is always pid 4242.
#[derive(Debug)]
pub struct MockProcessOps {
    reads: ReadQueues,
    written: RefCell<HashMap<RawFd, Vec<u8>>>,
    /// Number of pipes that can still be created, unlimited if `None`.
    pipes_left: Cell<Option<usize>>,
    fail_fork: Cell<bool>,
    fail_writes: Cell<bool>,
    wait_status: Cell<WaitStatus>,
    killed: RefCell<Vec<Pid>>,
}

pub const MOCK_CHILD: i32 = 4242;

impl MockProcessOps {
    pub fn new() -> Self {
        Self {
            reads: ReadQueues::default(),
            written: RefCell::new(HashMap::new()),
            pipes_left: Cell::new(None),
            fail_fork: Cell::new(false),
            fail_writes: Cell::new(false),
            wait_status: Cell::new(WaitStatus::Exited(Pid::from_raw(MOCK_CHILD), 0)),
            killed: RefCell::new(Vec::new()),
        }
    }

    pub fn push_read(&self, fd: RawFd, data: &[u8]) {
        self.reads.push(fd, data);
    }

    pub fn push_eof(&self, fd: RawFd) {
        self.reads.push(fd, b"");
    }

    pub fn written(&self, fd: RawFd) -> Vec<u8> {
        self.written.borrow().get(&fd).cloned().unwrap_or_default()
    }

    /// Let `count` more pipes succeed, then fail.
    pub fn fail_pipe_after(&self, count: usize) {
        self.pipes_left.set(Some(count));
    }

    pub fn fail_fork(&self) {
        self.fail_fork.set(true);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.set(true);
    }

    pub fn set_wait_status(&self, status: WaitStatus) {
        self.wait_status.set(status);
    }

    pub fn killed(&self) -> Vec<Pid> {
        self.killed.borrow().clone()
    }
}

impl ProcessOps for MockProcessOps {
    fn pipe_process(&self) -> io::Result<(Fd, Fd)> {
        match self.pipes_left.get() {
            Some(0) => return Err(io::Error::from_raw_os_error(libc::EMFILE)),
            Some(n) => self.pipes_left.set(Some(n - 1)),
            None => {}
        }
        Ok((null_fd(), null_fd()))
    }

    unsafe fn fork_process(&self) -> io::Result<ForkResult> {
        if self.fail_fork.get() {
            return Err(io::Error::from_raw_os_error(libc::EAGAIN));
        }
        Ok(ForkResult::Parent {
            child: Pid::from_raw(MOCK_CHILD),
        })
    }

    fn dup2_process(&self, _old: RawFd, _new: RawFd) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Other))
    }

    fn exec_process(
        &self,
        _path: &CStr,
        _argv: &[CString],
        _env: &[CString],
    ) -> io::Result<Infallible> {
        Err(io::Error::from(io::ErrorKind::Other))
    }

    fn read_process(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.read(fd, buf)
    }

    fn write_process(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes.get() {
            return Err(io::Error::from_raw_os_error(libc::EPIPE));
        }
        self.written
            .borrow_mut()
            .entry(fd)
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn wait_process(&self, _pid: Pid) -> io::Result<WaitStatus> {
        Ok(self.wait_status.get())
    }

    fn kill_process(&self, pid: Pid) -> io::Result<()> {
        self.killed.borrow_mut().push(pid);
        Ok(())
    }
}

/// Poller that records interests and hands out scripted events.
#[derive(Debug, Default)]
pub struct MockPoller {
    pub interests: HashMap<RawFd, Interest>,
    events: VecDeque<Vec<Event>>,
}

impl MockPoller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events returned by the next wait.
    pub fn push_events(&mut self, events: Vec<Event>) {
        self.events.push_back(events);
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.interests.get(&fd).copied()
    }
}

impl Poller for MockPoller {
    fn register_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if self.interests.contains_key(&fd) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        self.interests.insert(fd, interest);
        Ok(())
    }

    fn modify_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.interests.get_mut(&fd) {
            Some(current) => {
                *current = interest;
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn remove_interest(&mut self, fd: RawFd) -> io::Result<()> {
        match self.interests.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn wait_for_ready(&mut self, _timeout: Duration) -> io::Result<Vec<Event>> {
        Ok(self.events.pop_front().unwrap_or_default())
    }
}
