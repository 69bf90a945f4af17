use std::convert::TryFrom;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};

use crate::fd::Fd;
use crate::sys::io_error;

const MAX_EVENTS: usize = 256;

/// What a descriptor is waited on for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// One kind of readiness reported by the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    Writable,
    Error,
    HangUp,
}

impl Readiness {
    fn bit(self) -> u8 {
        match self {
            Self::Readable => 1,
            Self::Writable => 2,
            Self::Error => 4,
            Self::HangUp => 8,
        }
    }
}

/// Set of readiness kinds for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadySet(u8);

impl ReadySet {
    pub fn with(mut self, readiness: Readiness) -> Self {
        self.0 |= readiness.bit();
        self
    }

    pub fn contains(self, readiness: Readiness) -> bool {
        self.0 & readiness.bit() != 0
    }

    /// Error or hang-up.
    pub fn is_failure(self) -> bool {
        self.contains(Readiness::Error) || self.contains(Readiness::HangUp)
    }
}

impl From<Readiness> for ReadySet {
    fn from(readiness: Readiness) -> Self {
        Self::default().with(readiness)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub ready: ReadySet,
}

impl Event {
    pub fn new(fd: RawFd, ready: impl Into<ReadySet>) -> Self {
        Self {
            fd,
            ready: ready.into(),
        }
    }
}

/// Readiness notification facility.
pub trait Poller {
    /// Start watching `fd`. Fails if it is already registered.
    fn register_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn modify_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn remove_interest(&mut self, fd: RawFd) -> io::Result<()>;
    /// Block until at least one descriptor is ready or `timeout` passes.
    fn wait_for_ready(&mut self, timeout: Duration) -> io::Result<Vec<Event>>;
}

/// Level-triggered epoll instance.
#[derive(Debug)]
pub struct EpollPoller {
    epoll: Fd,
    events: Vec<EpollEvent>,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        let epoll = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io_error)?;
        Ok(Self {
            epoll: Fd::from_raw(epoll),
            events: vec![EpollEvent::empty(); MAX_EVENTS],
        })
    }

    fn control(&mut self, op: EpollOp, fd: RawFd, interest: Interest) -> io::Result<()> {
        let flags = match interest {
            Interest::Readable => EpollFlags::EPOLLIN,
            Interest::Writable => EpollFlags::EPOLLOUT,
        };
        let mut event = EpollEvent::new(flags, fd as u64);
        epoll_ctl(self.epoll.raw(), op, fd, &mut event).map_err(io_error)
    }
}

impl Poller for EpollPoller {
    fn register_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.control(EpollOp::EpollCtlAdd, fd, interest)
    }

    fn modify_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.control(EpollOp::EpollCtlMod, fd, interest)
    }

    fn remove_interest(&mut self, fd: RawFd) -> io::Result<()> {
        epoll_ctl(self.epoll.raw(), EpollOp::EpollCtlDel, fd, None).map_err(io_error)
    }

    fn wait_for_ready(&mut self, timeout: Duration) -> io::Result<Vec<Event>> {
        let timeout_ms = isize::try_from(timeout.as_millis()).unwrap_or(isize::MAX);
        let ready = epoll_wait(self.epoll.raw(), &mut self.events, timeout_ms).map_err(io_error)?;
        Ok(self.events[..ready]
            .iter()
            .map(|event| {
                let flags = event.events();
                let mut ready = ReadySet::default();
                if flags.contains(EpollFlags::EPOLLIN) {
                    ready = ready.with(Readiness::Readable);
                }
                if flags.contains(EpollFlags::EPOLLOUT) {
                    ready = ready.with(Readiness::Writable);
                }
                if flags.contains(EpollFlags::EPOLLERR) {
                    ready = ready.with(Readiness::Error);
                }
                if flags.contains(EpollFlags::EPOLLHUP) {
                    ready = ready.with(Readiness::HangUp);
                }
                Event {
                    fd: event.data() as RawFd,
                    ready,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use nix::unistd::{pipe, write};

    #[test]
    fn ready_set_works() {
        let ready = ReadySet::from(Readiness::Readable).with(Readiness::HangUp);
        assert!(ready.contains(Readiness::Readable));
        assert!(!ready.contains(Readiness::Writable));
        assert!(ready.is_failure());
        assert!(!ReadySet::from(Readiness::Writable).is_failure());
    }

    #[test]
    fn epoll_reports_readable_pipe() {
        let (read_end, write_end) = pipe().unwrap();
        let read_end = Fd::from_raw(read_end);
        let write_end = Fd::from_raw(write_end);
        let mut poller = EpollPoller::new().unwrap();
        poller
            .register_interest(read_end.raw(), Interest::Readable)
            .unwrap();
        assert!(poller
            .register_interest(read_end.raw(), Interest::Readable)
            .is_err());

        let events = poller.wait_for_ready(Duration::from_millis(0)).unwrap();
        assert!(events.is_empty());

        write(write_end.raw(), b"ping").unwrap();
        let events = poller.wait_for_ready(Duration::from_millis(100)).unwrap();
        assert_eq!(events, vec![Event::new(read_end.raw(), Readiness::Readable)]);

        drop(write_end);
        let events = poller.wait_for_ready(Duration::from_millis(100)).unwrap();
        assert!(events[0].ready.contains(Readiness::HangUp));

        poller.remove_interest(read_end.raw()).unwrap();
        assert!(poller.remove_interest(read_end.raw()).is_err());
    }

    #[test]
    fn epoll_modify_to_writable() {
        let (read_end, write_end) = pipe().unwrap();
        let _read_end = Fd::from_raw(read_end);
        let write_end = Fd::from_raw(write_end);
        let mut poller = EpollPoller::new().unwrap();
        poller
            .register_interest(write_end.raw(), Interest::Readable)
            .unwrap();
        assert!(poller
            .wait_for_ready(Duration::from_millis(0))
            .unwrap()
            .is_empty());
        poller
            .modify_interest(write_end.raw(), Interest::Writable)
            .unwrap();
        let events = poller.wait_for_ready(Duration::from_millis(100)).unwrap();
        assert_eq!(events, vec![Event::new(write_end.raw(), Readiness::Writable)]);
    }
}
