//! Thin wrapper over Linux `epoll`.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use libc::{EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, epoll_event};

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
pub const EPOLLRDHUP: u32 = libc::EPOLLRDHUP as u32;
pub const EPOLLET: u32 = libc::EPOLLET as u32;
pub const EPOLLONESHOT: u32 = libc::EPOLLONESHOT as u32;

const DEFAULT_MAX_EVENTS: usize = 1024;

pub struct Epoller {
    epoll_fd: RawFd,
    events: Vec<epoll_event>,
    ready: usize,
}

impl Epoller {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }

    /// Creates an epoll instance that reports at most `max_events` per wait.
    pub fn with_capacity(max_events: usize) -> io::Result<Self> {
        assert!(max_events > 0, "max_events must be positive");
        // SAFETY: epoll_create1 takes no pointers.
        let epoll_fd = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            events: vec![epoll_event { events: 0, u64: 0 }; max_events],
            ready: 0,
        })
    }

    pub fn add_fd(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, events)
    }

    pub fn mod_fd(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, events)
    }

    pub fn del_fd(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(EPOLL_CTL_DEL, fd, 0)
    }

    /// Blocks until at least one fd is ready or `timeout` elapses (`None`
    /// waits forever). Returns the number of ready entries; `0` means the
    /// timeout expired. A signal surfaces as [`io::ErrorKind::Interrupted`].
    ///
    /// Sub-millisecond timeouts round up, so a deadline that is nearly due
    /// still sleeps instead of returning at once.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => timeout_millis(d),
        };
        self.ready = 0;
        let max = i32::try_from(self.events.len()).unwrap_or(i32::MAX);
        // SAFETY: `events` is a live buffer of at least `max` entries.
        let n = unsafe { libc::epoll_wait(self.epoll_fd, self.events.as_mut_ptr(), max, timeout_ms) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.ready = n as usize;
        Ok(self.ready)
    }

    /// The fd of the `i`-th entry reported by the last [`wait`](Self::wait).
    pub fn event_fd(&self, i: usize) -> RawFd {
        debug_assert!(i < self.ready, "event {i} not reported by the last wait");
        let data = self.events[i].u64;
        data as RawFd
    }

    /// The readiness flags of the `i`-th entry reported by the last [`wait`](Self::wait).
    pub fn events(&self, i: usize) -> u32 {
        debug_assert!(i < self.ready, "event {i} not reported by the last wait");
        self.events[i].events
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32) -> io::Result<()> {
        if fd < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("invalid fd {fd}")));
        }
        let mut event = epoll_event { events, u64: fd as u64 };
        // SAFETY: `event` outlives the call; the kernel only reads it.
        let rc = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Milliseconds for `epoll_wait`, rounded up and clamped to `i32::MAX`.
pub fn timeout_millis(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_micros().div_ceil(1000)).unwrap_or(i32::MAX)
}

impl Drop for Epoller {
    fn drop(&mut self) {
        // SAFETY: the fd was created by this instance and is closed once.
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

impl std::fmt::Debug for Epoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Epoller")
            .field("epoll_fd", &self.epoll_fd)
            .field("capacity", &self.events.len())
            .field("ready", &self.ready)
            .finish()
    }
}
