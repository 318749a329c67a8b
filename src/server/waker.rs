use std::io;
use std::os::fd::RawFd;

/// An `eventfd` the poll thread registers for readability, so other threads
/// can cut an `epoll_wait` short.
#[derive(Debug)]
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd takes no pointers.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn wake(&self) -> io::Result<()> {
        let one: u64 = 1;
        // SAFETY: writes exactly the 8 bytes of `one`.
        let n = unsafe { libc::write(self.fd, (&raw const one).cast(), size_of::<u64>()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            // counter saturated: a wakeup is already pending
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Resets the counter after a wakeup was observed.
    pub fn drain(&self) {
        let mut value: u64 = 0;
        // SAFETY: reads at most 8 bytes into `value`.
        unsafe {
            libc::read(self.fd, (&raw mut value).cast(), size_of::<u64>());
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        // SAFETY: the fd is owned by this instance.
        unsafe {
            libc::close(self.fd);
        }
    }
}
