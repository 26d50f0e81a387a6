//! An eventfd-backed descriptor used to wake a loop blocked in `epoll_wait`
//! from another thread.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

pub struct Waker {
    fd: File,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Waker {
            fd: unsafe { File::from_raw_fd(fd) },
        })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Writes `1` to the eventfd counter. If the counter is near overflow
    /// (`WouldBlock`), the counter is drained and the write retried once.
    pub fn wake(&self) -> io::Result<()> {
        match (&self.fd).write(&1u64.to_ne_bytes()) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.reset()?;
                (&self.fd).write(&1u64.to_ne_bytes()).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Drains the eventfd counter back to zero. Called from the owning
    /// loop's read callback after being woken.
    pub fn reset(&self) -> io::Result<()> {
        let mut buf = [0u8; 8];
        match (&self.fd).read(&mut buf) {
            Ok(_) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_reset_drains_counter() {
        let w = Waker::new().unwrap();
        w.wake().unwrap();
        w.wake().unwrap();
        w.reset().unwrap();
        // A second reset with nothing pending must not block or error.
        w.reset().unwrap();
    }
}
