//! Thin wrapper around Linux `epoll(7)`, used by [`crate::event_loop::EventLoop`]
//! to multiplex the channels it owns.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::channel::{EventChannel, PollState, Ready};
use crate::timestamp::Timestamp;

/// Interest bits a channel registers with the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b001);
    pub const WRITABLE: Interest = Interest(0b010);
    pub const PRIORITY: Interest = Interest(0b100);

    pub const fn contains(&self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub const fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut events = libc::EPOLLET as u32;
    if interest.contains(Interest::READABLE) {
        events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::EPOLLOUT as u32;
    }
    if interest.contains(Interest::PRIORITY) {
        events |= libc::EPOLLPRI as u32;
    }
    events
}

fn epoll_event_to_ready(events: u32) -> Ready {
    let events = events as i32;
    Ready {
        readable: events & (libc::EPOLLIN | libc::EPOLLRDHUP) != 0,
        writable: events & libc::EPOLLOUT != 0,
        priority: events & libc::EPOLLPRI != 0,
        error: events & libc::EPOLLERR != 0,
        hangup: events & libc::EPOLLHUP != 0,
    }
}

/// Wraps one `epoll` instance. Not thread-safe to call concurrently; owned
/// by a single `EventLoop`.
pub struct Poller {
    epoll_fd: OwnedFd,
    event_buf: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Poller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            event_buf: vec![unsafe { std::mem::zeroed() }; 16],
        })
    }

    fn raw(&self) -> RawFd {
        self.epoll_fd.as_raw_fd()
    }

    /// Blocks for up to `timeout` (`None` = indefinitely) then dispatches
    /// the ready channels found, returning the poll's receive time.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<(RawFd, Ready)>,
    ) -> io::Result<Timestamp> {
        active.clear();
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                // Round up so a sub-millisecond timeout still blocks briefly
                // rather than busy-spinning on 0.
                ((d.as_nanos() + 999_999) / 1_000_000) as i32
            }
        };

        let n = unsafe {
            libc::epoll_wait(
                self.raw(),
                self.event_buf.as_mut_ptr(),
                self.event_buf.len() as i32,
                timeout_ms,
            )
        };

        let receive_time = Timestamp::now();
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(receive_time);
            }
            return Err(err);
        }

        for ev in &self.event_buf[..n as usize] {
            let fd = ev.u64 as RawFd;
            active.push((fd, epoll_event_to_ready(ev.events)));
        }

        if n as usize == self.event_buf.len() {
            let new_len = self.event_buf.len() * 2;
            self.event_buf.resize(new_len, unsafe { std::mem::zeroed() });
        }

        Ok(receive_time)
    }

    /// Publishes `channel`'s current interest set to the kernel, adding,
    /// modifying, or removing the epoll registration as its [`PollState`]
    /// dictates.
    pub fn update_channel(&mut self, channel: &mut EventChannel) -> io::Result<()> {
        match channel.state() {
            PollState::New | PollState::Removed => {
                if channel.is_none_event() {
                    channel.set_state(PollState::Removed);
                    return Ok(());
                }
                self.ctl(libc::EPOLL_CTL_ADD, channel)?;
                channel.set_state(PollState::Added);
            }
            PollState::Added => {
                if channel.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel)?;
                    channel.set_state(PollState::Removed);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel)?;
                }
            }
        }
        Ok(())
    }

    pub fn remove_channel(&mut self, channel: &mut EventChannel) -> io::Result<()> {
        if channel.state() == PollState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel)?;
        }
        channel.set_state(PollState::New);
        Ok(())
    }

    fn ctl(&self, op: i32, channel: &EventChannel) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest_to_epoll(channel.interest()),
            u64: channel.fd() as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.raw(), op, channel.fd(), &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_add_remove_round_trips() {
        let i = Interest::NONE.add(Interest::READABLE).add(Interest::WRITABLE);
        assert!(i.contains(Interest::READABLE));
        assert!(i.contains(Interest::WRITABLE));
        let i = i.remove(Interest::READABLE);
        assert!(!i.contains(Interest::READABLE));
        assert!(i.contains(Interest::WRITABLE));
    }

    #[test]
    fn poller_tracks_pipe_readability() {
        let mut fds = [0i32; 2];
        unsafe { assert_eq!(libc::pipe(fds.as_mut_ptr()), 0) };
        let [r, w] = fds;

        let mut poller = Poller::new().unwrap();
        let mut ch = EventChannel::new(r);
        ch.enable_reading();
        poller.update_channel(&mut ch).unwrap();

        let mut active = Vec::new();
        let ts = poller.poll(Some(Duration::from_millis(50)), &mut active).unwrap();
        let _ = ts;
        assert!(active.is_empty());

        unsafe {
            let byte = [1u8];
            libc::write(w, byte.as_ptr() as *const _, 1);
        }

        let mut active = Vec::new();
        poller
            .poll(Some(Duration::from_millis(500)), &mut active)
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, r);
        assert!(active[0].1.readable);

        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
