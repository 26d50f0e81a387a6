//! `EventChannel` binds one file descriptor to one [`EventLoop`] and carries
//! the callbacks invoked when that descriptor becomes ready.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Weak};

use crate::poller::Interest;
use crate::timestamp::Timestamp;

pub(crate) type ReadCallback = Box<dyn FnMut(Timestamp) + Send>;
pub(crate) type EventCallback = Box<dyn FnMut() + Send>;

/// Where a channel's descriptor currently stands with respect to the poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollState {
    /// Never registered.
    New,
    /// Registered and tracked by the poller.
    Added,
    /// Was registered, then deregistered; the descriptor may still be valid.
    Removed,
}

/// Readiness bits reported back by the poller for one descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    pub priority: bool,
    pub error: bool,
    pub hangup: bool,
}

/// A descriptor plus its interest set, readiness state, and dispatch
/// callbacks, owned by exactly one [`crate::event_loop::EventLoop`].
pub struct EventChannel {
    fd: RawFd,
    interest: Interest,
    ready: Ready,
    state: PollState,
    tie: Option<Weak<dyn std::any::Any + Send + Sync>>,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl EventChannel {
    pub fn new(fd: RawFd) -> Self {
        EventChannel {
            fd,
            interest: Interest::NONE,
            ready: Ready::default(),
            state: PollState::New,
            tie: None,
            read_cb: None,
            write_cb: None,
            close_cb: None,
            error_cb: None,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub(crate) fn state(&self) -> PollState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: PollState) {
        self.state = state;
    }

    pub(crate) fn set_ready(&mut self, ready: Ready) {
        self.ready = ready;
    }

    pub fn set_read_callback(&mut self, cb: impl FnMut(Timestamp) + Send + 'static) {
        self.read_cb = Some(Box::new(cb));
    }

    pub fn set_write_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.write_cb = Some(Box::new(cb));
    }

    pub fn set_close_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.close_cb = Some(Box::new(cb));
    }

    pub fn set_error_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.error_cb = Some(Box::new(cb));
    }

    /// Ties this channel's lifetime to `owner`: before dispatching, the
    /// channel attempts to upgrade the weak reference and skips dispatch
    /// entirely if the owner has already been dropped.
    pub fn tie<T: Send + Sync + 'static>(&mut self, owner: &Arc<T>) {
        self.tie = Some(Arc::downgrade(owner) as Weak<dyn std::any::Any + Send + Sync>);
    }

    pub fn is_writing(&self) -> bool {
        self.interest.contains(Interest::WRITABLE)
    }

    pub fn is_reading(&self) -> bool {
        self.interest.contains(Interest::READABLE)
    }

    pub(crate) fn enable_reading(&mut self) {
        self.interest = self.interest.add(Interest::READABLE);
    }

    pub(crate) fn disable_reading(&mut self) {
        self.interest = self.interest.remove(Interest::READABLE);
    }

    pub(crate) fn enable_writing(&mut self) {
        self.interest = self.interest.add(Interest::WRITABLE);
    }

    pub(crate) fn disable_writing(&mut self) {
        self.interest = self.interest.remove(Interest::WRITABLE);
    }

    pub(crate) fn disable_all(&mut self) {
        self.interest = Interest::NONE;
    }

    pub(crate) fn is_none_event(&self) -> bool {
        self.interest == Interest::NONE
    }

    /// Runs the callback(s) appropriate to the last reported readiness.
    /// Order matches the original reactor: close, then error, then read,
    /// then write.
    pub(crate) fn handle_event(&mut self, receive_time: Timestamp) {
        if let Some(tie) = &self.tie {
            if tie.upgrade().is_none() {
                return;
            }
        }
        self.handle_event_with_guard(receive_time);
    }

    fn handle_event_with_guard(&mut self, receive_time: Timestamp) {
        if self.ready.hangup && !self.ready.readable {
            if let Some(cb) = &mut self.close_cb {
                cb();
            }
        }
        if self.ready.error {
            if let Some(cb) = &mut self.error_cb {
                cb();
            }
        }
        if self.ready.readable || self.ready.priority {
            if let Some(cb) = &mut self.read_cb {
                cb(receive_time);
            }
        }
        if self.ready.writable {
            if let Some(cb) = &mut self.write_cb {
                cb();
            }
        }
    }

    /// Takes the callbacks out of the channel for dispatch by a caller that
    /// cannot hold the channel's own lock while running them (a callback may
    /// need to re-lock this same channel, e.g. to adjust its interest set).
    /// Returns `None` if a tied owner has already been dropped, in which
    /// case nothing should run and nothing needs to be restored.
    pub(crate) fn take_for_dispatch(&mut self, ready: Ready) -> Option<DispatchCallbacks> {
        self.ready = ready;
        if let Some(tie) = &self.tie {
            tie.upgrade()?;
        }
        Some(DispatchCallbacks {
            ready,
            read_cb: self.read_cb.take(),
            write_cb: self.write_cb.take(),
            close_cb: self.close_cb.take(),
            error_cb: self.error_cb.take(),
        })
    }

    /// Puts callbacks taken by `take_for_dispatch` back once dispatch has
    /// finished and the channel's lock has been reacquired.
    pub(crate) fn restore_after_dispatch(&mut self, cbs: DispatchCallbacks) {
        self.read_cb = cbs.read_cb;
        self.write_cb = cbs.write_cb;
        self.close_cb = cbs.close_cb;
        self.error_cb = cbs.error_cb;
    }
}

/// A channel's callbacks, detached from the channel itself so they can run
/// without the channel's lock held. See [`EventChannel::take_for_dispatch`].
pub(crate) struct DispatchCallbacks {
    ready: Ready,
    read_cb: Option<ReadCallback>,
    write_cb: Option<EventCallback>,
    close_cb: Option<EventCallback>,
    error_cb: Option<EventCallback>,
}

impl DispatchCallbacks {
    /// Runs the callbacks in the same close/error/read/write order as
    /// `EventChannel::handle_event_with_guard`.
    pub(crate) fn run(mut self, receive_time: Timestamp) -> Self {
        if self.ready.hangup && !self.ready.readable {
            if let Some(cb) = &mut self.close_cb {
                cb();
            }
        }
        if self.ready.error {
            if let Some(cb) = &mut self.error_cb {
                cb();
            }
        }
        if self.ready.readable || self.ready.priority {
            if let Some(cb) = &mut self.read_cb {
                cb(receive_time);
            }
        }
        if self.ready.writable {
            if let Some(cb) = &mut self.write_cb {
                cb();
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_order_is_close_error_read_write() {
        let mut ch = EventChannel::new(0);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let o = order.clone();
        ch.set_close_callback(move || o.lock().push("close"));
        let o = order.clone();
        ch.set_error_callback(move || o.lock().push("error"));
        let o = order.clone();
        ch.set_read_callback(move |_| o.lock().push("read"));
        let o = order.clone();
        ch.set_write_callback(move || o.lock().push("write"));

        ch.set_ready(Ready {
            readable: true,
            writable: true,
            priority: false,
            error: true,
            hangup: false,
        });
        ch.handle_event(Timestamp::now());

        assert_eq!(*order.lock(), vec!["error", "read", "write"]);
    }

    #[test]
    fn hangup_without_readable_only_fires_close() {
        let mut ch = EventChannel::new(0);
        let fired = Arc::new(parking_lot::Mutex::new(Vec::<&'static str>::new()));
        let f = fired.clone();
        ch.set_close_callback(move || f.lock().push("close"));
        let f = fired.clone();
        ch.set_read_callback(move |_| f.lock().push("read"));

        ch.set_ready(Ready {
            readable: false,
            writable: false,
            priority: false,
            error: false,
            hangup: true,
        });
        ch.handle_event(Timestamp::now());
        assert_eq!(*fired.lock(), vec!["close"]);
    }

    #[test]
    fn dispatch_skipped_once_tied_owner_dropped() {
        let mut ch = EventChannel::new(0);
        let fired = Arc::new(parking_lot::Mutex::new(false));
        let owner = Arc::new(());
        ch.tie(&owner);
        let f = fired.clone();
        ch.set_read_callback(move |_| *f.lock() = true);
        ch.set_ready(Ready {
            readable: true,
            ..Default::default()
        });

        drop(owner);
        ch.handle_event(Timestamp::now());
        assert!(!*fired.lock());
    }
}
