//! `Timer` and `TimerQueue`: an ordered set of pending callbacks backed by a
//! single `timerfd`, fed into the owning loop as one more readable channel.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::timestamp::Timestamp;

pub type TimerCallback = Box<dyn FnMut() + Send>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// A single scheduled callback: a fixed point in time, and (for repeating
/// timers) the interval to the next firing.
pub struct Timer {
    callback: TimerCallback,
    expiration: Timestamp,
    interval: Duration,
    repeat: bool,
    id: u64,
}

impl Timer {
    pub fn new(callback: TimerCallback, expiration: Timestamp, interval: Duration) -> Self {
        Timer {
            callback,
            expiration,
            repeat: interval > Duration::ZERO,
            interval,
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn run(&mut self) {
        (self.callback)();
    }

    pub fn expiration(&self) -> Timestamp {
        self.expiration
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    /// Advances `expiration` to `now + interval` for a repeating timer.
    pub fn restart(&mut self, now: Timestamp) {
        if self.repeat {
            self.expiration = Timestamp::add(now, self.interval.as_secs_f64());
        } else {
            self.expiration = Timestamp::INVALID;
        }
    }
}

fn create_timerfd() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn how_much_time_from_now(when: Timestamp) -> Duration {
    let micros = when.micros_since_epoch() - Timestamp::now().micros_since_epoch();
    let micros = micros.max(100); // clamp to avoid a zero-delay rearm oscillation
    Duration::from_micros(micros as u64)
}

fn read_timerfd(fd: RawFd) {
    let mut buf = [0u8; 8];
    let mut file = unsafe { std::mem::ManuallyDrop::new(std::fs::File::from_raw_fd(fd)) };
    let _ = file.read(&mut buf);
}

/// Ordered set of pending timers, keyed by `(expiration, id)` so equal
/// instants don't collide, with one `timerfd` armed at the earliest entry.
pub struct TimerQueue {
    timerfd: OwnedFd,
    active: BTreeSet<(Timestamp, u64)>,
    timers: HashMap<u64, Timer>,
}

impl TimerQueue {
    pub fn new() -> io::Result<Self> {
        Ok(TimerQueue {
            timerfd: create_timerfd()?,
            active: BTreeSet::new(),
            timers: HashMap::new(),
        })
    }

    pub fn timerfd(&self) -> RawFd {
        self.timerfd.as_raw_fd()
    }

    /// Inserts a timer. Returns `true` if it is now the earliest pending
    /// timer (the caller should rearm the kernel timer).
    pub fn insert(&mut self, timer: Timer) -> bool {
        let key = (timer.expiration, timer.id);
        let earliest_changed = self
            .active
            .iter()
            .next()
            .map(|&(t, _)| key.0 < t)
            .unwrap_or(true);
        self.active.insert(key);
        self.timers.insert(timer.id, timer);
        earliest_changed
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    fn reset_timerfd(&self, expiration: Timestamp) {
        let delta = how_much_time_from_now(expiration);
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delta.as_secs() as libc::time_t,
                tv_nsec: delta.subsec_nanos() as libc::c_long,
            },
        };
        unsafe {
            libc::timerfd_settime(self.timerfd.as_raw_fd(), 0, &spec, std::ptr::null_mut());
        }
    }

    /// Drains the kernel expiration count and removes every timer whose
    /// expiration has passed from the queue, returning them to be run by the
    /// caller. Does not run any callback itself, so it can be called while
    /// holding the queue's lock: a timer callback may schedule another timer,
    /// which needs to re-lock this same queue, so callbacks must run with no
    /// lock held. See `reschedule_and_rearm`.
    pub fn take_expired(&mut self) -> Vec<Timer> {
        read_timerfd(self.timerfd.as_raw_fd());
        let now = Timestamp::now();

        let expired: Vec<(Timestamp, u64)> = self
            .active
            .range(..=(now, u64::MAX))
            .cloned()
            .collect();
        let mut timers = Vec::with_capacity(expired.len());
        for key in expired {
            self.active.remove(&key);
            if let Some(timer) = self.timers.remove(&key.1) {
                timers.push(timer);
            }
        }
        timers
    }

    /// Reinserts repeating timers from a batch already run by the caller,
    /// then re-arms the kernel timer to the new earliest entry. Called after
    /// `take_expired`'s timers have all been run with no lock held.
    pub fn reschedule_and_rearm(&mut self, ran: Vec<Timer>) {
        let now = Timestamp::now();
        for mut timer in ran {
            if timer.repeat() {
                timer.restart(now);
                let key = (timer.expiration(), timer.id);
                self.active.insert(key);
                self.timers.insert(timer.id, timer);
            }
        }

        if let Some(&(next, _)) = self.active.iter().next() {
            self.reset_timerfd(next);
        }
    }

    /// Convenience wrapper around `take_expired` + running each timer +
    /// `reschedule_and_rearm`, for callers (such as tests) that drive a bare
    /// `TimerQueue` directly and never re-enter it from a timer callback.
    pub fn handle_read(&mut self) {
        let mut expired = self.take_expired();
        for timer in &mut expired {
            timer.run();
        }
        self.reschedule_and_rearm(expired);
    }

    /// Arms the kernel timer to `when` if it is (now) the earliest pending
    /// entry. Called right after `insert` returns `true`.
    pub fn rearm(&self, when: Timestamp) {
        self.reset_timerfd(when);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn insert_reports_earliest_change() {
        let mut q = TimerQueue::new().unwrap();
        let now = Timestamp::now();
        let t1 = Timer::new(Box::new(|| {}), Timestamp::add(now, 10.0), Duration::ZERO);
        assert!(q.insert(t1));
        let t2 = Timer::new(Box::new(|| {}), Timestamp::add(now, 20.0), Duration::ZERO);
        assert!(!q.insert(t2));
        let t3 = Timer::new(Box::new(|| {}), Timestamp::add(now, 5.0), Duration::ZERO);
        assert!(q.insert(t3));
    }

    #[test]
    fn expired_one_shot_timers_fire_and_are_removed() {
        let mut q = TimerQueue::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let now = Timestamp::now();
        let t = Timer::new(
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Timestamp::add(now, -1.0),
            Duration::ZERO,
        );
        q.insert(t);
        q.handle_read();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn repeating_timer_is_rescheduled() {
        let mut q = TimerQueue::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let now = Timestamp::now();
        let t = Timer::new(
            Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            Timestamp::add(now, -1.0),
            Duration::from_millis(50),
        );
        q.insert(t);
        q.handle_read();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!q.is_empty());
    }
}
