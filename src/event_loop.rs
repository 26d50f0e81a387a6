//! `EventLoop`: the reactor. Exactly one per owning thread; all mutation of
//! the channels and timers it owns must happen on that thread.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::EventChannel;
use crate::error::{Error, Result};
use crate::poller::Poller;
use crate::timer::{Timer, TimerQueue};
use crate::timestamp::Timestamp;
use crate::waker::Waker;

type PendingTask = Box<dyn FnOnce() + Send>;

/// How long a single `poll()` call may block with nothing to do.
const POLL_TIMEOUT: Duration = Duration::from_millis(10_000);

/// One reactor: a poller, a timer queue, a wakeup descriptor, and a
/// mutex-guarded queue of tasks posted from other threads.
pub struct EventLoop {
    owner_thread: ThreadId,
    poller: Mutex<Poller>,
    timer_queue: Mutex<TimerQueue>,
    waker: Waker,
    channels: Mutex<HashMap<RawFd, Arc<Mutex<EventChannel>>>>,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
    pending_tasks: Mutex<Vec<PendingTask>>,
    iteration: AtomicI64,
}

impl EventLoop {
    pub fn new() -> Result<Arc<Self>> {
        let poller = Poller::new().map_err(Error::Io)?;
        let waker = Waker::new().map_err(Error::Io)?;
        let timer_queue = TimerQueue::new().map_err(Error::Io)?;
        let waker_fd = waker.raw_fd();
        let timer_fd = timer_queue.timerfd();

        let this = Arc::new(EventLoop {
            owner_thread: std::thread::current().id(),
            poller: Mutex::new(poller),
            timer_queue: Mutex::new(timer_queue),
            waker,
            channels: Mutex::new(HashMap::new()),
            quit: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            pending_tasks: Mutex::new(Vec::new()),
            iteration: AtomicI64::new(0),
        });

        let weak = Arc::downgrade(&this);
        let mut waker_channel = EventChannel::new(waker_fd);
        waker_channel.enable_reading();
        waker_channel.set_read_callback(move |_| {
            if let Some(l) = weak.upgrade() {
                let _ = l.waker.reset();
            }
        });
        this.add_channel(waker_fd, Arc::new(Mutex::new(waker_channel)));
        this.update_channel(waker_fd)?;

        let weak = Arc::downgrade(&this);
        let mut timer_channel = EventChannel::new(timer_fd);
        timer_channel.enable_reading();
        timer_channel.set_read_callback(move |_| {
            if let Some(l) = weak.upgrade() {
                // Timers are run with the queue's lock released: a timer
                // callback may call run_after/run_at, which re-locks this
                // same queue from add_timer, and parking_lot::Mutex is
                // non-reentrant.
                let mut expired = l.timer_queue.lock().take_expired();
                for timer in &mut expired {
                    timer.run();
                }
                l.timer_queue.lock().reschedule_and_rearm(expired);
            }
        });
        this.add_channel(timer_fd, Arc::new(Mutex::new(timer_channel)));
        this.update_channel(timer_fd)?;

        Ok(this)
    }

    pub fn is_in_loop_thread(&self) -> bool {
        std::thread::current().id() == self.owner_thread
    }

    fn assert_in_loop_thread(&self) {
        debug_assert!(
            self.is_in_loop_thread(),
            "EventLoop method called from a thread other than its owner"
        );
    }

    /// Runs immediately if called from the owning thread, otherwise enqueues
    /// via `queue_in_loop`.
    pub fn run_in_loop(self: &Arc<Self>, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Enqueues `f` to run on this loop's thread, waking the loop if the
    /// caller isn't the owner or if the loop is mid-dispatch of pending
    /// tasks (a callback posting another callback must force a re-wake).
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.pending_tasks.lock().push(Box::new(f));
        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::Acquire) {
            let _ = self.waker.wake();
        }
    }

    pub fn run_after(self: &Arc<Self>, delay: Duration, f: impl FnMut() + Send + 'static) {
        self.run_at(Timestamp::add(Timestamp::now(), delay.as_secs_f64()), f);
    }

    pub fn run_every(self: &Arc<Self>, interval: Duration, f: impl FnMut() + Send + 'static) {
        let when = Timestamp::add(Timestamp::now(), interval.as_secs_f64());
        self.add_timer(when, interval, f);
    }

    pub fn run_at(self: &Arc<Self>, when: Timestamp, f: impl FnMut() + Send + 'static) {
        self.add_timer(when, Duration::ZERO, f);
    }

    fn add_timer(self: &Arc<Self>, when: Timestamp, interval: Duration, f: impl FnMut() + Send + 'static) {
        let this = self.clone();
        let f = Mutex::new(f);
        self.run_in_loop(move || {
            let timer = Timer::new(
                Box::new(move || {
                    (*f.lock())();
                }),
                when,
                interval,
            );
            let earliest = this.timer_queue.lock().insert(timer);
            if earliest {
                this.timer_queue.lock().rearm(when);
            }
        });
    }

    /// Registers `channel` under `fd` so it can be looked up and dispatched
    /// after a poll returns it as active.
    pub fn add_channel(&self, fd: RawFd, channel: Arc<Mutex<EventChannel>>) {
        self.assert_in_loop_thread();
        self.channels.lock().insert(fd, channel);
    }

    pub fn update_channel(&self, fd: RawFd) -> Result<()> {
        self.assert_in_loop_thread();
        if let Some(ch) = self.channels.lock().get(&fd).cloned() {
            self.poller.lock().update_channel(&mut ch.lock()).map_err(Error::Io)?;
        }
        Ok(())
    }

    pub fn remove_channel(&self, fd: RawFd) -> Result<()> {
        self.assert_in_loop_thread();
        if let Some(ch) = self.channels.lock().remove(&fd) {
            self.poller.lock().remove_channel(&mut ch.lock()).map_err(Error::Io)?;
        }
        Ok(())
    }

    pub fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.lock().contains_key(&fd)
    }

    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            let _ = self.waker.wake();
        }
    }

    pub fn iteration(&self) -> i64 {
        self.iteration.load(Ordering::Relaxed)
    }

    /// The reactor loop: poll, dispatch, drain pending tasks, repeat until
    /// `quit()` is called.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        self.assert_in_loop_thread();
        let mut active = Vec::new();

        while !self.quit.load(Ordering::Acquire) {
            let receive_time = self
                .poller
                .lock()
                .poll(Some(POLL_TIMEOUT), &mut active)
                .map_err(Error::Io)?;
            self.iteration.fetch_add(1, Ordering::Relaxed);

            for &(fd, ready) in &active {
                let channel = self.channels.lock().get(&fd).cloned();
                if let Some(ch) = channel {
                    // Callbacks are taken out and run with the channel's own
                    // lock released: a callback (e.g. TcpConnection::send)
                    // may need to re-lock this same channel to adjust its
                    // interest set, and parking_lot::Mutex is non-reentrant.
                    let dispatch = ch.lock().take_for_dispatch(ready);
                    if let Some(dispatch) = dispatch {
                        let dispatch = dispatch.run(receive_time);
                        ch.lock().restore_after_dispatch(dispatch);
                    }
                }
            }
            self.do_pending_tasks();
        }
        Ok(())
    }

    fn do_pending_tasks(&self) {
        let mut tasks = Vec::new();
        {
            let mut locked = self.pending_tasks.lock();
            std::mem::swap(&mut tasks, &mut locked);
        }
        self.calling_pending_tasks.store(true, Ordering::Release);
        for task in tasks {
            task();
        }
        self.calling_pending_tasks.store(false, Ordering::Release);
    }
}
