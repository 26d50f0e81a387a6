//! A fixed set of worker loops, each pinned to its own thread, handed out
//! round-robin to new connections.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::Result;
use crate::event_loop::EventLoop;

pub struct EventLoopPool {
    loops: Vec<Arc<EventLoop>>,
    handles: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl EventLoopPool {
    /// Spawns `num_threads` worker loops, each running `EventLoop::run` on
    /// its own thread. `num_threads == 0` yields an empty pool; callers
    /// should fall back to running everything on the base loop.
    pub fn start(num_threads: usize, name_prefix: &str) -> Result<Self> {
        let mut loops = Vec::with_capacity(num_threads);
        let mut handles = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let (tx, rx) = mpsc::channel();
            let thread_name = format!("{name_prefix}-{i}");
            let handle = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    let event_loop = match EventLoop::new() {
                        Ok(l) => l,
                        Err(e) => {
                            log::error!("worker loop failed to start: {e}");
                            return;
                        }
                    };
                    let _ = tx.send(event_loop.clone());
                    if let Err(e) = event_loop.run() {
                        log::error!("worker loop exited with error: {e}");
                    }
                })
                .map_err(crate::error::Error::Io)?;

            let event_loop = rx.recv().map_err(|_| crate::error::Error::Shutdown)?;
            loops.push(event_loop);
            handles.push(handle);
        }

        Ok(EventLoopPool {
            loops,
            handles,
            next: AtomicUsize::new(0),
        })
    }

    /// Picks the next worker loop round-robin. Panics if the pool is empty;
    /// callers with `num_threads == 0` must not call this.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[idx].clone()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn loops(&self) -> &[Arc<EventLoop>] {
        &self.loops
    }

    pub fn quit_all(&self) {
        for l in &self.loops {
            l.quit();
        }
    }

    pub fn join(self) {
        for h in self.handles {
            let _ = h.join();
        }
    }
}
