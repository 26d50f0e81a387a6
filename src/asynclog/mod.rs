//! Double-buffered producer/consumer log sink: producers append to a
//! frontend buffer under a short-held lock; a single backend thread drains
//! full buffers to disk.

mod file;
mod logger;

pub use file::LogFile;
pub use logger::{init, LevelFilter};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::buffer::FixedBuffer;

const FRONT_BUFFER_SIZE: usize = 4_000_000;
type FrontBuffer = FixedBuffer<FRONT_BUFFER_SIZE>;

struct Buffers {
    current: Box<FrontBuffer>,
    next: Option<Box<FrontBuffer>>,
    full: Vec<Box<FrontBuffer>>,
}

/// The frontend/backend pipeline. Cloning an `Arc<AsyncLog>` and calling
/// `append` from many threads is the expected usage; `start`/`stop` manage
/// the single backend thread.
pub struct AsyncLog {
    buffers: Mutex<Buffers>,
    cond: Condvar,
    running: AtomicBool,
    flush_interval: Duration,
    file: Mutex<LogFile>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl AsyncLog {
    pub fn new(basename: impl Into<String>, roll_size: u64, flush_interval: Duration) -> Arc<Self> {
        Arc::new(AsyncLog {
            buffers: Mutex::new(Buffers {
                current: Box::new(FrontBuffer::new()),
                next: Some(Box::new(FrontBuffer::new())),
                full: Vec::new(),
            }),
            cond: Condvar::new(),
            running: AtomicBool::new(false),
            flush_interval,
            file: Mutex::new(LogFile::new(basename.into(), roll_size, true, 1024)),
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = self.clone();
        let handle = std::thread::Builder::new()
            .name("asynclog".into())
            .spawn(move || this.backend_loop())
            .expect("failed to spawn asynclog backend thread");
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.cond.notify_one();
        if let Some(h) = self.handle.lock().take() {
            let _ = h.join();
        }
    }

    /// Wakes the backend thread so it drains whatever is buffered right now,
    /// without stopping it. A no-op if the backend isn't running.
    pub fn flush(&self) {
        if self.running.load(Ordering::Acquire) {
            self.cond.notify_one();
        }
    }

    /// Appends `line` to the current front buffer. Rotates to the spare
    /// buffer and wakes the backend if the current buffer is full.
    pub fn append(&self, line: &[u8]) {
        let mut b = self.buffers.lock();
        if b.current.avail() > line.len() {
            b.current.append(line);
            return;
        }

        let full = std::mem::replace(
            &mut b.current,
            b.next.take().unwrap_or_else(|| Box::new(FrontBuffer::new())),
        );
        b.full.push(full);
        b.current.append(line);
        self.cond.notify_one();
    }

    fn backend_loop(self: Arc<Self>) {
        let mut spare1 = Box::new(FrontBuffer::new());
        let mut spare2: Option<Box<FrontBuffer>> = Some(Box::new(FrontBuffer::new()));

        while self.running.load(Ordering::Acquire) {
            let to_write = {
                let mut b = self.buffers.lock();
                if b.full.is_empty() {
                    self.cond.wait_for(&mut b, self.flush_interval);
                }

                let finished = std::mem::replace(&mut b.current, spare1);
                b.full.push(finished);
                if b.next.is_none() {
                    b.next = spare2.take();
                }

                std::mem::take(&mut b.full)
            };

            for buf in &to_write {
                if !buf.is_empty() {
                    let mut f = self.file.lock();
                    let _ = f.append(buf.data());
                }
            }
            self.file.lock().flush();

            let mut to_write = to_write;
            spare1 = to_write.pop().unwrap_or_else(|| Box::new(FrontBuffer::new()));
            spare1.reset();
            spare2 = Some(
                to_write
                    .pop()
                    .map(|mut b| {
                        b.reset();
                        b
                    })
                    .unwrap_or_else(|| Box::new(FrontBuffer::new())),
            );
            // Any further buffers beyond the two we recycle are simply
            // dropped; the allocator reclaims them.
        }

        // Drain whatever accumulated after the loop's last check.
        let remaining = {
            let mut b = self.buffers.lock();
            let mut all = std::mem::take(&mut b.full);
            if !b.current.is_empty() {
                all.push(std::mem::replace(&mut b.current, Box::new(FrontBuffer::new())));
            }
            all
        };
        for buf in remaining {
            if !buf.is_empty() {
                let mut f = self.file.lock();
                let _ = f.append(buf.data());
            }
        }
        self.file.lock().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn append_below_threshold_stays_in_current_buffer() {
        let dir = std::env::temp_dir().join(format!("loopnet-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let basename = dir.join("small").to_string_lossy().into_owned();
        let log = AsyncLog::new(basename, 1024 * 1024, Duration::from_secs(3));
        log.append(b"hello\n");
        assert_eq!(log.buffers.lock().current.len(), 6);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn start_stop_flushes_pending_lines_to_disk() {
        let dir = std::env::temp_dir().join(format!("loopnet-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let basename = dir.join("flush").to_string_lossy().into_owned();
        let log = AsyncLog::new(basename.clone(), 1024 * 1024, Duration::from_millis(50));
        log.start();
        for _ in 0..1000 {
            log.append(b"a line of text\n");
        }
        log.stop();

        let mut total = 0usize;
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let mut contents = String::new();
            std::fs::File::open(entry.path())
                .unwrap()
                .read_to_string(&mut contents)
                .unwrap();
            total += contents.matches("a line of text").count();
        }
        assert_eq!(total, 1000);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
