//! Rolling log file: rotates on size or day-boundary crossing.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};

use crate::timestamp::Timestamp;

const SECONDS_PER_DAY: i64 = 86_400;

/// Appends to a file named `<basename>.<YYYYmmdd-HHMMSS>.log`, rolling to a
/// fresh file when either the accumulated byte count exceeds `roll_size` or
/// the local calendar day has changed since the current file was opened.
pub struct LogFile {
    basename: String,
    roll_size: u64,
    flush_every_n: u32,
    check_every_n: u32,

    file: File,
    written_bytes: u64,
    start_of_period: i64,
    last_roll: Timestamp,
    last_flush: Timestamp,
    count: u32,
}

impl LogFile {
    pub fn new(basename: String, roll_size: u64, thread_safe: bool, check_every_n: u32) -> Self {
        let _ = thread_safe; // caller (AsyncLog) already serializes access
        let now = Timestamp::now();
        let file = Self::open_for(&basename, now);
        LogFile {
            basename,
            roll_size,
            flush_every_n: check_every_n,
            check_every_n,
            file,
            written_bytes: 0,
            start_of_period: day_start(now),
            last_roll: now,
            last_flush: now,
            count: 0,
        }
    }

    fn open_for(basename: &str, now: Timestamp) -> File {
        let filename = format!(
            "{basename}.{}.log",
            now.to_formatted_string(false).replace(['/', ' ', ':'], "")
        );
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)
            .unwrap_or_else(|e| panic!("failed to open log file {filename}: {e}"))
    }

    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.written_bytes += data.len() as u64;

        if self.written_bytes > self.roll_size {
            self.roll_file();
        } else {
            self.count += 1;
            if self.count >= self.check_every_n {
                self.count = 0;
                let now = Timestamp::now();
                let this_period = day_start(now);
                if this_period != self.start_of_period {
                    self.roll_file();
                } else if now.micros_since_epoch() - self.last_flush.micros_since_epoch()
                    > self.flush_every_n as i64 * 1_000_000
                {
                    self.last_flush = now;
                    self.flush();
                }
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) {
        let _ = self.file.flush();
    }

    /// Closes the current file and opens a fresh one. Always assigns
    /// `last_flush = now` on return.
    fn roll_file(&mut self) {
        let now = Timestamp::now();
        self.file = Self::open_for(&self.basename, now);
        self.written_bytes = 0;
        self.start_of_period = day_start(now);
        self.last_roll = now;
        self.last_flush = now;
    }
}

fn day_start(t: Timestamp) -> i64 {
    let secs = t.micros_since_epoch() / crate::timestamp::MICRO_SECONDS_PER_SECOND;
    secs / SECONDS_PER_DAY * SECONDS_PER_DAY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolls_when_roll_size_exceeded() {
        let dir = std::env::temp_dir().join(format!("loopnet-logfile-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let basename = dir.join("roll").to_string_lossy().into_owned();

        let mut f = LogFile::new(basename, 64, true, 1024);
        f.append(&[b'x'; 100]).unwrap();
        let before = f.last_roll;
        std::thread::sleep(std::time::Duration::from_millis(2));
        f.append(b"more").unwrap();
        assert!(f.last_roll >= before);

        let entries: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert!(entries.len() >= 1);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
