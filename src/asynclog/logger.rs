//! Bridges the `log` facade to [`super::AsyncLog`]: every `log::info!` (etc.)
//! call site renders through here into the line format described in the
//! crate's external-interface documentation.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;

use log::{Level, Log, Metadata, Record};

use crate::buffer::FixedBuffer;
use crate::timestamp::Timestamp;

pub use log::LevelFilter;

const LINE_BUFFER_SIZE: usize = 4_000;

struct AsyncLogger {
    sink: Arc<super::AsyncLog>,
}

fn level_label(level: Level) -> &'static str {
    match level {
        Level::Trace => "TRACE ",
        Level::Debug => "DEBUG ",
        Level::Info => "INFO  ",
        Level::Warn => "WARN  ",
        Level::Error => "ERROR ",
    }
}

impl Log for AsyncLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_record(record.level(), record.args().to_string().as_str(), record.file(), record.line());
        self.sink.append(line.as_bytes());
    }

    fn flush(&self) {
        self.sink.flush();
    }
}

fn format_record(level: Level, message: &str, file: Option<&str>, line: Option<u32>) -> String {
    let mut buf: FixedBuffer<LINE_BUFFER_SIZE> = FixedBuffer::new();
    let ts = Timestamp::now();
    let basename = file
        .map(|f| {
            Path::new(f)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| f.to_string())
        })
        .unwrap_or_else(|| "?".to_string());

    let _ = write!(
        buf,
        "{} {}{} - {}:{}\n",
        ts.to_formatted_string(true),
        level_label(level),
        message,
        basename,
        line.unwrap_or(0)
    );
    String::from_utf8_lossy(buf.data()).into_owned()
}

static LOGGER_SINK: OnceLock<Arc<super::AsyncLog>> = OnceLock::new();

/// Installs the async backend as the global `log` sink. Call once at
/// process startup, after building an [`super::AsyncLog`] from `Config`.
pub fn init(sink: Arc<super::AsyncLog>, level: LevelFilter) {
    sink.start();
    let _ = LOGGER_SINK.set(sink.clone());
    let logger: &'static AsyncLogger = Box::leak(Box::new(AsyncLogger { sink }));
    let _ = log::set_logger(logger);
    log::set_max_level(level);
}

/// Logs at a level above `Error`, flushes synchronously, and aborts the
/// process. `log::Level` has no `Fatal` variant, so this is a crate-local
/// macro rather than a facade call.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::asynclog::__fatal_impl(message, file!(), line!());
    }};
}

#[doc(hidden)]
pub fn __fatal_impl(message: String, file: &str, line: u32) -> ! {
    let line_text = format_record(Level::Error, &message, Some(file), Some(line));
    let line_text = line_text.replacen("ERROR ", "FATAL ", 1);
    if let Some(sink) = LOGGER_SINK.get() {
        sink.append(line_text.as_bytes());
        sink.stop();
    } else {
        eprint!("{line_text}");
    }
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatted_line_has_padded_level_and_location() {
        let line = format_record(Level::Warn, "disk nearly full", Some("src/asynclog/file.rs"), Some(42));
        assert!(line.contains("WARN  "));
        assert!(line.ends_with("file.rs:42\n"));
        assert!(line.contains("disk nearly full"));
    }

    #[test]
    fn all_levels_pad_to_six_characters() {
        for level in [Level::Trace, Level::Debug, Level::Info, Level::Warn, Level::Error] {
            assert_eq!(level_label(level).len(), 6);
        }
    }
}
