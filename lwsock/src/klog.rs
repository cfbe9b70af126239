//! In-memory log sink
//!
//! Provides a ring buffer for log records that can be:
//! - Written to by any subsystem through the `log` facade
//! - Echoed to stderr while debugging
//! - Inspected after the fact (tests, `sockctl log`)

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// Ring capacity
const LOG_BUFFER_SIZE: usize = 256;

/// Longer messages are cut and marked with "..."
const MAX_MESSAGE_LEN: usize = 256;

/// Reference point for timestamps
static EPOCH: OnceLock<Instant> = OnceLock::new();

fn now_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

fn level_color(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[0m",
        log::Level::Debug | log::Level::Trace => "\x1b[90m",
    }
}

/// One buffered record
#[derive(Clone, Debug)]
pub struct LogEntry {
    /// Timestamp (ms since the sink first saw a record)
    pub timestamp: u64,
    pub level: log::Level,
    /// Subsystem, taken from the record target (e.g. "lwsock::socket::tcp")
    pub subsystem: String,
    pub message: String,
    /// Name of the thread that logged this
    pub thread: String,
}

impl LogEntry {
    /// Plain `[sec.ms] LEVEL [thread] subsystem: message` line
    pub fn format(&self) -> String {
        format!(
            "[{:>10}.{:03}] {:<5} [{}] {}: {}",
            self.timestamp / 1000,
            self.timestamp % 1000,
            self.level.as_str(),
            self.thread,
            self.subsystem,
            self.message
        )
    }

    /// Same line with ANSI level colours
    pub fn format_colored(&self) -> String {
        format!(
            "\x1b[90m[{:>10}.{:03}]\x1b[0m {}{:<5}\x1b[0m \x1b[36m[{}]\x1b[0m \x1b[33m{}:\x1b[0m {}",
            self.timestamp / 1000,
            self.timestamp % 1000,
            level_color(self.level),
            self.level.as_str(),
            self.thread,
            self.subsystem,
            self.message
        )
    }
}

/// Ring buffer for log messages
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
    /// Total messages accepted, including ones already evicted
    sequence: AtomicUsize,
    /// Most verbose level kept, as `log::LevelFilter as usize`
    level_filter: AtomicUsize,
    console_enabled: AtomicBool,
}

impl LogBuffer {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            sequence: AtomicUsize::new(0),
            level_filter: AtomicUsize::new(log::LevelFilter::Debug as usize),
            console_enabled: AtomicBool::new(false),
        }
    }

    /// Whether a record at `level` would be kept
    pub fn accepts(&self, level: log::Level) -> bool {
        (level as usize) <= self.level_filter.load(Ordering::Relaxed)
    }

    /// Append a record, evicting the oldest when full
    pub fn push(&self, level: log::Level, subsystem: &str, message: &str) {
        if !self.accepts(level) {
            return;
        }

        let message = if message.len() > MAX_MESSAGE_LEN {
            let mut cut = MAX_MESSAGE_LEN - 3;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            let mut s = String::from(&message[..cut]);
            s.push_str("...");
            s
        } else {
            String::from(message)
        };

        let entry = LogEntry {
            timestamp: now_ms(),
            level,
            subsystem: String::from(subsystem),
            message,
            thread: std::thread::current().name().unwrap_or("?").to_string(),
        };

        if self.console_enabled.load(Ordering::Relaxed) && level <= log::Level::Info {
            eprintln!("{}", entry.format_colored());
        }

        // A poisoned buffer still holds valid entries
        let mut buffer = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if buffer.len() >= LOG_BUFFER_SIZE {
            buffer.pop_front(); // Drop oldest
        }
        buffer.push_back(entry);

        self.sequence.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain all entries
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut buffer = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        buffer.drain(..).collect()
    }

    /// Get recent entries without removing them, newest first
    pub fn recent(&self, count: usize) -> Vec<LogEntry> {
        let buffer = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        buffer.iter().rev().take(count).cloned().collect()
    }

    /// Snapshot of every buffered record, oldest first
    pub fn all(&self) -> Vec<LogEntry> {
        let buffer = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        buffer.iter().cloned().collect()
    }

    pub fn set_level(&self, level: log::LevelFilter) {
        self.level_filter.store(level as usize, Ordering::Release);
    }

    /// Enable/disable stderr echo
    pub fn set_console(&self, enabled: bool) {
        self.console_enabled.store(enabled, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total messages logged
    pub fn sequence(&self) -> usize {
        self.sequence.load(Ordering::Relaxed)
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl log::Log for LogBuffer {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        self.accepts(metadata.level())
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            self.push(record.level(), record.target(), &record.args().to_string());
        }
    }

    fn flush(&self) {}
}

/// Global log buffer
/// Note: console echo is off until `set_console(true)`
pub static KLOG: LogBuffer = LogBuffer::new();

/// Install `KLOG` as the process logger.
///
/// Safe to call more than once; later calls only adjust the level.
pub fn init(level: log::LevelFilter) {
    let _ = log::set_logger(&KLOG);
    KLOG.set_level(level);
    log::set_max_level(level);
}

/// Set the most verbose level kept
pub fn set_log_level(level: log::LevelFilter) {
    KLOG.set_level(level);
}

/// Enable or disable stderr echo
pub fn set_console_output(enabled: bool) {
    KLOG.set_console(enabled);
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let buf = LogBuffer::new();
        for i in 0..LOG_BUFFER_SIZE + 10 {
            buf.push(log::Level::Info, "test", &format!("msg {i}"));
        }
        assert_eq!(buf.len(), LOG_BUFFER_SIZE);
        assert_eq!(buf.sequence(), LOG_BUFFER_SIZE + 10);
        let all = buf.all();
        assert_eq!(all[0].message, "msg 10");
        assert_eq!(buf.recent(1)[0].message, format!("msg {}", LOG_BUFFER_SIZE + 9));
    }

    #[test]
    fn test_level_filter() {
        let buf = LogBuffer::new();
        buf.set_level(log::LevelFilter::Warn);
        buf.push(log::Level::Debug, "test", "hidden");
        buf.push(log::Level::Error, "test", "shown");
        let all = buf.drain();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].message, "shown");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_long_message_truncated() {
        let buf = LogBuffer::new();
        let long = "x".repeat(MAX_MESSAGE_LEN * 2);
        buf.push(log::Level::Warn, "test", &long);
        let entry = &buf.all()[0];
        assert_eq!(entry.message.len(), MAX_MESSAGE_LEN);
        assert!(entry.message.ends_with("..."));
        assert!(entry.format().contains("WARN"));
    }
}
