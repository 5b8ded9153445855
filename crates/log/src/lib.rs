//! Process-wide logger: level filter, text or JSON lines on stderr, and an
//! optional in-memory capture ring.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    fn load() -> Self {
        if LOG_FORMAT.load(Ordering::Relaxed) == Format::Json as u8 {
            Format::Json
        } else {
            Format::Text
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static LOG_TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static LOG_STDERR_ENABLED: AtomicBool = AtomicBool::new(true);

static CAPTURE_ENABLED: AtomicBool = AtomicBool::new(false);
static CAPTURE_CAPACITY: AtomicUsize = AtomicUsize::new(0);
static CAPTURE: OnceLock<Mutex<VecDeque<CapturedLog>>> = OnceLock::new();

/// One emitted line as kept by the capture ring.
#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub file: &'static str,
    pub line: u32,
    pub msg: String,
}

impl CapturedLog {
    pub fn contains(&self, needle: &str) -> bool {
        self.msg.contains(needle)
    }
}

pub fn init(config: LogConfig) {
    set_level(config.level);
    LOG_FORMAT.store(config.format as u8, Ordering::Relaxed);
    LOG_TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn set_level(level: Level) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_stderr_enabled(enabled: bool) {
    LOG_STDERR_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn enable_capture(capacity: usize) {
    if capacity == 0 {
        disable_capture();
        return;
    }
    CAPTURE_CAPACITY.store(capacity, Ordering::Relaxed);
    CAPTURE.get_or_init(|| Mutex::new(VecDeque::with_capacity(capacity.min(4096))));
    CAPTURE_ENABLED.store(true, Ordering::Relaxed);
}

pub fn disable_capture() {
    CAPTURE_ENABLED.store(false, Ordering::Relaxed);
}

pub fn clear_captured_logs() {
    if let Some(ring) = CAPTURE.get() {
        ring.lock().clear();
    }
}

/// The newest `limit` captured lines, oldest first.
pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    let Some(ring) = CAPTURE.get() else {
        return Vec::new();
    };
    let guard = ring.lock();
    let start = guard.len().saturating_sub(limit);
    guard.iter().skip(start).cloned().collect()
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let record = CapturedLog {
        ts_ms: now.as_millis().try_into().unwrap_or(u64::MAX),
        level,
        target,
        file,
        line,
        msg: args.to_string(),
    };

    if LOG_STDERR_ENABLED.load(Ordering::Relaxed) {
        let rendered = match Format::load() {
            Format::Text => render_text(&record, LOG_TIMESTAMPS.load(Ordering::Relaxed)),
            Format::Json => render_json(&record),
        };
        let _ = writeln!(io::stderr().lock(), "{rendered}");
    }

    if CAPTURE_ENABLED.load(Ordering::Relaxed) {
        push_capture(record);
    }
}

fn push_capture(record: CapturedLog) {
    let capacity = CAPTURE_CAPACITY.load(Ordering::Relaxed);
    let Some(ring) = CAPTURE.get() else {
        return;
    };
    if capacity == 0 {
        return;
    }
    let mut guard = ring.lock();
    guard.push_back(record);
    while guard.len() > capacity {
        guard.pop_front();
    }
}

pub fn render_text(record: &CapturedLog, timestamps: bool) -> String {
    let mut out = String::with_capacity(record.msg.len() + 48);
    if timestamps {
        out.push_str(&format_timestamp(Duration::from_millis(record.ts_ms)));
        out.push(' ');
    }
    out.push_str(record.level.as_str());
    out.push(' ');
    out.push_str(record.target);
    out.push_str(": ");
    out.push_str(&record.msg);
    out
}

pub fn render_json(record: &CapturedLog) -> String {
    json!({
        "ts_ms": record.ts_ms,
        "level": record.level.as_str(),
        "target": record.target,
        "file": record.file,
        "line": record.line,
        "msg": record.msg,
    })
    .to_string()
}

/// RFC 3339 UTC with millisecond precision.
pub fn format_timestamp(since_epoch: Duration) -> String {
    let secs = since_epoch.as_secs();
    let days = (secs / 86_400) as i64;
    let secs_of_day = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        secs_of_day / 3600,
        (secs_of_day % 3600) / 60,
        secs_of_day % 60,
        since_epoch.subsec_millis(),
    )
}

// Howard Hinnant's days-to-civil conversion.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(msg: &str) -> CapturedLog {
        CapturedLog {
            ts_ms: 1_767_225_600_123,
            level: Level::Warn,
            target: "powd::gossip",
            file: "gossip.rs",
            line: 42,
            msg: msg.to_string(),
        }
    }

    #[test]
    fn parse_level_and_format() {
        assert_eq!(Level::parse("WARNING"), Some(Level::Warn));
        assert_eq!(Level::parse(" trace "), Some(Level::Trace));
        assert_eq!(Level::parse("nope"), None);
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("xml"), None);
    }

    #[test]
    fn timestamp_is_rfc3339() {
        assert_eq!(
            format_timestamp(Duration::from_millis(1_767_225_600_123)),
            "2026-01-01T00:00:00.123Z"
        );
        assert_eq!(format_timestamp(Duration::ZERO), "1970-01-01T00:00:00.000Z");
        assert_eq!(
            format_timestamp(Duration::from_secs(951_782_400)),
            "2000-02-29T00:00:00.000Z"
        );
    }

    #[test]
    fn text_line_layout() {
        let line = render_text(&record("peer evicted"), false);
        assert_eq!(line, "WARN powd::gossip: peer evicted");
        let stamped = render_text(&record("x"), true);
        assert!(stamped.starts_with("2026-01-01T00:00:00.123Z WARN"));
    }

    #[test]
    fn json_line_fields() {
        let line = render_json(&record("quote \" inside"));
        let value: serde_json::Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value["level"], "WARN");
        assert_eq!(value["line"], 42);
        assert_eq!(value["msg"], "quote \" inside");
        assert_eq!(value["ts_ms"], 1_767_225_600_123u64);
    }
}
