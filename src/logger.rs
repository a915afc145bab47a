// Level-filtered log sink. One process-wide threshold, lines to stderr:
//   [<tag>] [<iso-timestamp>] [<LEVEL>] <message>
// Non-scalar arguments are dumped on their own lines as pretty JSON.

use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

static THRESHOLD: AtomicU8 = AtomicU8::new(Level::Info as u8);

pub fn set_level(level: Level) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

/// Install the threshold from `CLUSTER_DEBUG`: a level name selects that
/// level, any other non-empty truthy value selects DEBUG.
pub fn level_from_env() {
    if let Ok(v) = std::env::var("CLUSTER_DEBUG") {
        if let Some(level) = Level::parse(&v) {
            set_level(level);
        } else if !v.is_empty() && v != "0" && v != "false" {
            set_level(Level::Debug);
        }
    }
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= THRESHOLD.load(Ordering::Relaxed)
}

#[derive(Debug, Clone)]
pub struct Logger {
    tag: String,
}

impl Logger {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    fn emit(&self, level: Level, msg: &str) {
        if !enabled(level) {
            return;
        }
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        eprintln!("[{}] [{}] [{}] {}", self.tag, ts, level.name(), msg);
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.emit(Level::Error, msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.emit(Level::Warn, msg.as_ref());
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.emit(Level::Info, msg.as_ref());
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        self.emit(Level::Debug, msg.as_ref());
    }

    pub fn trace(&self, msg: impl AsRef<str>) {
        self.emit(Level::Trace, msg.as_ref());
    }

    /// Message line followed by a structured dump of `value`.
    pub fn dump(&self, level: Level, msg: impl AsRef<str>, value: &Value) {
        if !enabled(level) {
            return;
        }
        self.emit(level, msg.as_ref());
        let rendered =
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
        eprintln!("{rendered}");
    }
}
