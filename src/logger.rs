//! Leveled logging with breadcrumb categories. Silent until the host installs
//! a sink; breadcrumbs are debug-grade traces gated by a category mask so the
//! hot path stays cheap when nobody listens.

use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

/// Install (or clear) the host log sink. `min_level` defaults to `Info`.
pub fn install_sink(sink: Option<Arc<dyn LogSink>>, min_level: Option<LogLevel>) {
    LOGGER.install_sink(sink, min_level);
}

pub fn set_breadcrumb_mask(mask: BreadcrumbFlags) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const STACK  = 0b0000_0001;
        const CONN   = 0b0000_0010;
        const PACKET = 0b0000_0100;
        const BATCH  = 0b0000_1000;
        const TIMER  = 0b0001_0000;
        const ALL    = u32::MAX;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Host-provided log consumer. Breadcrumb lines carry their category flag;
/// plain log lines carry an empty flag set.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str, breadcrumbs: BreadcrumbFlags);
}

#[derive(Clone)]
struct SinkInner {
    sink: Arc<dyn LogSink>,
    min_level: LogLevel,
    breadcrumbs: BreadcrumbFlags,
}

struct LogManager {
    sink: Mutex<Option<SinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[tf-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: Option<Arc<dyn LogSink>>, min_level: Option<LogLevel>) {
        let mut guard = self.sink.lock();
        *guard = sink.map(|sink| SinkInner {
            sink,
            min_level: min_level.unwrap_or(LogLevel::Info),
            breadcrumbs: BreadcrumbFlags::empty(),
        });
    }

    fn set_breadcrumb_mask(&self, mask: BreadcrumbFlags) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = mask;
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let inner = {
            let guard = self.sink.lock();
            guard.clone()
        };
        let Some(inner) = inner else { return };
        if breadcrumbs.is_empty() {
            if level > inner.min_level {
                return;
            }
        } else if !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let formatted = if breadcrumbs.is_empty() {
            format!("{} {}", self.prefix, message)
        } else {
            format!("{} [{}] {}", self.prefix, label_for(breadcrumbs), message)
        };
        inner.sink.log(level, &formatted, breadcrumbs);
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::CONN) {
        "CONN"
    } else if flags.contains(BreadcrumbFlags::PACKET) {
        "PACKET"
    } else if flags.contains(BreadcrumbFlags::STACK) {
        "STACK"
    } else if flags.contains(BreadcrumbFlags::BATCH) {
        "BATCH"
    } else if flags.contains(BreadcrumbFlags::TIMER) {
        "TIMER"
    } else {
        "LOG"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Capture {
        lines: StdMutex<Vec<(LogLevel, String, BreadcrumbFlags)>>,
    }

    impl LogSink for Capture {
        fn log(&self, level: LogLevel, message: &str, breadcrumbs: BreadcrumbFlags) {
            self.lines
                .lock()
                .unwrap()
                .push((level, message.to_string(), breadcrumbs));
        }
    }

    #[test]
    fn sink_filters_by_level_and_mask() {
        let capture = Arc::new(Capture {
            lines: StdMutex::new(Vec::new()),
        });
        install_sink(Some(capture.clone()), Some(LogLevel::Warn));

        debug("not delivered");
        warn("delivered");
        breadcrumb(BreadcrumbFlags::CONN, "masked out");
        set_breadcrumb_mask(BreadcrumbFlags::CONN);
        breadcrumb(BreadcrumbFlags::CONN, "delivered crumb");
        breadcrumb(BreadcrumbFlags::BATCH, "still masked");

        let lines = capture.lines.lock().unwrap().clone();
        install_sink(None, None);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, LogLevel::Warn);
        assert!(lines[0].1.contains("delivered"));
        assert_eq!(lines[1].2, BreadcrumbFlags::CONN);
        assert!(lines[1].1.contains("[CONN]"));
    }
}
