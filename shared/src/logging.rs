use anyhow::{Context, Result};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Trace => write!(f, "TRACE"),
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// Log category, one per engine component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    System,
    Sampler,
    Delta,
    Ranking,
    Loop,
    Control,
    Display,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogCategory::System => write!(f, "SYSTEM"),
            LogCategory::Sampler => write!(f, "SAMPLER"),
            LogCategory::Delta => write!(f, "DELTA"),
            LogCategory::Ranking => write!(f, "RANKING"),
            LogCategory::Loop => write!(f, "LOOP"),
            LogCategory::Control => write!(f, "CONTROL"),
            LogCategory::Display => write!(f, "DISPLAY"),
        }
    }
}

/// Global log level
static GLOBAL_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Where formatted log lines go; stderr when unset
static LOG_OUTPUT: OnceLock<Box<dyn Fn(&str) + Send + Sync>> = OnceLock::new();

pub fn set_log_level(level: LogLevel) {
    GLOBAL_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_log_level() -> LogLevel {
    match GLOBAL_LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        3 => LogLevel::Debug,
        4 => LogLevel::Trace,
        _ => LogLevel::Info,
    }
}

/// Installs the log sink. Only the first call takes effect.
pub fn set_log_output<F>(output: F)
where
    F: Fn(&str) + Send + Sync + 'static,
{
    let _ = LOG_OUTPUT.set(Box::new(output));
}

/// Sends log lines to `path` (appending) instead of stderr
pub fn set_log_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create log directory: {}", parent.display())
            })?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;
    let file = Mutex::new(file);

    set_log_output(move |line| {
        if let Ok(mut file) = file.lock() {
            let _ = writeln!(file, "{line}");
        }
    });
    Ok(())
}

pub fn log_message(level: LogLevel, category: LogCategory, message: &str) {
    if level > get_log_level() {
        return;
    }

    let timestamp = chrono::Utc::now().format("%H:%M:%S%.3f");
    let formatted = format!("[{timestamp}] [{level}] [{category}] {message}");

    if let Some(output) = LOG_OUTPUT.get() {
        output(&formatted);
    } else {
        eprintln!("{formatted}");
    }
}

#[macro_export]
macro_rules! log_error {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Error,
            $category,
            &format!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! log_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Warn,
            $category,
            &format!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! log_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Info,
            $category,
            &format!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! log_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Debug,
            $category,
            &format!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! log_trace {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::log_message(
            $crate::logging::LogLevel::Trace,
            $category,
            &format!($($arg)*)
        );
    };
}

/// Shorthands for the busiest categories
#[macro_export]
macro_rules! log_sampler {
    ($level:ident, $($arg:tt)*) => {
        $crate::paste::paste! {
            $crate::[<log_ $level>]!($crate::logging::LogCategory::Sampler, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_loop {
    ($level:ident, $($arg:tt)*) => {
        $crate::paste::paste! {
            $crate::[<log_ $level>]!($crate::logging::LogCategory::Loop, $($arg)*);
        }
    };
}

#[macro_export]
macro_rules! log_control {
    ($level:ident, $($arg:tt)*) => {
        $crate::paste::paste! {
            $crate::[<log_ $level>]!($crate::logging::LogCategory::Control, $($arg)*);
        }
    };
}
