//! stderr backend for the `log` facade
//!
//! Every crate in the workspace logs through `log::{error, warn, info, debug,
//! trace}`. This module provides the process-wide sink: one line per record,
//! written under the stderr lock so lines from different workers never
//! interleave.
//!
//! # Environment Variables
//!
//! - `SOCKSERVE_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0..5)
//! - `SOCKSERVE_FLUSH_EPRINT=1` - flush stderr after each line
//!
//! # Usage
//!
//! ```ignore
//! sockserve_core::logging::init();
//! log::info!("listening on {}", addr);
//! ```

use crate::env::{env_flag, env_var};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

static LOGGER: StderrLogger = StderrLogger;
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Line-oriented stderr logger
pub struct StderrLogger;

fn prefix(level: Level) -> &'static str {
    match level {
        Level::Error => "[ERROR]",
        Level::Warn => "[WARN] ",
        Level::Info => "[INFO] ",
        Level::Debug => "[DEBUG]",
        Level::Trace => "[TRACE]",
    }
}

/// Parse a level name or number, as accepted by `SOCKSERVE_LOG_LEVEL`
/// and the `log_level` configuration key
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    let level = match value.trim().to_lowercase().as_str() {
        "off" | "0" => LevelFilter::Off,
        "error" | "critical" | "1" => LevelFilter::Error,
        "warn" | "warning" | "2" => LevelFilter::Warn,
        "info" | "3" => LevelFilter::Info,
        "debug" | "4" => LevelFilter::Debug,
        "trace" | "verbose" | "5" => LevelFilter::Trace,
        _ => return None,
    };
    Some(level)
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = writeln!(
            handle,
            "{} {}: {}",
            prefix(record.level()),
            record.target(),
            record.args()
        );
        if FLUSH_ENABLED.load(Ordering::Relaxed) {
            let _ = handle.flush();
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the stderr logger and read the environment
///
/// Idempotent. If another logger is already installed (e.g. by a test
/// harness) that logger is kept.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Some(flush) = env_flag("SOCKSERVE_FLUSH_EPRINT") {
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    let level = env_var("SOCKSERVE_LOG_LEVEL")
        .and_then(|v| parse_level(&v))
        .unwrap_or(LevelFilter::Info);

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Set log level programmatically
pub fn set_log_level(level: LevelFilter) {
    log::set_max_level(level);
}

/// Set flush mode programmatically
pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}
