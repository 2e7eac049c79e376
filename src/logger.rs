//! Logging infrastructure for crabmsc
//!
//! This module provides logging via the `log` crate, outputting to stderr.
//! Embedding applications that install their own `log` backend never need it.

use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};
use std::io::Write;

/// Stderr logger implementation
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let level_str = match record.level() {
                Level::Error => "\x1b[31mERROR\x1b[0m",
                Level::Warn => "\x1b[33mWARN\x1b[0m ",
                Level::Info => "\x1b[32mINFO\x1b[0m ",
                Level::Debug => "\x1b[34mDEBUG\x1b[0m",
                Level::Trace => "\x1b[35mTRACE\x1b[0m",
            };

            // Format: [LEVEL] target: message
            let _ = writeln!(
                std::io::stderr().lock(),
                "[{}] {}: {}",
                level_str,
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

static LOGGER: StderrLogger = StderrLogger;

/// Initialize the logging subsystem
///
/// Fails if another logger has already been installed.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Debug))
}

/// Set the maximum log level
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
