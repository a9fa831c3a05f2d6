//! Console logger.
//!
//! Implements the `log::Log` trait and prints records to stderr with their
//! level and target. Runtime filtering goes through `log::set_max_level`.

use log::{Level, LevelFilter, Metadata, Record};

static LOGGER: ConsoleLogger = ConsoleLogger;

struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the logger.
pub fn init(max_level: LevelFilter) {
    log::set_logger(&LOGGER).expect("Failed to set logger");
    log::set_max_level(max_level);
}
