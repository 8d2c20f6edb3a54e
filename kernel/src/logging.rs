//! `log` facade backend
//!
//! Пишет строки вида `[LEVEL target] message` через консоль.
//! Writes `[LEVEL target] message` lines through the console.

use log::{Level, Log, Metadata, Record};

use crate::config::LOG_LEVEL;

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= LOG_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31,
            Level::Warn  => 93,
            Level::Info  => 34,
            Level::Debug => 32,
            Level::Trace => 90,
        };
        crate::kprintln!(
            "\x1b[{}m[{:<5} {}] {}\x1b[0m",
            color,
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Установить логгер ядра. Повторный вызов ничего не делает.
/// Install the kernel logger. Calling it again is a no-op.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LOG_LEVEL);
    }
}
