//! SBI console
//!
//! На железе каждый байт уходит через legacy SBI `console_putchar`.
//! On hardware every byte goes out through the legacy SBI `console_putchar`.
//! On the host the simulated hart writes to stderr instead.

use core::fmt;
use spin::Mutex;

use crate::arch::current as arch;

/// Отправить строку в консоль.
/// Send string to the console.
pub fn print(s: &str) {
    for byte in s.bytes() {
        arch::console_putchar(byte);
    }
}

// ── fmt::Write для использования с format_args! ───────────────────────────────

struct ConsoleWriter;

impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        print(s);
        Ok(())
    }
}

static CONSOLE_LOCK: Mutex<ConsoleWriter> = Mutex::new(ConsoleWriter);

/// Внутренняя функция для макроса kprint!
/// Internal function for kprint! macro
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    CONSOLE_LOCK.lock().write_fmt(args).ok();
}

/// Снять блокировку консоли, если паника случилась посреди вывода.
/// Break the console lock when a panic hit in the middle of a print.
///
/// # Safety
/// Только из обработчика паники, когда этот харт больше не вернётся к выводу.
/// Only from the panic handler, once this hart will never resume printing.
pub unsafe fn force_unlock() {
    if CONSOLE_LOCK.is_locked() {
        unsafe { CONSOLE_LOCK.force_unlock() };
    }
}
