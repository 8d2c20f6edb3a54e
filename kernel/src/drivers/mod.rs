//! Kernel-space drivers
//!
//! В ядре остаётся только консоль для отладки / only the debug console lives here:
//!   - console — вывод через SBI putchar (на хосте — stderr)

pub mod console;

/// Макрос для отладочного вывода.
/// Debug print macro.
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::drivers::console::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kprintln {
    ()           => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ($crate::kprint!("{}\n", format_args!($($arg)*)));
}
