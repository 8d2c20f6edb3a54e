//! Supervisor Binary Interface calls
//!
//! Legacy-расширения (timer, putchar, shutdown) плюс HSM для старта остальных хартов.
//! Legacy extensions (timer, putchar, shutdown) plus HSM to start secondary harts.

use core::arch::asm;

const SBI_SET_TIMER:      usize = 0;
const SBI_CONSOLE_PUTCHAR: usize = 1;
const SBI_SHUTDOWN:       usize = 8;
const SBI_EXT_HSM:        usize = 0x48_534D;
/// RustSBI/K210: делегировать внешние прерывания в S-режим.
/// RustSBI/K210: delegate external interrupts to S-mode.
const SBI_K210_SET_MIE:   usize = 0x0A00_0005;

#[inline(always)]
fn sbi_call(eid: usize, fid: usize, arg0: usize, arg1: usize, arg2: usize) -> isize {
    let error: isize;
    unsafe {
        asm!(
            "ecall",
            inlateout("a0") arg0 => error,
            inlateout("a1") arg1 => _,
            in("a2") arg2,
            in("a6") fid,
            in("a7") eid,
        );
    }
    error
}

pub fn set_timer(stime: u64) {
    sbi_call(SBI_SET_TIMER, 0, stime as usize, 0, 0);
}

pub fn console_putchar(byte: u8) {
    sbi_call(SBI_CONSOLE_PUTCHAR, 0, byte as usize, 0, 0);
}

/// Запустить харт `hart` с адреса `start`; `opaque` попадёт в a1.
/// Start hart `hart` at `start`; `opaque` lands in a1.
pub fn hart_start(hart: usize, start: usize, opaque: usize) -> isize {
    sbi_call(SBI_EXT_HSM, 0, hart, start, opaque)
}

pub fn k210_enable_external() {
    sbi_call(SBI_K210_SET_MIE, 0, 0, 0, 0);
}

pub fn shutdown() -> ! {
    sbi_call(SBI_SHUTDOWN, 0, 0, 0, 0);
    loop {
        core::hint::spin_loop();
    }
}
