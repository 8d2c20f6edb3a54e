//! RISC-V 64 (Sv39, S-mode under SBI)
//!
//! Регистр `tp` хранит номер харта с момента входа в `_start`.
//! The `tp` register holds the hart id from `_start` onwards.

pub mod sbi;
pub mod trap;

pub use trap::{init_hart as init_trap, user_trap_return};

use core::arch::asm;

use riscv::register::{satp, sstatus, time};

use super::TaskContext;
use crate::config::TIMER_INTERVAL;
use crate::mm::PhysAddr;

extern "C" {
    fn __switch_context(from: *mut TaskContext, to: *const TaskContext);
}

// ── Hart identity & interrupt flag ───────────────────────────────────────────

#[inline]
pub fn hart_id() -> usize {
    let id: usize;
    unsafe { asm!("mv {}, tp", out(reg) id) };
    id
}

#[inline]
pub fn intr_get() -> bool {
    sstatus::read().sie()
}

#[inline]
pub fn intr_on() {
    unsafe { sstatus::set_sie() };
}

#[inline]
pub fn intr_off() {
    unsafe { sstatus::clear_sie() };
}

pub fn wait_for_interrupt() {
    unsafe { riscv::asm::wfi() };
}

/// Сбросить SSIP / Clear SSIP
pub fn clear_soft_interrupt() {
    unsafe { asm!("csrc sip, {}", in(reg) 1usize << 1) };
}

// ── Timer ────────────────────────────────────────────────────────────────────

/// Завести таймер на `TIMER_INTERVAL` тиков вперёд.
/// Arm the timer `TIMER_INTERVAL` ticks ahead.
pub fn set_next_timer() {
    sbi::set_timer(time::read() as u64 + TIMER_INTERVAL);
}

// ── Paging ───────────────────────────────────────────────────────────────────

/// Записать satp (режим Sv39) и сбросить TLB.
/// Write satp (Sv39 mode) and flush the TLB.
pub fn activate_page_table(root: PhysAddr) {
    unsafe {
        satp::set(satp::Mode::Sv39, 0, root.as_usize() >> 12);
        riscv::asm::sfence_vma_all();
    }
}

pub fn flush_tlb() {
    unsafe { riscv::asm::sfence_vma_all() };
}

/// Разрешить ядру доступ к страницам с битом U (SUM).
/// Let the kernel touch U-bit pages (SUM).
pub fn enable_user_access() {
    unsafe { sstatus::set_sum() };
}

// ── Context switch ───────────────────────────────────────────────────────────

/// # Safety
/// `from` и `to` должны указывать на живые контексты; `to` — на контекст,
/// сохранённый этим же механизмом или созданный `TaskContext::new`.
/// `from` and `to` must point at live contexts; `to` was saved by this same
/// routine or built by `TaskContext::new`.
#[inline]
pub unsafe fn switch_context(from: *mut TaskContext, to: *const TaskContext) {
    unsafe { __switch_context(from, to) };
}

/// Адрес, с которого свежий процесс уходит в пользовательский режим.
/// Address from which a fresh process drops into user mode.
pub fn user_return_entry() -> usize {
    user_trap_return as usize
}

// ── Console & power ──────────────────────────────────────────────────────────

pub fn console_putchar(byte: u8) {
    sbi::console_putchar(byte);
}

pub fn halt() -> ! {
    intr_off();
    loop {
        wait_for_interrupt();
    }
}
