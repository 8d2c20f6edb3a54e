//! Simulated hart for host-side tests
//!
//! Каждый поток ОС играет роль отдельного харта: свой hart id, свой флаг SIE.
//! Each OS thread plays a separate hart: its own hart id and SIE flag.
//!
//! Переключение контекста здесь не меняет стек. Вместо этого вызывается
//! хук потока, в котором тест изображает «остальную систему» (планировщик,
//! другой харт, прерывание), после чего `switch_context` просто возвращается.
//! A context switch does not change stacks here. Instead the thread's hook
//! runs, letting a test play "the rest of the system" (scheduler, another
//! hart, an interrupt), and then `switch_context` simply returns.

use std::boxed::Box;
use std::cell::{Cell, RefCell};
use std::io::Write;

use super::TaskContext;
use crate::mm::PhysAddr;

type SwitchHook = Box<dyn FnMut()>;

std::thread_local! {
    static HART:         Cell<usize> = const { Cell::new(0) };
    static SIE:          Cell<bool>  = const { Cell::new(false) };
    static TIMER_ARMED:  Cell<usize> = const { Cell::new(0) };
    static SWITCHES:     Cell<usize> = const { Cell::new(0) };
    static ACTIVE_ROOT:  Cell<usize> = const { Cell::new(0) };
    static SWITCH_HOOK:  RefCell<Option<SwitchHook>> = const { RefCell::new(None) };
}

// ── Hart identity & interrupt flag ───────────────────────────────────────────

pub fn hart_id() -> usize {
    HART.with(Cell::get)
}

/// Назначить текущему потоку номер харта.
/// Assign a hart number to the current thread.
pub fn set_hart_id(id: usize) {
    HART.with(|h| h.set(id));
}

pub fn intr_get() -> bool {
    SIE.with(Cell::get)
}

pub fn intr_on() {
    SIE.with(|s| s.set(true));
}

pub fn intr_off() {
    SIE.with(|s| s.set(false));
}

pub fn wait_for_interrupt() {
    std::thread::yield_now();
}

pub fn clear_soft_interrupt() {}

// ── Timer ────────────────────────────────────────────────────────────────────

pub fn set_next_timer() {
    TIMER_ARMED.with(|t| t.set(t.get() + 1));
}

/// Сколько раз этот харт перезаводил таймер.
/// How many times this hart re-armed its timer.
pub fn timer_armed_count() -> usize {
    TIMER_ARMED.with(Cell::get)
}

// ── Paging ───────────────────────────────────────────────────────────────────

pub fn activate_page_table(root: PhysAddr) {
    ACTIVE_ROOT.with(|r| r.set(root.as_usize()));
}

/// Корень, последним загруженный в «satp» этого харта.
/// Root last loaded into this hart's "satp".
pub fn active_root() -> PhysAddr {
    PhysAddr::new(ACTIVE_ROOT.with(Cell::get))
}

pub fn flush_tlb() {}

pub fn enable_user_access() {}

// ── Context switch ───────────────────────────────────────────────────────────

/// Поставить хук, вызываемый на каждом переключении контекста этого потока.
/// Install the hook run on every context switch of this thread.
pub fn set_switch_hook(hook: impl FnMut() + 'static) {
    SWITCH_HOOK.with(|h| *h.borrow_mut() = Some(Box::new(hook)));
}

pub fn clear_switch_hook() {
    SWITCH_HOOK.with(|h| h.borrow_mut().take());
}

pub fn switch_count() -> usize {
    SWITCHES.with(Cell::get)
}

/// # Safety
/// Сигнатура совпадает с настоящим переключением; указатели не разыменовываются.
/// Same signature as the real switch; the pointers are never dereferenced.
pub unsafe fn switch_context(_from: *mut TaskContext, _to: *const TaskContext) {
    SWITCHES.with(|s| s.set(s.get() + 1));
    // Хук вынимается на время вызова: вложенные переключения внутри него — no-op.
    let hook = SWITCH_HOOK.with(|h| h.borrow_mut().take());
    if let Some(mut hook) = hook {
        hook();
        SWITCH_HOOK.with(|h| {
            let mut slot = h.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        });
    }
}

extern "C" fn host_user_return() {}

/// Точка входа свежего процесса (на хосте — пустышка).
/// Entry point of a fresh process (a dummy on the host).
pub fn user_return_entry() -> usize {
    host_user_return as *const () as usize
}

// ── Console ──────────────────────────────────────────────────────────────────

pub fn console_putchar(byte: u8) {
    let _ = std::io::stderr().write_all(&[byte]);
}

pub fn halt() -> ! {
    panic!("hart {} halted", hart_id());
}
