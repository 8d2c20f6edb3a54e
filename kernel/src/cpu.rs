//! Per-hart CPU records
//!
//! На каждом харте — своя запись: текущий pid, глубина запрета прерываний,
//! сохранённый флаг SIE и контекст планировщика.
//! Each hart owns one record: current pid, trap-disable depth, the saved
//! SIE flag and the scheduler's context.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::{current as arch, TaskContext};
use crate::proc::Pid;

const NO_PROCESS: usize = usize::MAX;

pub struct Cpu {
    current:      AtomicUsize,
    depth:        AtomicUsize,
    saved_enable: AtomicBool,
    scheduler:    UnsafeCell<TaskContext>,
}

// Все поля, кроме контекста, атомарны; контекст трогает только свой харт.
unsafe impl Sync for Cpu {}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            current:      AtomicUsize::new(NO_PROCESS),
            depth:        AtomicUsize::new(0),
            saved_enable: AtomicBool::new(false),
            scheduler:    UnsafeCell::new(TaskContext::zero()),
        }
    }

    /// Процесс, исполняющийся на этом харте.
    /// Process running on this hart.
    pub fn current(&self) -> Option<Pid> {
        match self.current.load(Ordering::Relaxed) {
            NO_PROCESS => None,
            pid        => Some(pid),
        }
    }

    pub fn set_current(&self, pid: Option<Pid>) {
        self.current.store(pid.unwrap_or(NO_PROCESS), Ordering::Relaxed);
    }

    /// Глубина вложенности `push_off`.
    /// `push_off` nesting depth.
    pub fn trap_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Флаг SIE, который восстановит последний `pop_off`.
    /// SIE flag the outermost `pop_off` will restore.
    pub fn saved_trap_enabled(&self) -> bool {
        self.saved_enable.load(Ordering::Relaxed)
    }

    pub fn restore_trap_enabled(&self, enabled: bool) {
        self.saved_enable.store(enabled, Ordering::Relaxed);
    }

    pub fn scheduler_context(&self) -> *mut TaskContext {
        self.scheduler.get()
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

// ── Trap masking ─────────────────────────────────────────────────────────────

/// Запретить прерывания, запомнив прежнее состояние при первом вложении.
/// Disable interrupts, remembering the previous state on the outermost push.
pub fn push_off() {
    let was_enabled = arch::intr_get();
    arch::intr_off();
    let cpu = this_cpu();
    if cpu.depth.load(Ordering::Relaxed) == 0 {
        cpu.saved_enable.store(was_enabled, Ordering::Relaxed);
    }
    cpu.depth.fetch_add(1, Ordering::Relaxed);
}

/// Снять один уровень запрета; при выходе на 0 вернуть SIE, если он был включён.
/// Drop one level; at depth 0 re-enable SIE if it was on before the outermost push.
pub fn pop_off() {
    let cpu = this_cpu();
    if arch::intr_get() {
        panic!("pop_off: interrupts enabled");
    }
    let depth = cpu.depth.load(Ordering::Relaxed);
    if depth == 0 {
        panic!("pop_off: unbalanced");
    }
    cpu.depth.store(depth - 1, Ordering::Relaxed);
    if depth == 1 && cpu.saved_enable.load(Ordering::Relaxed) {
        arch::intr_on();
    }
}

/// Выполнить `f` с запрещёнными прерываниями.
/// Run `f` with interrupts disabled.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    push_off();
    let result = f();
    pop_off();
    result
}

// ── Lookup ───────────────────────────────────────────────────────────────────

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
static CPUS: [Cpu; crate::config::MAX_CPUS] = [const { Cpu::new() }; crate::config::MAX_CPUS];

/// Запись текущего харта.
/// Record of the current hart.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn this_cpu() -> &'static Cpu {
    &CPUS[arch::hart_id()]
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
std::thread_local! {
    static HOST_CPU: &'static Cpu = std::boxed::Box::leak(std::boxed::Box::new(Cpu::new()));
}

/// На хосте каждый поток — отдельный харт со своей записью.
/// On the host each thread is a separate hart with its own record.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn this_cpu() -> &'static Cpu {
    HOST_CPU.with(|cpu| *cpu)
}
