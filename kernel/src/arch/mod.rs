//! HAL — Hardware Abstraction Layer
//!
//! Выбираем реализацию в зависимости от цели сборки.
//! Select implementation based on the build target:
//!   riscv64 + `target_os = "none"` → настоящий харт / a real hart
//!   всё остальное                  → симулированный харт для тестов / simulated hart for tests

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod riscv64;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use riscv64 as current;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub mod host;
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub use host as current;

/// Сохранённые callee-saved регистры для переключения контекста.
/// Callee-saved registers kept across a context switch.
///
/// Порядок полей зашит в ассемблер `__switch_context`: ra, sp, s0–s11.
/// The field order is baked into the `__switch_context` assembly: ra, sp, s0–s11.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskContext {
    pub ra: usize,
    pub sp: usize,
    pub s:  [usize; 12],
}

impl TaskContext {
    pub const fn zero() -> Self {
        Self { ra: 0, sp: 0, s: [0; 12] }
    }

    /// Контекст, который при первом переключении прыгнет в `entry` на стеке `stack_top`.
    /// A context that jumps to `entry` on `stack_top` the first time it is switched to.
    pub const fn new(entry: usize, stack_top: usize) -> Self {
        Self { ra: entry, sp: stack_top, s: [0; 12] }
    }
}
