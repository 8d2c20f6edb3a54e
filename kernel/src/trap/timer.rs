//! Timer ticks

use log::trace;

use super::Origin;
use crate::arch::current as arch;
use crate::cpu::Cpu;
use crate::kernel::Kernel;
use crate::proc::sleep::{sleep, wakeup, WaitChannel};
use crate::sched;
use crate::sync::SpinLock;

/// Счётчик тиков; растёт только на харте 0.
/// Tick counter; only hart 0 advances it.
pub struct Ticks {
    count: SpinLock<u64>,
}

impl Ticks {
    pub const fn new() -> Self {
        Self { count: SpinLock::new("ticks", 0) }
    }

    pub fn now(&self) -> u64 {
        *self.count.lock()
    }
}

impl Default for Ticks {
    fn default() -> Self {
        Self::new()
    }
}

/// Один тик: счётчик +1 и пробуждение спящих на `Tick`.
/// One tick: bump the counter and wake `Tick` sleepers.
pub fn tick(kernel: &Kernel) {
    *kernel.ticks.count.lock() += 1;
    wakeup(kernel, WaitChannel::Tick);
}

/// Спать не меньше `n` тиков / Sleep for at least `n` ticks
pub fn sleep_ticks(kernel: &Kernel, n: u64) {
    let mut count = kernel.ticks.count.lock();
    let start = *count;
    while *count - start < n {
        count = sleep(kernel, WaitChannel::Tick, count);
    }
}

/// Прерывание таймера: тик (харт 0), следующий дедлайн, вытеснение процесса
/// из пользовательского режима.
/// Timer interrupt: tick (hart 0), next deadline, preempt a process
/// interrupted in user mode.
pub fn on_timer(kernel: &Kernel, cpu: &Cpu, origin: Origin) {
    if arch::hart_id() == 0 {
        tick(kernel);
    }
    arch::set_next_timer();
    if origin == Origin::User && cpu.current().is_some() {
        trace!(target: "trap", "preempt pid {:?}", cpu.current());
        sched::yield_now(kernel);
    }
}
