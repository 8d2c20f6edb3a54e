//! Sleep / wakeup
//!
//! Процесс засыпает на канале, держа блокировку условия; блокировка
//! процесса берётся раньше, чем отпускается блокировка условия, поэтому
//! пробуждение не может проскочить между проверкой и засыпанием.
//! A process sleeps on a channel while holding the condition lock; its own
//! lock is taken before the condition lock is released, so a wakeup cannot
//! slip between the check and the sleep.

use crate::cpu::this_cpu;
use crate::kernel::Kernel;
use crate::sched;
use crate::sync::SpinLockGuard;

use super::{Pid, ProcStatus, Process};

/// Канал ожидания / Wait channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitChannel {
    /// Следующий тик таймера / the next timer tick
    Tick,
    /// Изменение среди детей процесса / a change among a process's children
    Child(Pid),
    /// Освобождение sleeplock по адресу / release of the sleeplock at an address
    SleepLock(usize),
    Disk(usize),
    Pipe(usize),
    Custom(usize),
}

fn park(process: &mut Process, chan: WaitChannel) -> *mut crate::arch::TaskContext {
    process.wait_chan = Some(chan);
    process.status.remove(ProcStatus::READY);
    process.status.insert(ProcStatus::WAITING);
    &mut process.context
}

/// Атомарно отпустить `guard` и уснуть на `chan`; вернуть перезахваченный гард.
/// Atomically release `guard` and sleep on `chan`; return it re-acquired.
///
/// `guard` не должен быть блокировкой самого процесса: для неё есть [`sleep_on_self`].
/// `guard` must not be the process's own lock: use [`sleep_on_self`] for that.
pub fn sleep<'a, T: ?Sized>(
    kernel: &Kernel,
    chan: WaitChannel,
    guard: SpinLockGuard<'a, T>,
) -> SpinLockGuard<'a, T> {
    let Some(pid) = this_cpu().current() else {
        panic!("sleep on {:?} outside a process", chan);
    };
    let condition = SpinLockGuard::source(&guard);
    let context = {
        let mut me = kernel.procs.slot(pid).lock();
        drop(guard);
        park(&mut me, chan)
    };
    sched::switch_to_scheduler(context);
    kernel.procs.slot(pid).lock().wait_chan = None;
    condition.lock()
}

/// Уснуть, когда условие охраняется блокировкой самого процесса.
/// Sleep when the condition is guarded by the process's own lock.
pub fn sleep_on_self<'a>(
    chan: WaitChannel,
    mut guard: SpinLockGuard<'a, Process>,
) -> SpinLockGuard<'a, Process> {
    let slot = SpinLockGuard::source(&guard);
    let context = park(&mut guard, chan);
    drop(guard);
    sched::switch_to_scheduler(context);
    let mut guard = slot.lock();
    guard.wait_chan = None;
    guard
}

/// Разбудить всех, кто спит на `chan`. Вызывающий не держит блокировок процессов.
/// Wake everyone sleeping on `chan`. The caller holds no process locks.
pub fn wakeup(kernel: &Kernel, chan: WaitChannel) -> usize {
    let used = kernel.procs.used();
    let mut woken = 0;
    for pid in used.iter() {
        let mut p = kernel.procs.slot(pid).lock();
        if p.status.contains(ProcStatus::WAITING) && p.wait_chan == Some(chan) {
            p.status.remove(ProcStatus::WAITING);
            p.status.insert(ProcStatus::READY | ProcStatus::NORMAL);
            woken += 1;
        }
    }
    woken
}
