//! Scheduler: round-robin over the process table
//!
//! Общий курсор помнит последний выбранный pid; поиск начинается со
//! следующего слота и обходит таблицу по кругу.
//! A shared cursor remembers the last pid picked; the search starts at the
//! next slot and wraps around the table.
//!
//! Каждый харт крутит собственный цикл `run`: выбрать процесс, пометить
//! RUNNING, переключиться, а после возврата снять RUNNING.
//! Every hart spins its own `run` loop: pick a process, mark it RUNNING,
//! switch to it, and clear RUNNING once it switches back.

use log::trace;

use crate::arch::{current as arch, TaskContext};
use crate::config::{INIT_PID, MAX_PROC};
use crate::cpu::{this_cpu, Cpu};
use crate::kernel::Kernel;
use crate::proc::sleep::{wakeup, WaitChannel};
use crate::proc::{Pid, ProcStatus, Process, ProcessTable};
use crate::sync::{SpinLock, SpinLockGuard};

pub struct Scheduler {
    cursor: SpinLock<Pid>,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self { cursor: SpinLock::new("sched_cursor", 0) }
    }

    pub fn cursor(&self) -> Pid {
        *self.cursor.lock()
    }

    /// Следующий готовый процесс после курсора; возвращается захваченным.
    /// The next runnable process after the cursor, returned locked.
    pub fn pick_next<'a>(&self, table: &'a ProcessTable) -> Option<SpinLockGuard<'a, Process>> {
        let used = table.used();
        let mut cursor = self.cursor.lock();
        for step in 1..=MAX_PROC {
            let pid = (*cursor + step) % MAX_PROC;
            if pid == 0 || !used.is_set(pid) {
                continue;
            }
            let p = table.slot(pid).lock();
            if p.is_runnable() {
                *cursor = pid;
                return Some(p);
            }
        }
        None
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Одна итерация цикла планировщика. `false`, если запускать было некого.
/// One pass of the idle loop. `false` when nothing was runnable.
pub fn run_once(kernel: &Kernel, cpu: &Cpu) -> bool {
    // Окно для прерываний, иначе все харты могут простаивать вечно.
    arch::intr_on();

    let Some(mut p) = kernel.scheduler.pick_next(&kernel.procs) else {
        arch::wait_for_interrupt();
        return false;
    };
    p.status.remove(ProcStatus::READY);
    p.status.insert(ProcStatus::RUNNING);
    let pid = p.pid;
    let context: *const TaskContext = &p.context;
    let root = p.page_dir.as_ref().map(|dir| dir.root());
    drop(p);

    arch::intr_off();
    cpu.set_current(Some(pid));
    if let Some(root) = root {
        arch::activate_page_table(root);
    }
    trace!(target: "sched", "hart {} -> pid {}", arch::hart_id(), pid);

    unsafe { arch::switch_context(cpu.scheduler_context(), context) };

    cpu.set_current(None);
    kernel.space.activate();
    finish_switch_out(kernel, pid);
    true
}

/// Цикл планировщика харта / A hart's idle loop
pub fn run(kernel: &Kernel, cpu: &Cpu) -> ! {
    loop {
        run_once(kernel, cpu);
    }
}

/// Процесс ушёл с харта: снять RUNNING. Завершившийся процесс становится
/// пригодным для wait только сейчас, поэтому родителя будят ещё раз.
/// The process has left the hart: clear RUNNING. An exited process becomes
/// reapable only now, so its parent is woken once more.
pub fn finish_switch_out(kernel: &Kernel, pid: Pid) {
    let parent = {
        let mut p = kernel.procs.slot(pid).lock();
        p.status.remove(ProcStatus::RUNNING);
        (p.pid == pid && p.is_reapable()).then(|| p.parent.unwrap_or(INIT_PID))
    };
    if let Some(parent) = parent {
        wakeup(kernel, WaitChannel::Child(parent));
    }
}

/// Отдать харт добровольно; процесс остаётся готовым.
/// Give up the hart voluntarily; the process stays runnable.
pub fn yield_now(kernel: &Kernel) {
    let Some(pid) = this_cpu().current() else {
        return;
    };
    let context = {
        let mut p = kernel.procs.slot(pid).lock();
        if !p.status.intersects(ProcStatus::WAITING | ProcStatus::STOPPED) {
            p.status.insert(ProcStatus::READY);
        }
        &mut p.context as *mut TaskContext
    };
    switch_to_scheduler(context);
}

/// Переключиться в контекст планировщика текущего харта.
/// Switch into the current hart's scheduler context.
///
/// Ни одного спинлока держать нельзя. Флаг SIE, сохранённый `push_off`,
/// принадлежит процессу, поэтому он переносится через переключение; после
/// возврата процесс может оказаться на другом харте.
/// No spinlock may be held. The SIE flag saved by `push_off` belongs to the
/// process, so it is carried across the switch; on return the process may be
/// on another hart.
pub fn switch_to_scheduler(context: *mut TaskContext) {
    let cpu = this_cpu();
    let depth = cpu.trap_depth();
    if depth != 0 {
        panic!("switch_to_scheduler: {} spinlock level(s) held", depth);
    }
    let enabled = cpu.saved_trap_enabled();
    unsafe { arch::switch_context(context, cpu.scheduler_context()) };
    this_cpu().restore_trap_enabled(enabled);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn cursor_starts_after_the_last_pick() {
        let kernel = testing::kernel();
        let a = testing::spawn(kernel, "a");
        let b = testing::spawn(kernel, "b");
        let c = testing::spawn(kernel, "c");

        let picked: alloc::vec::Vec<Pid> = (0..4)
            .map(|_| kernel.scheduler.pick_next(&kernel.procs).unwrap().pid)
            .collect();
        assert_eq!(picked, [a, b, c, a]);
        assert_eq!(kernel.scheduler.cursor(), a);
    }

    #[test]
    fn running_processes_are_skipped() {
        let kernel = testing::kernel();
        let a = testing::spawn(kernel, "a");
        let b = testing::spawn(kernel, "b");
        kernel.procs.slot(a).lock().status.insert(ProcStatus::RUNNING);
        let picked = kernel.scheduler.pick_next(&kernel.procs).map(|p| p.pid);
        assert_eq!(picked, Some(b));
    }

    #[test]
    fn empty_table_idles() {
        let kernel = testing::kernel();
        let cpu = this_cpu();
        assert!(!run_once(kernel, cpu));
        assert_eq!(cpu.current(), None);
    }

    #[test]
    fn run_once_marks_running_then_clears_it() {
        let kernel = testing::kernel();
        let pid = testing::spawn(kernel, "worker");
        let root = kernel.procs.lock(pid).and_then(|p| p.page_dir.as_ref().map(|d| d.root()));

        let seen = std::rc::Rc::new(core::cell::Cell::new(ProcStatus::empty()));
        let seen_in_hook = std::rc::Rc::clone(&seen);
        arch::set_switch_hook(move || {
            seen_in_hook.set(kernel.procs.slot(pid).lock().status);
            assert_eq!(this_cpu().current(), Some(pid));
            assert_eq!(Some(arch::active_root()), root);
        });
        assert!(run_once(kernel, this_cpu()));
        arch::clear_switch_hook();

        assert!(seen.get().contains(ProcStatus::RUNNING));
        assert!(!seen.get().contains(ProcStatus::READY));
        let status = kernel.procs.lock(pid).map(|p| p.status);
        assert_eq!(status, Some(ProcStatus::NORMAL));
        assert_eq!(this_cpu().current(), None);
        assert_eq!(arch::active_root(), kernel.space.root());
    }

    #[test]
    #[should_panic(expected = "spinlock level")]
    fn switching_with_a_lock_held_panics() {
        let lock = SpinLock::new("held", ());
        let _guard = lock.lock();
        let mut context = TaskContext::zero();
        switch_to_scheduler(&mut context);
    }
}
