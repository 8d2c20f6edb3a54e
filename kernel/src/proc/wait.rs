//! wait: reap stopped children
//!
//! Слот ребёнка освобождается только здесь и только когда он STOPPED и уже
//! ушёл с харта (RUNNING снят).
//! A child's slot is freed only here and only once it is STOPPED and has left
//! its hart (RUNNING cleared).

use log::debug;

use super::lifecycle::reclaim;
use super::sleep::{sleep_on_self, WaitChannel};
use super::{Pid, Process};
use crate::cpu::this_cpu;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::mm::vmm::PageDirectory;
use crate::mm::PhysAddr;

/// Кого ждать / Whom to wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Any,
    Pid(Pid),
}

impl WaitTarget {
    fn matches(self, pid: Pid) -> bool {
        match self {
            WaitTarget::Any => true,
            WaitTarget::Pid(want) => want == pid,
        }
    }
}

/// Ребёнок, вынутый из таблицы; его ресурсы ещё надо вернуть.
/// A child taken out of the table; its resources still have to be returned.
struct Reaped {
    pid:          Pid,
    status:       i64,
    dir:          Option<PageDirectory>,
    kernel_stack: Option<PhysAddr>,
}

/// Попробовать забрать одного ребёнка, держа блокировку родителя.
/// Try to reap one child while holding the parent's lock.
fn reap_one(kernel: &Kernel, parent: &mut Process, target: WaitTarget) -> Result<Option<Reaped>> {
    if !parent.children.iter().any(|&c| target.matches(c)) {
        return Err(KernelError::NoChildren);
    }

    for index in 0..parent.children.len() {
        let child = parent.children[index];
        if !target.matches(child) {
            continue;
        }
        let mut c = kernel.procs.slot(child).lock();
        if c.pid == child && c.is_reapable() {
            let reaped = Reaped {
                pid:          child,
                status:       c.exit_status,
                dir:          c.page_dir.take(),
                kernel_stack: c.kernel_stack.take(),
            };
            *c = Process::vacant();
            drop(c);
            parent.children.swap_remove(index);
            return Ok(Some(reaped));
        }
    }
    Ok(None)
}

/// Дождаться остановки ребёнка. С `nohang` возвращает `Ok(None)`, если
/// никто ещё не остановился; `NoChildren`, если ждать некого.
/// Wait for a child to stop. With `nohang` returns `Ok(None)` when none has
/// stopped yet; `NoChildren` when there is nobody to wait for.
pub fn wait(kernel: &Kernel, target: WaitTarget, nohang: bool) -> Result<Option<(Pid, i64)>> {
    let me = this_cpu().current().ok_or(KernelError::NoSuchProcess)?;
    let mut guard = kernel.procs.lock(me).ok_or(KernelError::NoSuchProcess)?;
    loop {
        if let Some(reaped) = reap_one(kernel, &mut guard, target)? {
            drop(guard);
            // Блокировку таблицы нельзя брать под блокировкой процесса.
            reclaim(kernel, reaped.pid, reaped.dir, reaped.kernel_stack);
            debug!(target: "proc", "pid {} reaped {} (status {})", me, reaped.pid, reaped.status);
            return Ok(Some((reaped.pid, reaped.status)));
        }
        if nohang {
            return Ok(None);
        }
        guard = sleep_on_self(WaitChannel::Child(me), guard);
    }
}
