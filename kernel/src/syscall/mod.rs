//! System call dispatch
//!
//! Номер в a7, аргументы в a0–a5, результат в a0.
//! Number in a7, arguments in a0–a5, result in a0.
//!
//! Номера / Numbers:
//!   1   ticks()                   — тики с загрузки / ticks since boot
//!   3   sleep(n)                  — заснуть на n тиков / sleep for n ticks
//!   93  exit(code)                — завершиться / terminate
//!   124 sched_yield()             — отдать харт / give up the hart
//!   172 getpid()
//!   173 getppid()
//!   214 brk(addr)                 — сдвинуть break / move the break
//!   220 clone()                   — fork
//!   260 wait4(pid, status, opts)  — забрать ребёнка / reap a child
//!
//! Ошибки возвращаются отрицательным errno.
//! Errors come back as a negative errno.

use core::ptr;

use log::{trace, warn};

use crate::config::PAGE_SIZE;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::mm::vmm::PageFlags;
use crate::mm::{page_round_down, VirtAddr};
use crate::proc::{self, Pid, WaitTarget};
use crate::sched;
use crate::trap::{self, TrapFrame};

pub const SYS_TICKS: usize = 1;
pub const SYS_SLEEP: usize = 3;
pub const SYS_EXIT: usize = 93;
pub const SYS_SCHED_YIELD: usize = 124;
pub const SYS_GETPID: usize = 172;
pub const SYS_GETPPID: usize = 173;
pub const SYS_BRK: usize = 214;
pub const SYS_CLONE: usize = 220;
pub const SYS_WAIT4: usize = 260;

pub const ENOSYS: isize = -38;

/// wait4: не блокироваться / do not block
pub const WNOHANG: usize = 1;

/// Таблица системных вызовов. Результат кладётся в `frame.a0`.
/// A system call table. The result goes into `frame.a0`.
pub trait SyscallTable: Sync {
    fn dispatch(&self, kernel: &Kernel, pid: Pid, frame: &mut TrapFrame);
}

/// Системные вызовы управления процессами.
/// Process-management system calls.
pub struct CoreSyscalls;

impl SyscallTable for CoreSyscalls {
    fn dispatch(&self, kernel: &Kernel, pid: Pid, frame: &mut TrapFrame) {
        let number = frame.syscall_number();
        trace!(target: "syscall", "pid {} syscall {}", pid, number);
        let result = match number {
            SYS_TICKS => Ok(kernel.ticks.now() as usize),
            SYS_SLEEP => {
                trap::sleep_ticks(kernel, frame.arg(0) as u64);
                Ok(0)
            }
            SYS_EXIT => proc::exit(kernel, frame.arg(0) as i64),
            SYS_SCHED_YIELD => {
                sched::yield_now(kernel);
                Ok(0)
            }
            SYS_GETPID => Ok(pid),
            SYS_GETPPID => kernel
                .procs
                .lock(pid)
                .map(|p| p.parent.unwrap_or(0))
                .ok_or(KernelError::NoSuchProcess),
            SYS_BRK => proc::brk(kernel, pid, frame.arg(0)),
            SYS_CLONE => proc::fork(kernel),
            SYS_WAIT4 => wait4(kernel, pid, frame.arg(0) as isize, frame.arg(1), frame.arg(2)),
            unknown => {
                warn!(target: "syscall", "pid {}: unknown syscall {}", pid, unknown);
                frame.set_return(ENOSYS as usize);
                return;
            }
        };
        let value = match result {
            Ok(value) => value as isize,
            Err(err) => err.errno(),
        };
        frame.set_return(value as usize);
    }
}

fn wait4(kernel: &Kernel, pid: Pid, target: isize, status_ptr: usize, options: usize) -> Result<usize> {
    let target = match target {
        -1 => WaitTarget::Any,
        t if t > 0 => WaitTarget::Pid(t as Pid),
        _ => return Err(KernelError::InvalidArgument),
    };
    // Плохой указатель отвергается до того, как ребёнок будет забран.
    if status_ptr != 0 && !user_writable(kernel, pid, status_ptr, STATUS_BYTES)? {
        return Err(KernelError::BadAddress);
    }
    match proc::wait(kernel, target, options & WNOHANG != 0)? {
        Some((child, status)) => {
            if status_ptr != 0 {
                // Кодировка POSIX: код выхода во втором байте.
                let encoded = ((status & 0xff) as i32) << 8;
                write_user(kernel, pid, status_ptr, &encoded.to_ne_bytes())?;
            }
            Ok(child)
        }
        None => Ok(0),
    }
}

const STATUS_BYTES: usize = core::mem::size_of::<i32>();

/// Каждая страница `va..va+len` — пользовательский лист с правом записи.
/// Every page of `va..va+len` is a user leaf with write access.
fn user_writable(kernel: &Kernel, pid: Pid, va: usize, len: usize) -> Result<bool> {
    let p = kernel.procs.lock(pid).ok_or(KernelError::NoSuchProcess)?;
    let dir = p.page_dir.as_ref().ok_or(KernelError::BadAddress)?;
    let Some(end) = va.checked_add(len) else {
        return Ok(false);
    };
    let mut at = va;
    while at < end {
        if dir.user_translate(VirtAddr::new(at), PageFlags::WRITE).is_none() {
            return Ok(false);
        }
        at = page_round_down(at) + PAGE_SIZE;
    }
    Ok(true)
}

/// Скопировать байты в память процесса (по страницам).
/// Писать можно только в пользовательские листы с правом W ниже стека.
/// Copy bytes into process memory (page by page). Only user leaves with W
/// below the stack top may be written.
fn write_user(kernel: &Kernel, pid: Pid, va: usize, bytes: &[u8]) -> Result<()> {
    if !user_writable(kernel, pid, va, bytes.len())? {
        return Err(KernelError::BadAddress);
    }
    let p = kernel.procs.lock(pid).ok_or(KernelError::NoSuchProcess)?;
    let dir = p.page_dir.as_ref().ok_or(KernelError::BadAddress)?;
    let mut copied = 0;
    while copied < bytes.len() {
        let at = VirtAddr::new(va + copied);
        let chunk = (PAGE_SIZE - at.page_offset()).min(bytes.len() - copied);
        let pa = dir.user_translate(at, PageFlags::WRITE).ok_or(KernelError::BadAddress)?;
        unsafe { ptr::copy_nonoverlapping(bytes[copied..].as_ptr(), pa.as_mut_ptr::<u8>(), chunk) };
        copied += chunk;
    }
    Ok(())
}
