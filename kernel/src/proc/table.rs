//! Process table
//!
//! Фиксированный массив слотов, каждый под своим спинлоком, плюс битовая
//! карта занятых слотов под блокировкой таблицы. Слот 0 зарезервирован.
//! A fixed array of slots, each behind its own spinlock, plus a bitmap of
//! used slots behind the table lock. Slot 0 is reserved.
//!
//! Порядок блокировок: таблица → процесс.
//! Lock order: table → process.

use alloc::boxed::Box;
use core::ptr;

use super::{Pid, Process};
use crate::config::MAX_PROC;
use crate::error::{KernelError, Result};
use crate::sync::{SpinLock, SpinLockGuard};
use crate::trap::TrapState;

const _: () = assert!(MAX_PROC <= 64, "the slot map is a single u64");

/// Битовая карта занятых pid / Bitmap of used pids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMap(u64);

impl SlotMap {
    const fn reserved() -> Self {
        Self(1)
    }

    pub fn is_set(&self, pid: Pid) -> bool {
        pid < MAX_PROC && self.0 & (1 << pid) != 0
    }

    fn set(&mut self, pid: Pid) {
        self.0 |= 1 << pid;
    }

    fn clear(&mut self, pid: Pid) {
        self.0 &= !(1 << pid);
    }

    fn first_free(&self) -> Option<Pid> {
        (1..MAX_PROC).find(|&pid| !self.is_set(pid))
    }

    /// Занятые pid по возрастанию (без зарезервированного 0).
    /// Used pids in ascending order (the reserved 0 excluded).
    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        (1..MAX_PROC).filter(|&pid| self.is_set(pid))
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }
}

pub struct ProcessTable {
    slots: Box<[SpinLock<Process>]>,
    used:  SpinLock<SlotMap>,
}

impl ProcessTable {
    pub fn new() -> Self {
        let slots = (0..MAX_PROC)
            .map(|_| SpinLock::new("proc", Process::vacant()))
            .collect();
        Self {
            slots,
            used: SpinLock::new("proc_table", SlotMap::reserved()),
        }
    }

    /// Занять наименьший свободный pid.
    /// Claim the lowest free pid.
    pub fn claim(&self) -> Result<Pid> {
        let mut used = self.used.lock();
        let pid = used.first_free().ok_or(KernelError::NoProcessSlot)?;
        used.set(pid);
        Ok(pid)
    }

    /// Вернуть pid в пул. Слот к этому моменту уже должен быть пустым.
    /// Return a pid to the pool. The slot must already be vacant.
    pub fn release(&self, pid: Pid) {
        assert!(pid != 0 && pid < MAX_PROC, "release: bad pid {}", pid);
        let mut used = self.used.lock();
        if !used.is_set(pid) {
            panic!("release: pid {} is not in use", pid);
        }
        used.clear(pid);
    }

    /// Слот по номеру без проверки содержимого.
    /// The slot for `pid` without checking its contents.
    pub fn slot(&self, pid: Pid) -> &SpinLock<Process> {
        &self.slots[pid]
    }

    /// Захватить процесс, если слот действительно занят им.
    /// Lock the process if the slot really holds it.
    pub fn lock(&self, pid: Pid) -> Option<SpinLockGuard<'_, Process>> {
        if pid == 0 || pid >= MAX_PROC {
            return None;
        }
        let guard = self.slots[pid].lock();
        (guard.pid == pid && !guard.is_vacant()).then_some(guard)
    }

    pub fn used(&self) -> SpinLockGuard<'_, SlotMap> {
        self.used.lock()
    }

    pub fn count(&self) -> usize {
        self.used.lock().count()
    }

    /// Адрес состояния ловушки процесса для ассемблерного пути возврата.
    /// Address of the process trap state for the assembly return path.
    pub fn trap_state(&self, pid: Pid) -> *mut TrapState {
        let process = self.slots[pid].data_ptr();
        unsafe { ptr::addr_of_mut!((*process).trap) }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
