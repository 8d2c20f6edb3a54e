//! Processes
//!
//! Процесс — фиксированный слот таблицы; номер слота и есть pid.
//! A process is a fixed table slot; the slot index is the pid.
//!
//! Жизненный цикл / Lifecycle:
//!   NORMAL → READY ⇄ RUNNING
//!   RUNNING → WAITING (sleep) → READY (wakeup)
//!   RUNNING → STOPPED (exit) → слот свободен после wait / slot freed by wait
//!
//! Бит RUNNING означает «занимает харт»: он снимается циклом планировщика
//! только после того, как процесс действительно ушёл с харта.
//! The RUNNING bit means "occupies a hart": the idle loop clears it only once
//! the process has actually switched off the hart.

pub mod exec;
pub mod lifecycle;
pub mod sleep;
pub mod table;
pub mod wait;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

pub use exec::{exec, FlatBinary, LoadTarget, ProgramLoader};
pub use lifecycle::{alloc_process, brk, exit, exit_process, fork, fork_process, setup_init};
pub use sleep::WaitChannel;
pub use table::ProcessTable;
pub use wait::{wait, WaitTarget};

use crate::arch::TaskContext;
use crate::config::{KERNEL_STACK_PAGES, MAX_FILES, PAGE_SIZE};
use crate::mm::vmm::PageDirectory;
use crate::mm::PhysAddr;
use crate::trap::TrapState;

pub type Pid = usize;

bitflags! {
    /// Биты состояния процесса / Process status bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcStatus: u32 {
        const RUNNING = 0x001;
        const READY   = 0x002;
        const NORMAL  = 0x010;
        const STOPPED = 0x020;
        /// Убит из-за исключения / killed by a fault
        const ERROR   = 0x040;
        const WAITING = 0x100;
    }
}

/// Границы образа программы / Program image bounds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgramImage {
    pub start: usize,
    pub size:  usize,
    pub brk:   usize,
    pub entry: usize,
}

impl ProgramImage {
    pub const fn empty() -> Self {
        Self { start: 0, size: 0, brk: 0, entry: 0 }
    }

    pub const fn end(&self) -> usize {
        self.start + self.size
    }
}

/// Пользовательский стек `low..high` / User stack `low..high`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackBounds {
    pub low:  usize,
    pub high: usize,
}

// ── Open files ────────────────────────────────────────────────────────────────

/// Открытый файл. Реализация — забота VFS; ядру нужен только общий доступ.
/// An open file. The VFS provides implementations; the core only shares them.
pub trait OpenFile: Send + Sync {
    fn name(&self) -> &str;
}

/// Таблица дескрипторов; после fork дескрипторы общие.
/// Descriptor table; descriptors are shared after fork.
#[derive(Clone)]
pub struct FileTable {
    slots: [Option<Arc<dyn OpenFile>>; MAX_FILES],
}

impl FileTable {
    pub const fn new() -> Self {
        Self { slots: [const { None }; MAX_FILES] }
    }

    /// Занять наименьший свободный дескриптор.
    /// Take the lowest free descriptor.
    pub fn install(&mut self, file: Arc<dyn OpenFile>) -> Option<usize> {
        let fd = self.slots.iter().position(Option::is_none)?;
        self.slots[fd] = Some(file);
        Some(fd)
    }

    pub fn get(&self, fd: usize) -> Option<&Arc<dyn OpenFile>> {
        self.slots.get(fd)?.as_ref()
    }

    pub fn close(&mut self, fd: usize) -> bool {
        self.slots.get_mut(fd).and_then(Option::take).is_some()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FileTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.slots.iter().flatten().map(|file| file.name()))
            .finish()
    }
}

/// Имя процесса, 16 байт / Process name, 16 bytes
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcName([u8; 16]);

impl ProcName {
    pub const fn empty() -> Self {
        Self([0; 16])
    }

    /// Записать имя, обрезав до 15 байт по границе символа.
    /// Store the name, truncated to 15 bytes on a char boundary.
    pub fn set(&mut self, name: &str) {
        let mut len = name.len().min(15);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        self.0 = [0; 16];
        self.0[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|&b| b == 0).unwrap_or(self.0.len());
        core::str::from_utf8(&self.0[..len]).unwrap_or("?")
    }
}

impl fmt::Debug for ProcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

// ── Process ───────────────────────────────────────────────────────────────────

pub struct Process {
    /// Регистры пользователя и pc; адрес стабилен, пока жив слот.
    /// User registers and pc; the address is stable for the slot's lifetime.
    pub trap:         TrapState,
    pub pid:          Pid,
    pub status:       ProcStatus,
    pub context:      TaskContext,
    pub page_dir:     Option<PageDirectory>,
    pub kernel_stack: Option<PhysAddr>,
    pub image:        ProgramImage,
    pub stack:        StackBounds,
    pub files:        FileTable,
    pub parent:       Option<Pid>,
    pub children:     Vec<Pid>,
    pub exit_status:  i64,
    pub name:         ProcName,
    pub wait_chan:    Option<WaitChannel>,
}

impl Process {
    pub const fn vacant() -> Self {
        Self {
            trap:         TrapState::zero(),
            pid:          0,
            status:       ProcStatus::empty(),
            context:      TaskContext::zero(),
            page_dir:     None,
            kernel_stack: None,
            image:        ProgramImage::empty(),
            stack:        StackBounds { low: 0, high: 0 },
            files:        FileTable::new(),
            parent:       None,
            children:     Vec::new(),
            exit_status:  0,
            name:         ProcName::empty(),
            wait_chan:    None,
        }
    }

    pub fn is_vacant(&self) -> bool {
        self.status.is_empty()
    }

    /// Готов к запуску: READY | NORMAL и ни один из RUNNING / WAITING / STOPPED.
    /// Runnable: READY | NORMAL and none of RUNNING / WAITING / STOPPED.
    pub fn is_runnable(&self) -> bool {
        self.status.contains(ProcStatus::READY | ProcStatus::NORMAL)
            && !self
                .status
                .intersects(ProcStatus::RUNNING | ProcStatus::WAITING | ProcStatus::STOPPED)
    }

    /// Остановлен и уже ушёл с харта: слот можно освободить.
    /// Stopped and off its hart: the slot may be freed.
    pub fn is_reapable(&self) -> bool {
        self.status.contains(ProcStatus::STOPPED) && !self.status.contains(ProcStatus::RUNNING)
    }

    pub fn kernel_stack_top(&self) -> usize {
        self.kernel_stack
            .map_or(0, |base| base.as_usize() + KERNEL_STACK_PAGES * PAGE_SIZE)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("status", &self.status)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl OpenFile for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn runnable_needs_ready_and_normal_only() {
        let mut p = Process::vacant();
        assert!(!p.is_runnable());
        p.status = ProcStatus::NORMAL | ProcStatus::READY;
        assert!(p.is_runnable());
        for blocker in [ProcStatus::RUNNING, ProcStatus::WAITING, ProcStatus::STOPPED] {
            p.status = ProcStatus::NORMAL | ProcStatus::READY | blocker;
            assert!(!p.is_runnable(), "{:?}", blocker);
        }
    }

    #[test]
    fn names_truncate_on_char_boundaries() {
        let mut name = ProcName::empty();
        name.set("init");
        assert_eq!(name.as_str(), "init");
        name.set("a-very-long-process-name");
        assert_eq!(name.as_str(), "a-very-long-pro");
        name.set("ппппппппп");
        assert_eq!(name.as_str(), "ппппппп");
    }

    #[test]
    fn file_table_shares_descriptors_on_clone() {
        let mut files = FileTable::new();
        let file: Arc<dyn OpenFile> = Arc::new(Named("console"));
        assert_eq!(files.install(Arc::clone(&file)), Some(0));
        assert_eq!(files.install(Arc::clone(&file)), Some(1));
        let copy = files.clone();
        assert_eq!(Arc::strong_count(&file), 5);
        assert!(files.close(0));
        assert!(!files.close(0));
        assert_eq!(copy.open_count(), 2);
        assert_eq!(copy.get(1).map(|f| f.name()), Some("console"));
    }
}
