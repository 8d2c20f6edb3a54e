//! Memory Management subsystem
//!
//! Три уровня / Three layers:
//!   pmm  — Physical Memory Manager (Buddy Allocator)
//!   heap — Kernel Heap (пулы с AVL-индексом свободных блоков / pools with an AVL free index)
//!   vmm  — Virtual Memory Manager (Sv39 page tables)

pub mod heap;
pub mod pmm;
pub mod vmm;

use core::fmt;

use crate::config::PAGE_SIZE;

/// Физический адрес / Physical address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

/// Виртуальный адрес / Virtual address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl PhysAddr {
    pub const fn new(addr: usize) -> Self { Self(addr) }
    pub const fn as_usize(self) -> usize  { self.0 }
    pub const fn is_page_aligned(self) -> bool { self.0 % PAGE_SIZE == 0 }
    pub const fn add(self, bytes: usize) -> Self { Self(self.0 + bytes) }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl VirtAddr {
    pub const fn new(addr: usize) -> Self { Self(addr) }
    pub const fn as_usize(self) -> usize  { self.0 }
    pub const fn is_page_aligned(self) -> bool { self.0 % PAGE_SIZE == 0 }
    pub const fn add(self, bytes: usize) -> Self { Self(self.0 + bytes) }
    pub const fn page_offset(self) -> usize { self.0 % PAGE_SIZE }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Управляемый участок физической памяти.
/// A managed stretch of physical memory.
///
/// `start..usable_start` занято образом ядра, `usable_start..end` отдаётся аллокатору.
/// `start..usable_start` holds the kernel image, `usable_start..end` goes to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start:        PhysAddr,
    pub usable_start: PhysAddr,
    pub end:          PhysAddr,
}

impl MemoryRegion {
    pub const fn new(start: PhysAddr, usable_start: PhysAddr, end: PhysAddr) -> Self {
        Self { start, usable_start, end }
    }

    pub const fn len(&self) -> usize {
        self.end.0 - self.start.0
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
