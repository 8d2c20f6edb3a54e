//! Virtual Memory Manager — Sv39
//!
//! Трёхуровневые таблицы по 512 записей. Каждый корень резервирует запись 2
//! под 1 GiB глобальный RWX-лист, отображающий `0x8000_0000..0xC000_0000`
//! сам на себя, так что ядро видно из любого адресного пространства.
//! Three-level tables of 512 entries. Every root reserves entry 2 for a 1 GiB
//! global RWX leaf identity-mapping `0x8000_0000..0xC000_0000`, so the kernel
//! is visible from every address space.
//!
//! Таблицы адресуются по физическому адресу напрямую (ядро работает в identity-окне).
//! Tables are addressed by physical address directly (the kernel runs in the identity window).

use alloc::vec::Vec;
use core::ptr;

use bitflags::bitflags;
use log::trace;

use super::pmm::{FrameAllocator, PageType};
use super::{page_round_down, page_round_up, PhysAddr, VirtAddr};
use crate::arch::current as arch;
use crate::config::{KERN_BASE, PAGE_SHIFT, PAGE_SIZE, RAM_BASE, USER_STACK_BASE};
use crate::error::{KernelError, Result};
use crate::sync::SpinLock;

/// Верхняя граница виртуальных адресов / upper bound of virtual addresses
pub const MAXVA: usize = 1 << 38;

const ENTRIES: usize = 512;
const KERNEL_ROOT_SLOT: usize = 2;
const PPN_MASK: u64 = (1 << 44) - 1;

bitflags! {
    /// Флаги записи Sv39 / Sv39 entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXEC     = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;

        const RW  = Self::READ.bits() | Self::WRITE.bits();
        const RX  = Self::READ.bits() | Self::EXEC.bits();
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn new(pa: PhysAddr, flags: PageFlags) -> Self {
        Self((((pa.0 >> PAGE_SHIFT) as u64) << 10) | flags.bits())
    }

    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & 0x3ff)
    }

    pub const fn addr(self) -> PhysAddr {
        PhysAddr::new((((self.0 >> 10) & PPN_MASK) as usize) << PAGE_SHIFT)
    }

    pub const fn is_valid(self) -> bool {
        self.0 & PageFlags::VALID.bits() != 0
    }

    /// Лист, если выставлен хотя бы один из R/W/X.
    /// A leaf when any of R/W/X is set.
    pub const fn is_leaf(self) -> bool {
        self.0 & PageFlags::RWX.bits() != 0
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PTE({:?}, {:?})", self.addr(), self.flags())
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRIES],
}

const fn index(va: usize, level: usize) -> usize {
    (va >> (PAGE_SHIFT + 9 * level)) & (ENTRIES - 1)
}

unsafe fn table_at<'a>(pa: PhysAddr) -> &'a mut PageTable {
    unsafe { &mut *pa.as_mut_ptr::<PageTable>() }
}

/// Трейт для архитектурно-зависимых page tables.
/// Trait for arch-specific page table implementations.
pub trait PageTableImpl {
    fn map(
        &mut self,
        frames: &FrameAllocator,
        virt: VirtAddr,
        phys: PhysAddr,
        size: usize,
        flags: PageFlags,
    ) -> Result<()>;
    fn unmap(&mut self, frames: &FrameAllocator, virt: VirtAddr, pages: usize, free: bool);
    fn translate(&self, virt: VirtAddr) -> Option<PhysAddr>;
    /// Загрузить таблицу (SATP)
    /// Load table (SATP)
    fn activate(&self);
}

/// Отображение MMIO, которое повторяется в каждом новом адресном пространстве.
/// An MMIO mapping replayed into every new address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemMapping {
    pub virt:  VirtAddr,
    pub phys:  PhysAddr,
    pub size:  usize,
    pub flags: PageFlags,
}

// ── Page directory ────────────────────────────────────────────────────────────

/// Корень Sv39. Освобождается только явным `destroy`.
/// An Sv39 root. Released only by an explicit `destroy`.
#[derive(Debug, PartialEq, Eq)]
pub struct PageDirectory {
    root: PhysAddr,
}

impl PageDirectory {
    /// Пустой корень с 1 GiB окном ядра.
    /// Empty root carrying the 1 GiB kernel window.
    pub fn new(frames: &FrameAllocator) -> Result<Self> {
        let root = frames
            .alloc_zeroed(1, PageType::PAGE_TABLE | PageType::SYSTEM)
            .ok_or(KernelError::OutOfMemory)?;
        let table = unsafe { table_at(root) };
        table.entries[KERNEL_ROOT_SLOT] = PageTableEntry::new(
            PhysAddr::new(RAM_BASE),
            PageFlags::VALID | PageFlags::RWX | PageFlags::GLOBAL | PageFlags::ACCESSED | PageFlags::DIRTY,
        );
        Ok(Self { root })
    }

    /// Новый корень с повтором системных отображений.
    /// New root with the system mappings replayed.
    pub fn with_system_mappings(frames: &FrameAllocator, mappings: &[SystemMapping]) -> Result<Self> {
        let mut dir = Self::new(frames)?;
        for m in mappings {
            if let Err(err) = dir.map(frames, m.virt, m.phys, m.size, m.flags) {
                dir.destroy(frames);
                return Err(err);
            }
        }
        Ok(dir)
    }

    /// Взгляд на чужой корень без владения.
    /// A non-owning view of an existing root.
    ///
    /// # Safety
    /// `root` должен быть живым корнем; вид нельзя `destroy`, пока жив владелец.
    /// `root` must be a live root; the view must not be destroyed while the owner lives.
    pub unsafe fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Значение satp: режим Sv39 (8) и PPN корня.
    /// satp value: Sv39 mode (8) and the root PPN.
    pub fn satp(&self) -> usize {
        (8 << 60) | (self.root.as_usize() >> PAGE_SHIFT)
    }

    /// Спуститься до листовой записи для `va`, при `alloc` создавая таблицы.
    /// Walk down to the leaf entry for `va`, creating tables when `alloc` is given.
    pub fn walk(&mut self, va: VirtAddr, alloc: Option<&FrameAllocator>) -> Result<Option<&mut PageTableEntry>> {
        let va = va.as_usize();
        if va >= MAXVA {
            panic!("walk: va {:#x} beyond MAXVA", va);
        }
        let mut table = unsafe { table_at(self.root) };
        for level in [2, 1] {
            let pte = &mut table.entries[index(va, level)];
            if pte.is_valid() {
                if pte.is_leaf() {
                    panic!("walk: va {:#x} lies inside a level-{} superpage", va, level);
                }
            } else {
                let Some(frames) = alloc else {
                    return Ok(None);
                };
                let frame = frames
                    .alloc_zeroed(1, PageType::PAGE_TABLE | PageType::SYSTEM)
                    .ok_or(KernelError::OutOfMemory)?;
                *pte = PageTableEntry::new(frame, PageFlags::VALID);
            }
            table = unsafe { table_at(pte.addr()) };
        }
        Ok(Some(&mut table.entries[index(va, 0)]))
    }

    /// Листовая запись и её уровень (0 — 4 KiB, 2 — 1 GiB).
    /// Leaf entry and its level (0 is 4 KiB, 2 is 1 GiB).
    pub fn lookup(&self, va: VirtAddr) -> Option<(PageTableEntry, usize)> {
        let va = va.as_usize();
        if va >= MAXVA {
            return None;
        }
        let mut table = unsafe { table_at(self.root) };
        for level in [2, 1, 0] {
            let pte = table.entries[index(va, level)];
            if !pte.is_valid() {
                return None;
            }
            if pte.is_leaf() {
                return Some((pte, level));
            }
            if level == 0 {
                return None;
            }
            table = unsafe { table_at(pte.addr()) };
        }
        None
    }

    /// Освободить все таблицы (но не листовые кадры).
    /// Release every table frame (leaf frames stay put).
    pub fn destroy(self, frames: &FrameAllocator) {
        unsafe { free_tables(frames, self.root, 2) };
    }

    /// Жадно скопировать пользовательские страницы `start..end` из `src` в свежие кадры.
    /// Eagerly copy user pages `start..end` from `src` into fresh frames.
    pub fn copy_range(
        &mut self,
        src: &PageDirectory,
        frames: &FrameAllocator,
        start: VirtAddr,
        end: VirtAddr,
    ) -> Result<()> {
        let mut va = page_round_down(start.as_usize());
        while va < end.as_usize() {
            if let Some((pte, 0)) = src.lookup(VirtAddr::new(va)) {
                let frame = frames
                    .alloc(1, PageType::USER)
                    .ok_or(KernelError::OutOfMemory)?;
                unsafe {
                    ptr::copy_nonoverlapping(pte.addr().as_mut_ptr::<u8>(), frame.as_mut_ptr::<u8>(), PAGE_SIZE);
                }
                let flags = pte.flags() & (PageFlags::RWX | PageFlags::USER | PageFlags::GLOBAL);
                if let Err(err) = self.map(frames, VirtAddr::new(va), frame, PAGE_SIZE, flags) {
                    frames.free(frame, 1);
                    return Err(err);
                }
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Адрес `va` внутри пользовательского 4 KiB листа с правами `need`.
    /// Окно ядра и суперстраницы сюда не попадают.
    /// Physical address of `va` inside a user 4 KiB leaf granting `need`.
    /// The kernel window and superpages never qualify.
    pub fn user_translate(&self, va: VirtAddr, need: PageFlags) -> Option<PhysAddr> {
        if va.as_usize() >= USER_STACK_BASE {
            return None;
        }
        match self.lookup(va)? {
            (pte, 0) if pte.flags().contains(PageFlags::USER | need) => Some(pte.addr().add(va.page_offset())),
            _ => None,
        }
    }

    /// Разобрать страничное исключение: `true`, если доступ законен и его можно повторить.
    /// Запись в страницу без W: единственный владелец получает W, разделяемый
    /// кадр копируется.
    /// Settle a page fault: `true` when the access is legal and may be retried.
    /// A write to a page without W: a sole owner gains W, a shared frame is copied.
    pub fn resolve_fault(&mut self, frames: &FrameAllocator, va: VirtAddr, is_write: bool) -> bool {
        let page = VirtAddr::new(page_round_down(va.as_usize()));
        if page.as_usize() >= KERN_BASE {
            return false;
        }
        let pte = match self.lookup(page) {
            Some((pte, 0)) if pte.flags().contains(PageFlags::USER) => pte,
            _ => return false,
        };
        if !is_write || pte.flags().contains(PageFlags::WRITE) {
            arch::flush_tlb();
            return true;
        }

        let old = pte.addr();
        let target = match frames.page_info(old) {
            Some(info) if info.refs <= 1 => old,
            Some(_) => {
                let Some(copy) = frames.alloc(1, PageType::USER) else {
                    return false;
                };
                unsafe { ptr::copy_nonoverlapping(old.as_mut_ptr::<u8>(), copy.as_mut_ptr::<u8>(), PAGE_SIZE) };
                frames.ref_dec(old);
                copy
            }
            None => return false,
        };
        if let Ok(Some(entry)) = self.walk(page, None) {
            *entry = PageTableEntry::new(target, pte.flags() | PageFlags::WRITE);
        }
        trace!(target: "mm", "write fault at {:?}: {:?} -> {:?}", page, old, target);
        arch::flush_tlb();
        true
    }
}

unsafe fn free_tables(frames: &FrameAllocator, table: PhysAddr, level: usize) {
    if level > 0 {
        let entries = unsafe { &table_at(table).entries };
        for pte in entries.iter().filter(|pte| pte.is_valid() && !pte.is_leaf()) {
            unsafe { free_tables(frames, pte.addr(), level - 1) };
        }
    }
    frames.free(table, 1);
}

impl PageTableImpl for PageDirectory {
    /// Установить листы для `size` байт; занятая запись — фатальная ошибка.
    /// Install leaves for `size` bytes; an occupied entry is fatal.
    fn map(
        &mut self,
        frames: &FrameAllocator,
        virt: VirtAddr,
        phys: PhysAddr,
        size: usize,
        flags: PageFlags,
    ) -> Result<()> {
        assert!(
            virt.is_page_aligned() && phys.is_page_aligned(),
            "map: misaligned {:?} -> {:?}",
            virt,
            phys
        );
        assert!(flags.intersects(PageFlags::RWX), "map: {:?} grants no access", flags);

        let leaf = flags | PageFlags::VALID | PageFlags::ACCESSED | PageFlags::DIRTY;
        for page in 0..page_round_up(size) / PAGE_SIZE {
            let va = virt.add(page * PAGE_SIZE);
            let pte = self.walk(va, Some(frames))?.ok_or(KernelError::MapFailed)?;
            if pte.is_valid() {
                panic!("map: remap of {:?}", va);
            }
            *pte = PageTableEntry::new(phys.add(page * PAGE_SIZE), leaf);
        }
        trace!(target: "mm", "map {:?} -> {:?} ({} bytes, {:?})", virt, phys, size, flags);
        Ok(())
    }

    /// Снять `pages` листов; кадр освобождается, когда счётчик ссылок дошёл до 0 и `free`.
    /// Remove `pages` leaves; a frame is released once its refcount hits 0 and `free` is set.
    fn unmap(&mut self, frames: &FrameAllocator, virt: VirtAddr, pages: usize, free: bool) {
        if !virt.is_page_aligned() {
            panic!("unmap: misaligned {:?}", virt);
        }
        for page in 0..pages {
            let va = virt.add(page * PAGE_SIZE);
            let pte = match self.walk(va, None) {
                Ok(Some(pte)) if pte.is_valid() => pte,
                _ => panic!("unmap: {:?} not mapped", va),
            };
            if !pte.is_leaf() {
                panic!("unmap: {:?} is not a leaf", va);
            }
            let pa = pte.addr();
            *pte = PageTableEntry::empty();
            if frames.contains(pa) && frames.ref_dec(pa) == 0 && free {
                frames.free(pa, 1);
            }
        }
        arch::flush_tlb();
    }

    fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let (pte, level) = self.lookup(virt)?;
        let span = PAGE_SIZE << (9 * level);
        Some(pte.addr().add(virt.as_usize() % span))
    }

    fn activate(&self) {
        arch::activate_page_table(self.root);
    }
}

// ── Kernel address space ──────────────────────────────────────────────────────

/// Корень ядра и список системных отображений.
/// The kernel root plus the list of system mappings.
pub struct KernelSpace {
    root_addr: PhysAddr,
    root:      SpinLock<PageDirectory>,
    mappings:  SpinLock<Vec<SystemMapping>>,
}

impl KernelSpace {
    pub fn new(frames: &FrameAllocator) -> Result<Self> {
        let root = PageDirectory::new(frames)?;
        Ok(Self {
            root_addr: root.root(),
            root:      SpinLock::new("kernel_root", root),
            mappings:  SpinLock::new("sysmaps", Vec::new()),
        })
    }

    pub fn root(&self) -> PhysAddr {
        self.root_addr
    }

    /// Отобразить окно MMIO в ядро и запомнить его для будущих пространств.
    /// Map an MMIO window into the kernel and remember it for future spaces.
    pub fn map_system(&self, frames: &FrameAllocator, mapping: SystemMapping) -> Result<()> {
        let mut mappings = self.mappings.lock();
        self.root
            .lock()
            .map(frames, mapping.virt, mapping.phys, mapping.size, mapping.flags)?;
        mappings.push(mapping);
        Ok(())
    }

    /// Каталог для нового процесса: окно ядра плюс системные отображения.
    /// Directory for a new process: the kernel window plus system mappings.
    pub fn new_directory(&self, frames: &FrameAllocator) -> Result<PageDirectory> {
        let mappings = self.mappings.lock();
        PageDirectory::with_system_mappings(frames, &mappings)
    }

    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        self.root.lock().translate(virt)
    }

    pub fn activate(&self) {
        arch::activate_page_table(self.root_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::arena;

    const USER_VA: usize = 0x1000_0000;

    fn frames() -> FrameAllocator {
        unsafe { FrameAllocator::new(arena(4 * 1024 * 1024)) }
    }

    fn user_page(frames: &FrameAllocator) -> PhysAddr {
        frames.alloc_zeroed(1, PageType::USER).unwrap()
    }

    #[test]
    fn every_root_carries_the_kernel_window() {
        let frames = frames();
        let dir = PageDirectory::new(&frames).unwrap();
        let pa = dir.translate(VirtAddr::new(0x8020_1234)).unwrap();
        assert_eq!(pa, PhysAddr::new(0x8020_1234));
        let (pte, level) = dir.lookup(VirtAddr::new(0x8000_0000)).unwrap();
        assert_eq!(level, 2);
        assert!(pte.flags().contains(PageFlags::GLOBAL | PageFlags::RWX));
        assert_eq!(dir.satp() >> 60, 8);
        dir.destroy(&frames);
    }

    #[test]
    fn map_translate_unmap() {
        let frames = frames();
        let mut dir = PageDirectory::new(&frames).unwrap();
        let page = user_page(&frames);
        dir.map(&frames, VirtAddr::new(USER_VA), page, PAGE_SIZE, PageFlags::RW | PageFlags::USER)
            .unwrap();
        assert_eq!(dir.translate(VirtAddr::new(USER_VA + 0x10)), Some(page.add(0x10)));

        dir.unmap(&frames, VirtAddr::new(USER_VA), 1, true);
        assert_eq!(dir.translate(VirtAddr::new(USER_VA)), None);
        let leaf = dir.walk(VirtAddr::new(USER_VA), None).unwrap().unwrap();
        assert!(!leaf.is_valid());
        assert!(frames.page_info(page).unwrap().kind.contains(PageType::FREE));
        dir.destroy(&frames);
    }

    #[test]
    fn destroy_returns_every_table_frame() {
        let frames = frames();
        let before = frames.free_pages();
        let mut dir = PageDirectory::new(&frames).unwrap();
        for i in 0..4 {
            let page = user_page(&frames);
            // Разные гигабайты — разные промежуточные таблицы.
            let va = VirtAddr::new(i * (1 << 30) + USER_VA % (1 << 30));
            if i == 2 {
                frames.free(page, 1);
                continue;
            }
            dir.map(&frames, va, page, PAGE_SIZE, PageFlags::RW | PageFlags::USER).unwrap();
            dir.unmap(&frames, va, 1, true);
        }
        dir.destroy(&frames);
        assert_eq!(frames.free_pages(), before);
    }

    #[test]
    #[should_panic(expected = "remap")]
    fn remapping_a_live_entry_is_fatal() {
        let frames = frames();
        let mut dir = PageDirectory::new(&frames).unwrap();
        let a = user_page(&frames);
        let b = user_page(&frames);
        dir.map(&frames, VirtAddr::new(USER_VA), a, PAGE_SIZE, PageFlags::RW).unwrap();
        let _ = dir.map(&frames, VirtAddr::new(USER_VA), b, PAGE_SIZE, PageFlags::RW);
    }

    #[test]
    #[should_panic(expected = "not mapped")]
    fn unmapping_a_hole_is_fatal() {
        let frames = frames();
        let mut dir = PageDirectory::new(&frames).unwrap();
        dir.unmap(&frames, VirtAddr::new(USER_VA), 1, false);
    }

    #[test]
    #[should_panic(expected = "MAXVA")]
    fn walking_past_maxva_is_fatal() {
        let frames = frames();
        let mut dir = PageDirectory::new(&frames).unwrap();
        let _ = dir.walk(VirtAddr::new(MAXVA), Some(&frames));
    }

    #[test]
    fn copy_range_duplicates_contents_into_new_frames() {
        let frames = frames();
        let mut src = PageDirectory::new(&frames).unwrap();
        let mut dst = PageDirectory::new(&frames).unwrap();
        let page = user_page(&frames);
        unsafe { ptr::write_bytes(page.as_mut_ptr::<u8>(), 0x42, PAGE_SIZE) };
        src.map(&frames, VirtAddr::new(USER_VA), page, PAGE_SIZE, PageFlags::RW | PageFlags::USER)
            .unwrap();

        dst.copy_range(&src, &frames, VirtAddr::new(USER_VA), VirtAddr::new(USER_VA + 2 * PAGE_SIZE))
            .unwrap();
        let copy = dst.translate(VirtAddr::new(USER_VA)).unwrap();
        assert_ne!(copy, page);
        assert_eq!(unsafe { *copy.as_mut_ptr::<u8>().add(100) }, 0x42);
        // Дыра во втором листе источника пропускается.
        assert_eq!(dst.translate(VirtAddr::new(USER_VA + PAGE_SIZE)), None);

        unsafe { *page.as_mut_ptr::<u8>() = 0 };
        assert_eq!(unsafe { *copy.as_mut_ptr::<u8>() }, 0x42);
        let (pte, _) = dst.lookup(VirtAddr::new(USER_VA)).unwrap();
        assert!(pte.flags().contains(PageFlags::USER | PageFlags::WRITE));
    }

    #[test]
    fn system_mappings_are_replayed_into_new_directories() {
        let frames = frames();
        let space = KernelSpace::new(&frames).unwrap();
        let mmio = SystemMapping {
            virt:  VirtAddr::new(0xC000_0000),
            phys:  PhysAddr::new(0x0C00_0000),
            size:  2 * PAGE_SIZE,
            flags: PageFlags::RW | PageFlags::GLOBAL,
        };
        space.map_system(&frames, mmio).unwrap();
        assert_eq!(space.translate(VirtAddr::new(0xC000_1008)), Some(PhysAddr::new(0x0C00_1008)));

        let dir = space.new_directory(&frames).unwrap();
        assert_eq!(dir.translate(VirtAddr::new(0xC000_0004)), Some(PhysAddr::new(0x0C00_0004)));
        dir.destroy(&frames);
    }

    #[test]
    fn faults_on_present_access_rights_resolve_in_place() {
        let frames = frames();
        let mut dir = PageDirectory::new(&frames).unwrap();
        let rw = user_page(&frames);
        let ro = user_page(&frames);
        dir.map(&frames, VirtAddr::new(USER_VA), rw, PAGE_SIZE, PageFlags::RW | PageFlags::USER).unwrap();
        dir.map(&frames, VirtAddr::new(USER_VA + PAGE_SIZE), ro, PAGE_SIZE, PageFlags::READ | PageFlags::USER)
            .unwrap();

        assert!(dir.resolve_fault(&frames, VirtAddr::new(USER_VA + 8), true));
        assert!(dir.resolve_fault(&frames, VirtAddr::new(USER_VA + PAGE_SIZE + 8), false));
        assert_eq!(dir.translate(VirtAddr::new(USER_VA)), Some(rw));
        let (pte, _) = dir.lookup(VirtAddr::new(USER_VA + PAGE_SIZE)).unwrap();
        assert!(!pte.flags().contains(PageFlags::WRITE));
    }

    #[test]
    fn a_sole_owner_gains_write_access() {
        let frames = frames();
        let mut dir = PageDirectory::new(&frames).unwrap();
        let ro = user_page(&frames);
        dir.map(&frames, VirtAddr::new(USER_VA), ro, PAGE_SIZE, PageFlags::READ | PageFlags::USER).unwrap();
        let free_before = frames.free_pages();

        assert!(dir.resolve_fault(&frames, VirtAddr::new(USER_VA + 0x10), true));
        let (pte, level) = dir.lookup(VirtAddr::new(USER_VA)).unwrap();
        assert_eq!(level, 0);
        assert_eq!(pte.addr(), ro);
        assert!(pte.flags().contains(PageFlags::USER | PageFlags::READ | PageFlags::WRITE));
        assert_eq!(frames.free_pages(), free_before);
    }

    #[test]
    fn a_shared_frame_is_copied_on_write() {
        let frames = frames();
        let mut dir = PageDirectory::new(&frames).unwrap();
        let shared = user_page(&frames);
        unsafe { ptr::write_bytes(shared.as_mut_ptr::<u8>(), 0x5a, PAGE_SIZE) };
        frames.ref_inc(shared);
        dir.map(&frames, VirtAddr::new(USER_VA), shared, PAGE_SIZE, PageFlags::READ | PageFlags::USER).unwrap();

        assert!(dir.resolve_fault(&frames, VirtAddr::new(USER_VA), true));
        let (pte, _) = dir.lookup(VirtAddr::new(USER_VA)).unwrap();
        let copy = pte.addr();
        assert_ne!(copy, shared);
        assert!(pte.flags().contains(PageFlags::WRITE));
        assert_eq!(unsafe { *copy.as_mut_ptr::<u8>().add(PAGE_SIZE - 1) }, 0x5a);
        assert_eq!(frames.page_info(shared).unwrap().refs, 1);
        assert_eq!(frames.page_info(copy).unwrap().refs, 1);
    }

    #[test]
    fn faults_outside_user_pages_fail() {
        let frames = frames();
        let mut dir = PageDirectory::new(&frames).unwrap();
        let kernel_only = user_page(&frames);
        dir.map(&frames, VirtAddr::new(USER_VA), kernel_only, PAGE_SIZE, PageFlags::READ).unwrap();

        assert!(!dir.resolve_fault(&frames, VirtAddr::new(USER_VA), true));
        assert!(!dir.resolve_fault(&frames, VirtAddr::new(USER_VA), false));
        assert!(!dir.resolve_fault(&frames, VirtAddr::new(USER_VA + 4 * PAGE_SIZE), false));
        assert!(!dir.resolve_fault(&frames, VirtAddr::new(RAM_BASE + 8), true));
        assert!(!dir.resolve_fault(&frames, VirtAddr::new(KERN_BASE + 8), false));
        let (pte, _) = dir.lookup(VirtAddr::new(USER_VA)).unwrap();
        assert!(!pte.flags().contains(PageFlags::WRITE));
    }

    #[test]
    fn user_translate_skips_the_kernel_window_and_missing_rights() {
        let frames = frames();
        let mut dir = PageDirectory::new(&frames).unwrap();
        let ro = user_page(&frames);
        dir.map(&frames, VirtAddr::new(USER_VA), ro, PAGE_SIZE, PageFlags::READ | PageFlags::USER).unwrap();

        assert_eq!(dir.user_translate(VirtAddr::new(USER_VA + 3), PageFlags::READ), Some(ro.add(3)));
        assert_eq!(dir.user_translate(VirtAddr::new(USER_VA), PageFlags::WRITE), None);
        assert_eq!(dir.user_translate(VirtAddr::new(0x8000_0100), PageFlags::empty()), None);
        assert_eq!(dir.user_translate(VirtAddr::new(USER_VA + PAGE_SIZE), PageFlags::empty()), None);
    }
}
