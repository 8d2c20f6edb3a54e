//! Physical Memory Manager — Buddy Allocator
//!
//! Управляет непрерывным регионом физической памяти.
//! Manages one contiguous region of physical memory.
//!
//! Алгоритм: Buddy System
//!   - order 0 = 4KB  (1 страница  / 1 page)
//!   - order 1 = 8KB  (2 страницы  / 2 pages)
//!   - ...
//!   - order 8 = 1MB  (256 страниц / 256 pages)
//!
//! Для каждой пары «близнецов» битовая карта порядка хранит xor их занятости:
//! бит 1 — ровно одна половина выдана. Освобождение, вернувшее бит в 0,
//! значит, что близнец тоже свободен, и пара сливается в блок следующего порядка.
//! For every buddy pair the order's bitmap keeps the xor of their allocation
//! state: bit 1 means exactly one half is handed out. A free that brings the
//! bit back to 0 means the buddy is free as well, and the pair merges upward.
//!
//! Метаданные (PageInfo на каждую страницу и карты порядков) вырезаются из
//! конца региона. Хвост, не вместивший целый блок максимального порядка,
//! отдаётся куче как пул.
//! Metadata (a PageInfo per page plus the order bitmaps) is carved from the
//! end of the region. The tail too short for a whole max-order block is
//! handed to the heap as a pool.

use core::mem::{align_of, size_of};
use core::ptr;

use bitflags::bitflags;
use log::{debug, info};

use super::{page_round_down, page_round_up, MemoryRegion, PhysAddr};
use crate::config::{BUDDY_ORDERS, PAGE_SIZE};
use crate::sync::SpinLock;

/// Страниц в блоке максимального порядка / pages in a max-order block
pub const MAX_BLOCK_PAGES: usize = 1 << (BUDDY_ORDERS - 1);

bitflags! {
    /// Назначение страницы / What a page is used for
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageType: u16 {
        const FREE       = 1 << 0;
        const USABLE     = 1 << 1;
        const IN_USE     = 1 << 2;
        const SYSTEM     = 1 << 3;
        const HARDWARE   = 1 << 4;
        const PAGE_TABLE = 1 << 5;
        const USER       = 1 << 6;
        const POOL       = 1 << 7;
        const RESERVED   = 1 << 8;
    }
}

/// Метаданные одной физической страницы.
/// Metadata of one physical page.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub kind: PageType,
    pub refs: u16,
}

/// Снимок состояния аллокатора / Allocator snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub managed_pages: usize,
    pub free_pages:    usize,
    pub free_blocks:   [usize; BUDDY_ORDERS],
}

/// Порядок блока, вмещающего `pages` страниц.
/// Order of the block that fits `pages` pages.
pub fn order_for(pages: usize) -> usize {
    pages.max(1).next_power_of_two().trailing_zeros() as usize
}

// Узел лежит в первых байтах свободного блока.
struct FreeBlock {
    prev: *mut FreeBlock,
    next: *mut FreeBlock,
}

pub struct BuddyAllocator {
    region_start: usize,
    usable_start: usize,
    /// Конец последнего блока максимального порядка.
    managed_end:  usize,
    /// Начало метаданных.
    usable_end:   usize,
    pages:        *mut PageInfo,
    page_count:   usize,
    maps:         [*mut u8; BUDDY_ORDERS],
    free_lists:   [*mut FreeBlock; BUDDY_ORDERS],
    free_counts:  [usize; BUDDY_ORDERS],
    tail_claimed: bool,
}

// Сырые указатели смотрят внутрь региона, которым владеет аллокатор.
unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
    /// Разметить регион: метаданные в конце, блоки максимального порядка — в свободный список.
    /// Lay out the region: metadata at the end, max-order blocks onto the top free list.
    ///
    /// # Safety
    /// Регион должен быть доступной RAM, которой больше никто не пользуется.
    /// The region must be accessible RAM nobody else uses.
    pub unsafe fn new(region: MemoryRegion) -> Self {
        let start = page_round_up(region.start.as_usize());
        let usable_start = page_round_up(region.usable_start.as_usize()).max(start);
        let end = page_round_down(region.end.as_usize());
        assert!(usable_start < end, "buddy: empty region {:?}", region);

        let page_count = (end - start) / PAGE_SIZE;
        let usable_pages = (end - usable_start) / PAGE_SIZE;

        let mut meta = end;
        let mut maps = [ptr::null_mut(); BUDDY_ORDERS];
        for (order, map) in maps.iter_mut().enumerate() {
            let bytes = (usable_pages >> (order + 1)) / 8 + 1;
            meta -= bytes;
            *map = meta as *mut u8;
            unsafe { ptr::write_bytes(*map, 0, bytes) };
        }
        meta &= !(align_of::<PageInfo>() - 1);
        meta -= page_count * size_of::<PageInfo>();
        meta &= !(align_of::<PageInfo>() - 1);
        let pages = meta as *mut PageInfo;
        let usable_end = page_round_down(meta);
        assert!(
            usable_end > usable_start,
            "buddy: region {:?} too small for its metadata",
            region
        );

        let mut buddy = Self {
            region_start: start,
            usable_start,
            managed_end: usable_start,
            usable_end,
            pages,
            page_count,
            maps,
            free_lists: [ptr::null_mut(); BUDDY_ORDERS],
            free_counts: [0; BUDDY_ORDERS],
            tail_claimed: false,
        };

        for index in 0..page_count {
            let addr = start + index * PAGE_SIZE;
            let kind = if addr < usable_start || addr >= usable_end {
                PageType::IN_USE | PageType::SYSTEM
            } else {
                PageType::USABLE | PageType::RESERVED
            };
            unsafe { buddy.pages.add(index).write(PageInfo { kind, refs: 0 }) };
        }

        let top = BUDDY_ORDERS - 1;
        let block = PAGE_SIZE << top;
        let mut at = usable_start;
        while at + block <= usable_end {
            buddy.attach(at, top);
            buddy.stamp(at, MAX_BLOCK_PAGES, PageType::FREE | PageType::USABLE, 0);
            at += block;
        }
        buddy.managed_end = at;

        debug!(
            target: "mm",
            "buddy: {} pages, {} top blocks, metadata at {:#x}",
            page_count, buddy.free_counts[top], meta
        );
        buddy
    }

    // ── Allocation ────────────────────────────────────────────────────────────

    /// Выделить блок на `pages` страниц (округляется до степени двойки).
    /// Allocate a block of `pages` pages (rounded up to a power of two).
    pub fn alloc(&mut self, pages: usize, kind: PageType) -> Option<PhysAddr> {
        let order = order_for(pages);
        if order >= BUDDY_ORDERS {
            return None;
        }
        let block = self.take_block(order)?;
        self.stamp(block, 1 << order, kind | PageType::IN_USE, 1);
        Some(PhysAddr::new(block))
    }

    fn take_block(&mut self, order: usize) -> Option<usize> {
        if order >= BUDDY_ORDERS {
            return None;
        }
        let block = if self.free_counts[order] == 0 {
            // Делим блок следующего порядка: нижняя половина — в список, верхняя — наружу.
            let parent = self.take_block(order + 1)?;
            self.attach(parent, order);
            let upper = parent + (PAGE_SIZE << order);
            self.toggle(upper, order);
            upper
        } else {
            let head = self.free_lists[order] as usize;
            self.detach(head, order);
            self.toggle(head, order);
            head
        };
        Some(block)
    }

    /// Вернуть блок, выделенный `alloc(pages, ..)`.
    /// Return a block obtained from `alloc(pages, ..)`.
    pub fn free(&mut self, addr: PhysAddr, pages: usize) {
        let at = addr.as_usize();
        let order = order_for(pages);
        if order >= BUDDY_ORDERS
            || !addr.is_page_aligned()
            || at < self.usable_start
            || at + (PAGE_SIZE << order) > self.managed_end
        {
            panic!("buddy: free of {:?} ({} pages) outside the managed region", addr, pages);
        }
        if self.block_index(at) & ((1 << order) - 1) != 0 {
            panic!("buddy: free of {:?} not aligned to order {}", addr, order);
        }
        if self.info(at).kind.contains(PageType::FREE) {
            panic!("buddy: double free of {:?}", addr);
        }
        self.release(at, order);
    }

    fn release(&mut self, at: usize, order: usize) {
        let one_half_used = self.toggle(at, order);
        if !one_half_used && order + 1 < BUDDY_ORDERS {
            let size = PAGE_SIZE << order;
            let buddy = if self.block_index(at) & (1 << order) == 0 { at + size } else { at - size };
            self.detach(buddy, order);
            self.release(at.min(buddy), order + 1);
        } else {
            self.attach(at, order);
            self.stamp(at, 1 << order, PageType::FREE | PageType::USABLE, 0);
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Сумма свободных страниц по всем спискам.
    /// Free pages summed over every free list.
    pub fn free_pages(&self) -> usize {
        self.free_counts
            .iter()
            .enumerate()
            .map(|(order, count)| count << order)
            .sum()
    }

    pub fn free_blocks(&self, order: usize) -> usize {
        self.free_counts[order]
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            managed_pages: (self.managed_end - self.usable_start) / PAGE_SIZE,
            free_pages:    self.free_pages(),
            free_blocks:   self.free_counts,
        }
    }

    pub fn page_info(&self, addr: PhysAddr) -> Option<PageInfo> {
        let index = addr.as_usize().checked_sub(self.region_start)? / PAGE_SIZE;
        (index < self.page_count).then(|| unsafe { *self.pages.add(index) })
    }

    /// Лежит ли адрес внутри блоков, которыми управляет buddy.
    /// Whether the address lies inside the buddy-managed blocks.
    pub fn contains(&self, addr: PhysAddr) -> bool {
        (self.usable_start..self.managed_end).contains(&addr.as_usize())
    }

    pub fn ref_inc(&mut self, addr: PhysAddr) -> u16 {
        let info = self.info_mut(addr.as_usize());
        info.refs = info.refs.checked_add(1).unwrap_or_else(|| panic!("buddy: refcount overflow at {:?}", addr));
        info.refs
    }

    pub fn ref_dec(&mut self, addr: PhysAddr) -> u16 {
        let info = self.info_mut(addr.as_usize());
        info.refs = info.refs.checked_sub(1).unwrap_or_else(|| panic!("buddy: refcount underflow at {:?}", addr));
        info.refs
    }

    /// Забрать хвост региона (меньше одного блока максимального порядка) под пул кучи.
    /// Take the region tail (shorter than one max-order block) for a heap pool.
    pub fn claim_tail(&mut self) -> Option<(PhysAddr, usize)> {
        if self.tail_claimed || self.managed_end >= self.usable_end {
            return None;
        }
        self.tail_claimed = true;
        let len = self.usable_end - self.managed_end;
        self.stamp(self.managed_end, len / PAGE_SIZE, PageType::IN_USE | PageType::POOL, 1);
        Some((PhysAddr::new(self.managed_end), len))
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn block_index(&self, at: usize) -> usize {
        (at - self.usable_start) / PAGE_SIZE
    }

    fn info(&self, at: usize) -> PageInfo {
        unsafe { *self.pages.add((at - self.region_start) / PAGE_SIZE) }
    }

    fn info_mut(&mut self, at: usize) -> &mut PageInfo {
        let index = at
            .checked_sub(self.region_start)
            .map(|offset| offset / PAGE_SIZE)
            .filter(|&index| index < self.page_count)
            .unwrap_or_else(|| panic!("buddy: {:#x} is not a managed page", at));
        unsafe { &mut *self.pages.add(index) }
    }

    fn stamp(&mut self, at: usize, pages: usize, kind: PageType, refs: u16) {
        let first = (at - self.region_start) / PAGE_SIZE;
        for index in first..first + pages {
            unsafe { self.pages.add(index).write(PageInfo { kind, refs }) };
        }
    }

    /// Переключить бит пары; вернуть новое значение.
    /// Flip the pair bit; return its new value.
    fn toggle(&mut self, at: usize, order: usize) -> bool {
        let pair = self.block_index(at) >> (order + 1);
        let mask = 1u8 << (pair % 8);
        unsafe {
            let byte = self.maps[order].add(pair / 8);
            *byte ^= mask;
            *byte & mask != 0
        }
    }

    fn attach(&mut self, at: usize, order: usize) {
        let node = at as *mut FreeBlock;
        let head = self.free_lists[order];
        unsafe {
            (*node).prev = ptr::null_mut();
            (*node).next = head;
            if !head.is_null() {
                (*head).prev = node;
            }
        }
        self.free_lists[order] = node;
        self.free_counts[order] += 1;
    }

    fn detach(&mut self, at: usize, order: usize) {
        let node = at as *mut FreeBlock;
        unsafe {
            let (prev, next) = ((*node).prev, (*node).next);
            if prev.is_null() {
                if self.free_lists[order] != node {
                    panic!("buddy: block {:#x} is not on the order {} free list", at, order);
                }
                self.free_lists[order] = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
        }
        self.free_counts[order] -= 1;
    }
}

// ── Shared frame allocator ────────────────────────────────────────────────────

/// Buddy-аллокатор под одной спин-блокировкой.
/// The buddy allocator behind a single spinlock.
pub struct FrameAllocator {
    buddy: SpinLock<BuddyAllocator>,
}

impl FrameAllocator {
    /// # Safety
    /// См. `BuddyAllocator::new`.
    pub unsafe fn new(region: MemoryRegion) -> Self {
        let buddy = unsafe { BuddyAllocator::new(region) };
        let stats = buddy.stats();
        info!(
            target: "mm",
            "frames: {} KiB managed, {} free pages",
            stats.managed_pages * PAGE_SIZE / 1024,
            stats.free_pages
        );
        Self { buddy: SpinLock::new("buddy", buddy) }
    }

    pub fn alloc(&self, pages: usize, kind: PageType) -> Option<PhysAddr> {
        self.buddy.lock().alloc(pages, kind)
    }

    /// Выделить и обнулить.
    /// Allocate and zero-fill.
    pub fn alloc_zeroed(&self, pages: usize, kind: PageType) -> Option<PhysAddr> {
        let addr = self.alloc(pages, kind)?;
        unsafe { ptr::write_bytes(addr.as_mut_ptr::<u8>(), 0, (1 << order_for(pages)) * PAGE_SIZE) };
        Some(addr)
    }

    pub fn free(&self, addr: PhysAddr, pages: usize) {
        self.buddy.lock().free(addr, pages)
    }

    pub fn free_pages(&self) -> usize {
        self.buddy.lock().free_pages()
    }

    pub fn stats(&self) -> MemoryStats {
        self.buddy.lock().stats()
    }

    pub fn page_info(&self, addr: PhysAddr) -> Option<PageInfo> {
        self.buddy.lock().page_info(addr)
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        self.buddy.lock().contains(addr)
    }

    pub fn ref_inc(&self, addr: PhysAddr) -> u16 {
        self.buddy.lock().ref_inc(addr)
    }

    pub fn ref_dec(&self, addr: PhysAddr) -> u16 {
        self.buddy.lock().ref_dec(addr)
    }

    pub fn claim_tail(&self) -> Option<(PhysAddr, usize)> {
        self.buddy.lock().claim_tail()
    }

    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(target: "mm", "free pages: {} / {}", stats.free_pages, stats.managed_pages);
        for (order, count) in stats.free_blocks.iter().enumerate() {
            debug!(target: "mm", "  order {}: {} blocks", order, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{arena, XorShift};

    const MIB: usize = 1024 * 1024;

    fn buddy(bytes: usize) -> BuddyAllocator {
        unsafe { BuddyAllocator::new(arena(bytes)) }
    }

    #[test]
    fn fresh_region_holds_max_blocks_and_a_tail() {
        let mut b = buddy(4 * MIB);
        // Метаданные съедают кусок последнего мегабайта.
        assert_eq!(b.free_blocks(BUDDY_ORDERS - 1), 3);
        assert_eq!(b.free_pages(), 3 * MAX_BLOCK_PAGES);
        let (tail, len) = b.claim_tail().expect("tail");
        assert!(len > 0 && len < MAX_BLOCK_PAGES * PAGE_SIZE);
        assert!(!b.contains(tail));
        assert_eq!(b.claim_tail(), None);
    }

    #[test]
    fn single_page_splits_down_and_merges_back() {
        let mut b = buddy(2 * MIB);
        let top = b.free_blocks(BUDDY_ORDERS - 1);
        let page = b.alloc(1, PageType::SYSTEM).unwrap();
        for order in 0..BUDDY_ORDERS - 1 {
            assert_eq!(b.free_blocks(order), 1, "order {}", order);
        }
        assert_eq!(b.free_blocks(BUDDY_ORDERS - 1), top - 1);

        b.free(page, 1);
        for order in 0..BUDDY_ORDERS - 1 {
            assert_eq!(b.free_blocks(order), 0, "order {}", order);
        }
        assert_eq!(b.free_blocks(BUDDY_ORDERS - 1), top);
    }

    #[test]
    fn pages_are_stamped_on_alloc_and_free() {
        let mut b = buddy(2 * MIB);
        let block = b.alloc(3, PageType::USER).unwrap();
        for i in 0..4 {
            let info = b.page_info(block.add(i * PAGE_SIZE)).unwrap();
            assert_eq!(info.kind, PageType::USER | PageType::IN_USE);
            assert_eq!(info.refs, 1);
        }
        b.free(block, 3);
        let info = b.page_info(block).unwrap();
        assert_eq!(info.kind, PageType::FREE | PageType::USABLE);
        assert_eq!(info.refs, 0);
    }

    #[test]
    fn random_traffic_never_overlaps_and_round_trips() {
        let mut b = buddy(6 * MIB);
        let initial = b.free_pages();
        let mut rng = XorShift::new(0x5eed);
        let mut live: Vec<(usize, usize)> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.next() % 3 != 0 {
                let pages = 1 + (rng.next() % 24) as usize;
                if let Some(addr) = b.alloc(pages, PageType::SYSTEM) {
                    let start = addr.as_usize();
                    let end = start + (1 << order_for(pages)) * PAGE_SIZE;
                    for &(s, p) in &live {
                        let e = s + (1 << order_for(p)) * PAGE_SIZE;
                        assert!(end <= s || start >= e, "overlap {:#x}..{:#x} with {:#x}..{:#x}", start, end, s, e);
                    }
                    live.push((start, pages));
                }
            } else {
                let victim = (rng.next() as usize) % live.len();
                let (addr, pages) = live.swap_remove(victim);
                b.free(PhysAddr::new(addr), pages);
            }
        }
        for (addr, pages) in live.drain(..) {
            b.free(PhysAddr::new(addr), pages);
        }
        assert_eq!(b.free_pages(), initial);
        for order in 0..BUDDY_ORDERS - 1 {
            assert_eq!(b.free_blocks(order), 0, "order {} not fully merged", order);
        }
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut b = buddy(3 * MIB);
        let top = b.free_blocks(BUDDY_ORDERS - 1);
        let mut taken = 0;
        while b.alloc(MAX_BLOCK_PAGES, PageType::SYSTEM).is_some() {
            taken += 1;
        }
        assert_eq!(taken, top);
        assert_eq!(b.alloc(1, PageType::SYSTEM), None);
    }

    #[test]
    fn requests_above_the_top_order_fail() {
        let mut b = buddy(4 * MIB);
        assert_eq!(b.alloc(MAX_BLOCK_PAGES + 1, PageType::SYSTEM), None);
    }

    #[test]
    fn page_halves_freed_separately_still_merge() {
        let mut b = buddy(2 * MIB);
        let before = b.free_pages();
        let pair = b.alloc(2, PageType::USER).unwrap();
        b.free(pair, 1);
        b.free(pair.add(PAGE_SIZE), 1);
        assert_eq!(b.free_pages(), before);
        assert_eq!(b.free_blocks(0), 0);
    }

    #[test]
    fn reference_counts_move_both_ways() {
        let mut b = buddy(2 * MIB);
        let page = b.alloc(1, PageType::USER).unwrap();
        assert_eq!(b.ref_inc(page), 2);
        assert_eq!(b.ref_dec(page), 1);
        assert_eq!(b.ref_dec(page), 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let mut b = buddy(2 * MIB);
        let page = b.alloc(1, PageType::SYSTEM).unwrap();
        b.free(page, 1);
        b.free(page, 1);
    }

    #[test]
    #[should_panic(expected = "outside the managed region")]
    fn foreign_free_is_fatal() {
        let mut b = buddy(2 * MIB);
        b.free(PhysAddr::new(0x1000), 1);
    }

    #[test]
    #[should_panic(expected = "not aligned")]
    fn misaligned_free_is_fatal() {
        let mut b = buddy(2 * MIB);
        let block = b.alloc(4, PageType::SYSTEM).unwrap();
        b.free(block.add(PAGE_SIZE), 4);
    }

    #[test]
    fn frame_allocator_zeroes_on_request() {
        let frames = unsafe { FrameAllocator::new(arena(2 * MIB)) };
        let page = frames.alloc(1, PageType::SYSTEM).unwrap();
        unsafe { ptr::write_bytes(page.as_mut_ptr::<u8>(), 0xee, PAGE_SIZE) };
        frames.free(page, 1);
        let page = frames.alloc_zeroed(1, PageType::SYSTEM).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(page.as_mut_ptr::<u8>(), PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
