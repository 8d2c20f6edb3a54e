//! Kernel Heap — pools with a size-keyed AVL index
//!
//! Пулы — непрерывные куски памяти от buddy (или хвост региона), связанные в список.
//! Pools are contiguous chunks from the buddy allocator (or the region tail),
//! chained in a list.
//!
//! Каждый блок начинается с 16-байтного заголовка (cookie, тег, размер).
//! Свободные блоки хранят в своей полезной нагрузке узел AVL-дерева,
//! упорядоченного по полному размеру блока; блоки одного размера висят
//! цепочкой на узле дерева.
//! Every block starts with a 16-byte header (cookie, tag, size). Free blocks
//! keep an AVL node in their payload, ordered by total block size; blocks of
//! equal size hang off the tree node as a chain.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::size_of;
use core::ptr::{self, NonNull};

use log::{debug, info};

use super::pmm::{FrameAllocator, PageType};
use crate::config::{HEAP_POOLS, HEAP_POOL_PAGES, PAGE_SIZE};
use crate::sync::SpinLock;

const GRANULE: usize = 16;
const COOKIE:  u16   = 0xD1AC;

/// Состояние блока в заголовке / Block state in the header
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Free  = 0xF4EE,
    InUse = 0x05ED,
}

#[repr(C)]
struct BlockHeader {
    cookie: u16,
    tag:    u16,
    _pad:   u32,
    /// Полный размер блока вместе с заголовком.
    size:   usize,
}

#[repr(C)]
struct FreeLinks {
    left:    *mut BlockHeader,
    right:   *mut BlockHeader,
    /// Цепочка дубликатов: у узла дерева prev == null.
    prev:    *mut BlockHeader,
    next:    *mut BlockHeader,
    height:  u32,
    chained: u32,
}

const HEADER: usize = size_of::<BlockHeader>();
/// Остаток меньше «заголовок свободного блока + 16 байт» не отщепляется.
/// A remainder below "free-block header + 16 bytes" is not split off.
const SPLIT_THRESHOLD: usize = HEADER + size_of::<FreeLinks>() + GRANULE;
const MIN_BLOCK: usize = align_up(HEADER + size_of::<FreeLinks>(), GRANULE);

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

// ── Pools ─────────────────────────────────────────────────────────────────────

#[repr(C)]
struct Pool {
    next:       *mut Pool,
    start:      usize,
    end:        usize,
    root:       *mut BlockHeader,
    free_bytes: usize,
}

struct PoolList {
    head:  *mut Pool,
    tail:  *mut Pool,
    count: usize,
}

// Пулы — память, которой владеет куча.
unsafe impl Send for PoolList {}

impl PoolList {
    fn iter(&self) -> impl Iterator<Item = *mut Pool> + '_ {
        let mut at = self.head;
        core::iter::from_fn(move || {
            let pool = at;
            if pool.is_null() {
                return None;
            }
            at = unsafe { (*pool).next };
            Some(pool)
        })
    }

    fn find(&self, addr: usize) -> Option<*mut Pool> {
        self.iter().find(|&pool| unsafe { (*pool).start <= addr && addr < (*pool).end })
    }
}

pub struct KernelHeap {
    pools: SpinLock<PoolList>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            pools: SpinLock::new("heap", PoolList {
                head:  ptr::null_mut(),
                tail:  ptr::null_mut(),
                count: 0,
            }),
        }
    }

    /// Добавить пул в конец списка. `false`, если он слишком мал.
    /// Append a pool. Returns `false` when it is too small to hold a block.
    ///
    /// # Safety
    /// Память `addr..addr + len` переходит во владение кучи навсегда.
    /// The memory `addr..addr + len` becomes heap-owned for good.
    pub unsafe fn add_pool(&self, addr: usize, len: usize) -> bool {
        let base = align_up(addr, GRANULE);
        let end = align_down(addr + len, GRANULE);
        let first = align_up(base + size_of::<Pool>(), GRANULE);
        if end < first + MIN_BLOCK {
            return false;
        }

        let pool = base as *mut Pool;
        unsafe {
            let block = first as *mut BlockHeader;
            write_header(block, BlockTag::Free, end - first);
            pool.write(Pool {
                next:       ptr::null_mut(),
                start:      first,
                end,
                root:       insert(ptr::null_mut(), block),
                free_bytes: end - first,
            });
        }

        let mut list = self.pools.lock();
        if list.tail.is_null() {
            list.head = pool;
        } else {
            unsafe { (*list.tail).next = pool };
        }
        list.tail = pool;
        list.count += 1;
        debug!(target: "heap", "pool #{} at {:#x}..{:#x}", list.count, first, end);
        true
    }

    /// Выделить `size` байт (выравнивание 16). `None`, если ни один пул не вместил.
    /// Allocate `size` bytes (16-aligned). `None` when no pool can hold it.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let need = align_up(size.checked_add(HEADER)?, GRANULE).max(MIN_BLOCK);
        let list = self.pools.lock();
        let block = list
            .iter()
            .find_map(|pool| unsafe { carve(pool, need) })
            .and_then(NonNull::new);
        block
    }

    /// Вернуть блок в его пул, склеив со свободными соседями.
    /// Return a block to its pool, merging it with free neighbours.
    ///
    /// # Safety
    /// `ptr` должен быть получен из `allocate` этой кучи.
    /// `ptr` must come from `allocate` on this heap.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let header = unsafe { ptr.as_ptr().sub(HEADER) } as *mut BlockHeader;
        unsafe {
            if (*header).cookie != COOKIE {
                panic!("heap: bad cookie at {:p}", ptr);
            }
            match (*header).tag {
                t if t == BlockTag::InUse as u16 => {}
                t if t == BlockTag::Free as u16 => panic!("heap: double free of {:p}", ptr),
                t => panic!("heap: bad tag {:#x} at {:p}", t, ptr),
            }
        }

        let list = self.pools.lock();
        let Some(pool) = list.find(header as usize) else {
            panic!("heap: {:p} does not belong to any pool", ptr);
        };

        unsafe {
            let mut start = header;
            let mut size = (*header).size;
            (*pool).free_bytes += size;

            // Поглощаем все свободные блоки, идущие следом.
            loop {
                let next = start as usize + size;
                if next >= (*pool).end {
                    break;
                }
                let next = next as *mut BlockHeader;
                if !is_free_block((*pool).root, next) {
                    break;
                }
                (*pool).root = remove((*pool).root, next);
                size += (*next).size;
            }

            let before = find_ending_at((*pool).root, start as usize);
            if !before.is_null() {
                (*pool).root = remove((*pool).root, before);
                size += (*before).size;
                start = before;
            }

            #[cfg(feature = "heap-poison")]
            ptr::write_bytes((start as *mut u8).add(HEADER), 0xA5, size - HEADER);

            write_header(start, BlockTag::Free, size);
            (*pool).root = insert((*pool).root, start);
        }
    }

    /// Полезный размер выделенного блока.
    /// Usable size of an allocated block.
    ///
    /// # Safety
    /// `ptr` должен быть живым результатом `allocate`.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { (*(ptr.as_ptr().sub(HEADER) as *const BlockHeader)).size - HEADER }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().count
    }

    pub fn free_bytes(&self) -> usize {
        self.pools.lock().iter().map(|pool| unsafe { (*pool).free_bytes }).sum()
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Наполнить кучу: хвост региона плюс `HEAP_POOLS` блоков от buddy.
/// Stock the heap: the region tail plus `HEAP_POOLS` blocks from the buddy allocator.
pub fn populate(heap: &KernelHeap, frames: &FrameAllocator) -> usize {
    let mut added = 0;
    if let Some((tail, len)) = frames.claim_tail() {
        if unsafe { heap.add_pool(tail.as_usize(), len) } {
            added += 1;
        }
    }
    for _ in 0..HEAP_POOLS {
        let Some(block) = frames.alloc(HEAP_POOL_PAGES, PageType::POOL | PageType::SYSTEM) else {
            break;
        };
        if unsafe { heap.add_pool(block.as_usize(), HEAP_POOL_PAGES * PAGE_SIZE) } {
            added += 1;
        }
    }
    info!(target: "heap", "{} pools, {} KiB free", heap.pool_count(), heap.free_bytes() / 1024);
    added
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= GRANULE {
            return self.allocate(layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr);
        }
        // Перевыделяем и прячем исходный указатель прямо перед выровненным.
        let Some(raw) = layout.size().checked_add(layout.align()).and_then(|n| self.allocate(n)) else {
            return ptr::null_mut();
        };
        let aligned = align_up(raw.as_ptr() as usize + 1, layout.align());
        unsafe { ((aligned - size_of::<usize>()) as *mut usize).write(raw.as_ptr() as usize) };
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let raw = if layout.align() <= GRANULE {
            ptr
        } else {
            unsafe { *((ptr as usize - size_of::<usize>()) as *const usize) as *mut u8 }
        };
        if let Some(raw) = NonNull::new(raw) {
            unsafe { self.free(raw) };
        }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[global_allocator]
pub static HEAP: KernelHeap = KernelHeap::new();

// ── Block carving ─────────────────────────────────────────────────────────────

unsafe fn write_header(block: *mut BlockHeader, tag: BlockTag, size: usize) {
    unsafe {
        block.write(BlockHeader { cookie: COOKIE, tag: tag as u16, _pad: 0, size });
    }
}

unsafe fn is_free_block(root: *mut BlockHeader, block: *mut BlockHeader) -> bool {
    unsafe {
        (*block).cookie == COOKIE
            && (*block).tag == BlockTag::Free as u16
            && contains(root, block)
    }
}

/// Лучшая подгонка внутри одного пула.
/// Best fit inside one pool.
unsafe fn carve(pool: *mut Pool, need: usize) -> Option<*mut u8> {
    unsafe {
        let mut block = search_upper((*pool).root, need);
        if block.is_null() {
            return None;
        }
        // Дубликат из цепочки снимается дешевле узла дерева.
        let dup = (*links(block)).next;
        if !dup.is_null() {
            block = dup;
        }
        (*pool).root = remove((*pool).root, block);

        let total = (*block).size;
        let rest = total - need;
        let used = if rest >= SPLIT_THRESHOLD {
            let tail = (block as usize + need) as *mut BlockHeader;
            write_header(tail, BlockTag::Free, rest);
            (*pool).root = insert((*pool).root, tail);
            need
        } else {
            total
        };
        write_header(block, BlockTag::InUse, used);
        (*pool).free_bytes -= used;
        Some((block as *mut u8).add(HEADER))
    }
}

// ── AVL index over free blocks ───────────────────────────────────────────────

unsafe fn links(node: *mut BlockHeader) -> *mut FreeLinks {
    unsafe { (node as *mut u8).add(HEADER) as *mut FreeLinks }
}

unsafe fn key(node: *mut BlockHeader) -> usize {
    unsafe { (*node).size }
}

unsafe fn left(node: *mut BlockHeader) -> *mut BlockHeader {
    unsafe { (*links(node)).left }
}

unsafe fn right(node: *mut BlockHeader) -> *mut BlockHeader {
    unsafe { (*links(node)).right }
}

unsafe fn height(node: *mut BlockHeader) -> u32 {
    if node.is_null() { 0 } else { unsafe { (*links(node)).height } }
}

unsafe fn fix_height(node: *mut BlockHeader) {
    unsafe { (*links(node)).height = 1 + height(left(node)).max(height(right(node))) };
}

unsafe fn rotate_right(node: *mut BlockHeader) -> *mut BlockHeader {
    unsafe {
        let pivot = left(node);
        (*links(node)).left = right(pivot);
        (*links(pivot)).right = node;
        fix_height(node);
        fix_height(pivot);
        pivot
    }
}

unsafe fn rotate_left(node: *mut BlockHeader) -> *mut BlockHeader {
    unsafe {
        let pivot = right(node);
        (*links(node)).right = left(pivot);
        (*links(pivot)).left = node;
        fix_height(node);
        fix_height(pivot);
        pivot
    }
}

unsafe fn rebalance(node: *mut BlockHeader) -> *mut BlockHeader {
    unsafe {
        fix_height(node);
        let skew = height(left(node)) as i64 - height(right(node)) as i64;
        if skew > 1 {
            if height(left(left(node))) < height(right(left(node))) {
                (*links(node)).left = rotate_left(left(node));
            }
            return rotate_right(node);
        }
        if skew < -1 {
            if height(right(right(node))) < height(left(right(node))) {
                (*links(node)).right = rotate_right(right(node));
            }
            return rotate_left(node);
        }
        node
    }
}

unsafe fn insert(root: *mut BlockHeader, node: *mut BlockHeader) -> *mut BlockHeader {
    unsafe {
        if root.is_null() {
            links(node).write(FreeLinks {
                left:    ptr::null_mut(),
                right:   ptr::null_mut(),
                prev:    ptr::null_mut(),
                next:    ptr::null_mut(),
                height:  1,
                chained: 0,
            });
            return node;
        }
        if key(node) == key(root) {
            let next = (*links(root)).next;
            links(node).write(FreeLinks {
                left:    ptr::null_mut(),
                right:   ptr::null_mut(),
                prev:    root,
                next,
                height:  0,
                chained: 1,
            });
            if !next.is_null() {
                (*links(next)).prev = node;
            }
            (*links(root)).next = node;
            return root;
        }
        if key(node) < key(root) {
            (*links(root)).left = insert(left(root), node);
        } else {
            (*links(root)).right = insert(right(root), node);
        }
        rebalance(root)
    }
}

unsafe fn remove(root: *mut BlockHeader, node: *mut BlockHeader) -> *mut BlockHeader {
    unsafe {
        let l = links(node);
        if (*l).chained != 0 {
            let (prev, next) = ((*l).prev, (*l).next);
            (*links(prev)).next = next;
            if !next.is_null() {
                (*links(next)).prev = prev;
            }
            return root;
        }
        let heir = (*l).next;
        if !heir.is_null() {
            // Первый дубликат занимает место узла в дереве.
            let h = links(heir);
            (*h).left = (*l).left;
            (*h).right = (*l).right;
            (*h).height = (*l).height;
            (*h).prev = ptr::null_mut();
            (*h).chained = 0;
            return replace(root, node, heir);
        }
        remove_key(root, key(node))
    }
}

unsafe fn replace(
    sub: *mut BlockHeader,
    old: *mut BlockHeader,
    new: *mut BlockHeader,
) -> *mut BlockHeader {
    unsafe {
        if sub.is_null() {
            panic!("heap: free index lost block {:p}", old);
        }
        if sub == old {
            return new;
        }
        if key(old) < key(sub) {
            (*links(sub)).left = replace(left(sub), old, new);
        } else {
            (*links(sub)).right = replace(right(sub), old, new);
        }
        sub
    }
}

unsafe fn remove_key(sub: *mut BlockHeader, k: usize) -> *mut BlockHeader {
    unsafe {
        if sub.is_null() {
            panic!("heap: free index has no block of size {}", k);
        }
        if k < key(sub) {
            (*links(sub)).left = remove_key(left(sub), k);
        } else if k > key(sub) {
            (*links(sub)).right = remove_key(right(sub), k);
        } else {
            let (l, r) = (left(sub), right(sub));
            if r.is_null() {
                return l;
            }
            let (min, rest) = remove_min(r);
            (*links(min)).left = l;
            (*links(min)).right = rest;
            return rebalance(min);
        }
        rebalance(sub)
    }
}

unsafe fn remove_min(sub: *mut BlockHeader) -> (*mut BlockHeader, *mut BlockHeader) {
    unsafe {
        if left(sub).is_null() {
            return (sub, right(sub));
        }
        let (min, rest) = remove_min(left(sub));
        (*links(sub)).left = rest;
        (min, rebalance(sub))
    }
}

/// Наименьший узел с ключом ≥ `k`; точное совпадение сразу.
/// Smallest node with key ≥ `k`; an exact match wins immediately.
unsafe fn search_upper(root: *mut BlockHeader, k: usize) -> *mut BlockHeader {
    let mut best = ptr::null_mut();
    let mut at = root;
    unsafe {
        while !at.is_null() {
            if key(at) == k {
                return at;
            }
            if key(at) > k {
                best = at;
                at = left(at);
            } else {
                at = right(at);
            }
        }
    }
    best
}

unsafe fn contains(root: *mut BlockHeader, node: *mut BlockHeader) -> bool {
    unsafe {
        let k = key(node);
        let mut at = root;
        while !at.is_null() {
            if k == key(at) {
                let mut member = at;
                while !member.is_null() {
                    if member == node {
                        return true;
                    }
                    member = (*links(member)).next;
                }
                return false;
            }
            at = if k < key(at) { left(at) } else { right(at) };
        }
        false
    }
}

unsafe fn find_ending_at(sub: *mut BlockHeader, addr: usize) -> *mut BlockHeader {
    if sub.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        let mut member = sub;
        while !member.is_null() {
            if member as usize + key(member) == addr {
                return member;
            }
            member = (*links(member)).next;
        }
        let found = find_ending_at(left(sub), addr);
        if !found.is_null() {
            return found;
        }
        find_ending_at(right(sub), addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{arena, XorShift};

    fn heap_with_pool(bytes: usize) -> KernelHeap {
        let heap = KernelHeap::new();
        let region = arena(bytes);
        assert!(unsafe { heap.add_pool(region.start.as_usize(), bytes) });
        heap
    }

    fn alloc(heap: &KernelHeap, size: usize) -> NonNull<u8> {
        heap.allocate(size).expect("allocation")
    }

    #[test]
    fn blocks_are_aligned_and_disjoint() {
        let heap = heap_with_pool(64 * 1024);
        let a = alloc(&heap, 24);
        let b = alloc(&heap, 100);
        assert_eq!(a.as_ptr() as usize % GRANULE, 0);
        assert_eq!(b.as_ptr() as usize % GRANULE, 0);
        assert!(b.as_ptr() as usize >= a.as_ptr() as usize + 24);
        unsafe {
            ptr::write_bytes(a.as_ptr(), 0x11, 24);
            ptr::write_bytes(b.as_ptr(), 0x22, 100);
            assert_eq!(*a.as_ptr().add(23), 0x11);
        }
    }

    #[test]
    fn freeing_everything_restores_one_block_without_new_pools() {
        let heap = heap_with_pool(64 * 1024);
        let initial = heap.free_bytes();
        let mut rng = XorShift::new(7);
        let mut live = Vec::new();
        while let Some(p) = heap.allocate(16 + (rng.next() % 700) as usize) {
            live.push(p);
        }
        assert!(live.len() > 50);
        // Освобождаем вперемешку.
        while !live.is_empty() {
            let i = (rng.next() as usize) % live.len();
            unsafe { heap.free(live.swap_remove(i)) };
        }
        assert_eq!(heap.free_bytes(), initial);
        assert_eq!(heap.pool_count(), 1);
        let whole = heap.allocate(initial - HEADER).expect("coalesced pool");
        unsafe { heap.free(whole) };
    }

    #[test]
    fn best_fit_picks_the_smallest_hole() {
        let heap = heap_with_pool(64 * 1024);
        let a = alloc(&heap, 100);
        let _s1 = alloc(&heap, 16);
        let b = alloc(&heap, 300);
        let _s2 = alloc(&heap, 16);
        let c = alloc(&heap, 200);
        let _s3 = alloc(&heap, 16);
        unsafe {
            heap.free(a);
            heap.free(b);
            heap.free(c);
        }
        let got = alloc(&heap, 190);
        assert_eq!(got, c);
    }

    #[test]
    fn equal_sized_holes_are_all_reusable() {
        let heap = heap_with_pool(64 * 1024);
        let blocks: Vec<_> = (0..6).map(|_| alloc(&heap, 64)).collect();
        let _fence = alloc(&heap, 16);
        unsafe {
            heap.free(blocks[0]);
            heap.free(blocks[2]);
            heap.free(blocks[4]);
        }
        let mut again: Vec<_> = (0..3).map(|_| alloc(&heap, 64).as_ptr() as usize).collect();
        again.sort_unstable();
        let mut expected: Vec<_> = [0, 2, 4].iter().map(|&i| blocks[i].as_ptr() as usize).collect();
        expected.sort_unstable();
        assert_eq!(again, expected);
    }

    #[test]
    fn small_remainder_is_not_split() {
        let heap = heap_with_pool(64 * 1024);
        let hole = alloc(&heap, 208);
        let _fence = alloc(&heap, 16);
        unsafe { heap.free(hole) };
        // Блок 224 байта, запрос 144 (+заголовок = 160): остаток 64 < порога.
        let got = alloc(&heap, 144);
        assert_eq!(got, hole);
        assert_eq!(unsafe { heap.usable_size(got) }, 208);
    }

    #[test]
    fn misses_fall_through_to_the_next_pool() {
        let heap = heap_with_pool(4096);
        let second = arena(64 * 1024);
        assert!(unsafe { heap.add_pool(second.start.as_usize(), 64 * 1024) });
        let big = alloc(&heap, 8000);
        let addr = big.as_ptr() as usize;
        assert!(addr >= second.start.as_usize() && addr < second.end.as_usize());
        assert_eq!(heap.pool_count(), 2);
    }

    #[test]
    fn exhausted_heap_returns_none() {
        let heap = heap_with_pool(4096);
        assert!(heap.allocate(8192).is_none());
    }

    #[test]
    #[should_panic(expected = "bad cookie")]
    fn corrupted_header_is_fatal() {
        let heap = heap_with_pool(4096);
        let p = alloc(&heap, 32);
        unsafe {
            *(p.as_ptr().sub(HEADER) as *mut u16) = 0xdead;
            heap.free(p);
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let heap = heap_with_pool(4096);
        let p = alloc(&heap, 32);
        let _fence = alloc(&heap, 32);
        unsafe {
            heap.free(p);
            heap.free(p);
        }
    }

    #[test]
    fn global_alloc_honours_large_alignment() {
        let heap = heap_with_pool(64 * 1024);
        let before = heap.free_bytes();
        let layout = Layout::from_size_align(100, 256).unwrap();
        unsafe {
            let p = heap.alloc(layout);
            assert!(!p.is_null());
            assert_eq!(p as usize % 256, 0);
            ptr::write_bytes(p, 0x5a, 100);
            heap.dealloc(p, layout);
        }
        assert_eq!(heap.free_bytes(), before);
    }

    #[test]
    fn populate_adopts_the_tail_and_buddy_pools() {
        let frames = unsafe { FrameAllocator::new(arena(4 * 1024 * 1024)) };
        let heap = KernelHeap::new();
        let added = populate(&heap, &frames);
        assert_eq!(added, 1 + HEAP_POOLS);
        assert_eq!(heap.pool_count(), added);
        assert!(heap.allocate(64 * 1024).is_some());
    }
}
