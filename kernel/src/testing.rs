//! Host-side test support
//!
//! «Физическая» память на хосте — выровненные по странице куски кучи
//! процесса, которые никогда не освобождаются. Поверх них собирается
//! настоящее ядро с поддельным контроллером прерываний.
//! "Physical" memory on the host is page-aligned chunks of the process heap
//! that are never freed. A real kernel is assembled on top of them with a
//! fake interrupt controller.

use std::alloc::{alloc_zeroed, Layout};
use std::collections::VecDeque;

use spin::Mutex;

use crate::config::{PAGE_SIZE, USER_IMAGE_BASE};
use crate::cpu::this_cpu;
use crate::kernel::Kernel;
use crate::mm::pmm::FrameAllocator;
use crate::mm::{MemoryRegion, PhysAddr};
use crate::proc::{self, FlatBinary, Pid, ProcStatus};
use crate::sched;
use crate::syscall::CoreSyscalls;
use crate::trap::InterruptController;

/// Размер памяти тестового ядра / Memory size of a test kernel
pub const KERNEL_ARENA: usize = 8 * 1024 * 1024;

/// `li a7, 124; ecall; j -8` — бесконечный sched_yield.
/// `li a7, 124; ecall; j -8`: sched_yield forever.
pub const YIELD_LOOP: [u8; 12] = [
    0x93, 0x08, 0xc0, 0x07,
    0x73, 0x00, 0x00, 0x00,
    0x6f, 0xf0, 0x9f, 0xff,
];

/// Обнулённый участок в `bytes` байт, выровненный по странице.
/// A zeroed, page-aligned stretch of `bytes` bytes.
pub fn arena(bytes: usize) -> MemoryRegion {
    let layout = match Layout::from_size_align(bytes, PAGE_SIZE) {
        Ok(layout) => layout,
        Err(err) => panic!("arena of {} bytes: {}", bytes, err),
    };
    let base = unsafe { alloc_zeroed(layout) };
    assert!(!base.is_null(), "host allocation of {} bytes failed", bytes);
    let start = PhysAddr::new(base as usize);
    MemoryRegion::new(start, start, start.add(bytes))
}

/// Детерминированный генератор для стресс-тестов.
/// Deterministic generator for stress tests.
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

// ── Fake interrupt controller ─────────────────────────────────────────────────

/// PLIC в памяти: тест кладёт IRQ в очередь, ядро их забирает.
/// In-memory PLIC: the test queues IRQs, the kernel claims them.
#[derive(Default)]
pub struct FakePlic {
    pending:   Mutex<VecDeque<u32>>,
    completed: Mutex<Vec<(usize, u32)>>,
    enabled:   Mutex<Vec<u32>>,
    harts:     Mutex<Vec<usize>>,
}

impl FakePlic {
    pub fn raise(&self, irq: u32) {
        self.pending.lock().push_back(irq);
    }

    pub fn completed(&self) -> Vec<(usize, u32)> {
        self.completed.lock().clone()
    }

    pub fn enabled(&self) -> Vec<u32> {
        self.enabled.lock().clone()
    }

    pub fn initialised_harts(&self) -> Vec<usize> {
        self.harts.lock().clone()
    }
}

impl InterruptController for FakePlic {
    fn init_hart(&self, hart: usize) {
        self.harts.lock().push(hart);
    }

    fn enable(&self, irq: u32) {
        self.enabled.lock().push(irq);
    }

    fn claim(&self, _hart: usize) -> Option<u32> {
        self.pending.lock().pop_front()
    }

    fn complete(&self, hart: usize, irq: u32) {
        self.completed.lock().push((hart, irq));
    }
}

// ── Kernels & processes ───────────────────────────────────────────────────────

static SYSCALLS: CoreSyscalls = CoreSyscalls;

/// Новое ядро с собственной памятью. Живёт до конца теста (утекает).
/// A fresh kernel with its own memory. Lives until the test ends (leaked).
pub fn kernel() -> &'static Kernel {
    kernel_with(Box::leak(Box::default()))
}

pub fn kernel_with(plic: &'static FakePlic) -> &'static Kernel {
    let frames = unsafe { FrameAllocator::new(arena(KERNEL_ARENA)) };
    match Kernel::new(frames, plic, &SYSCALLS) {
        Ok(kernel) => Box::leak(Box::new(kernel)),
        Err(err) => panic!("test kernel: {}", err),
    }
}

/// Готовый процесс, исполняющий `YIELD_LOOP`.
/// A ready process running `YIELD_LOOP`.
pub fn spawn(kernel: &Kernel, name: &str) -> Pid {
    let pid = match proc::alloc_process(kernel) {
        Ok(p) => p.pid,
        Err(err) => panic!("spawn {}: {}", name, err),
    };
    let mut loader = FlatBinary::new(USER_IMAGE_BASE, &YIELD_LOOP);
    if let Err(err) = proc::exec(kernel, pid, &mut loader, &[name], &[]) {
        panic!("spawn {}: {}", name, err);
    }
    pid
}

/// Изобразить выбор `pid` циклом планировщика этого харта.
/// Act out this hart's idle loop picking `pid`.
pub fn enter(kernel: &Kernel, pid: Pid) {
    let mut p = match kernel.procs.lock(pid) {
        Some(p) => p,
        None => panic!("enter: no pid {}", pid),
    };
    p.status.remove(ProcStatus::READY);
    p.status.insert(ProcStatus::RUNNING);
    drop(p);
    this_cpu().set_current(Some(pid));
}

/// Изобразить возврат из процесса в цикл планировщика.
/// Act out the process switching back into the idle loop.
pub fn leave(kernel: &Kernel) {
    if let Some(pid) = this_cpu().current() {
        this_cpu().set_current(None);
        sched::finish_switch_out(kernel, pid);
    }
}
