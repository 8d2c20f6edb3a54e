//! Compile-time configuration
//!
//! Платформа выбирается Cargo-фичей: `platform-qemu` (по умолчанию) или `platform-k210`.
//! The platform is selected by a Cargo feature: `platform-qemu` (default) or `platform-k210`.

use log::LevelFilter;

// ── Processes & harts ────────────────────────────────────────────────────────

/// Слотов в таблице процессов (слот 0 зарезервирован).
/// Process table slots (slot 0 is reserved).
pub const MAX_PROC: usize = 32;
pub const MAX_CPUS: usize = 8;
pub const MAX_FILES: usize = 16;

/// Обе платформы — двухъядерные / both platforms are dual-core
pub const HART_COUNT: usize = 2;

/// pid процесса init / pid of the init process
pub const INIT_PID: usize = 1;

// ── Memory layout ────────────────────────────────────────────────────────────

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Порядков в buddy-аллокаторе: блоки до 2^8 страниц = 1 MiB.
/// Buddy orders: blocks up to 2^8 pages = 1 MiB.
pub const BUDDY_ORDERS: usize = 9;

pub const RAM_BASE: usize = 0x8000_0000;
#[cfg(not(feature = "platform-k210"))]
pub const RAM_SIZE: usize = 128 * 1024 * 1024;
#[cfg(feature = "platform-k210")]
pub const RAM_SIZE: usize = 6 * 1024 * 1024;

/// Адрес загрузки ядра; всё ниже — пользовательское пространство.
/// Kernel load address; everything below belongs to user space.
pub const KERN_BASE: usize = 0x8020_0000;

/// Окно MMIO сразу над 1 GiB identity-маппингом ядра.
/// MMIO window right above the kernel's 1 GiB identity mapping.
pub const HARDWARE_VBASE: usize = 0xC000_0000;

pub const KERNEL_STACK_PAGES: usize = 2;
pub const BOOT_STACK_SIZE: usize = 16 * 1024;

pub const USER_IMAGE_BASE: usize = 0x1000;
pub const USER_STACK_SIZE: usize = 8192;
/// Вершина пользовательского стека (растёт вниз).
/// Top of the user stack (grows down).
pub const USER_STACK_BASE: usize = 0x8000_0000;

/// Пулы кучи, выделяемые из buddy сверх хвоста региона.
/// Heap pools taken from the buddy allocator on top of the region tail.
pub const HEAP_POOLS: usize = 2;
pub const HEAP_POOL_PAGES: usize = 1 << (BUDDY_ORDERS - 1);

// ── Interrupts ───────────────────────────────────────────────────────────────

pub const MAX_IRQ: usize = 64;

pub const PLIC_BASE: usize = 0x0C00_0000;
/// Отображается только используемая часть: приоритеты, разрешения и
/// контексты всех хартов.
/// Only the used part is mapped: priorities, enables and every hart's contexts.
pub const PLIC_SIZE: usize = 0x20_0000 + 0x1000 * 2 * MAX_CPUS;

#[cfg(not(feature = "platform-k210"))]
pub const TIMER_INTERVAL: u64 = 100_000;
#[cfg(feature = "platform-k210")]
pub const TIMER_INTERVAL: u64 = 78_000;

/// K210: внешние прерывания приходят как программные с `stval == 9`.
/// K210: external interrupts arrive as software interrupts with `stval == 9`.
pub const USE_SOFT_INT_COMP: bool = cfg!(feature = "platform-k210");

/// Контекст PLIC для S-режима данного харта.
/// PLIC context of the given hart's supervisor mode.
pub const fn plic_context(hart: usize) -> usize {
    if USE_SOFT_INT_COMP { hart * 2 } else { hart * 2 + 1 }
}

// ── Logging ──────────────────────────────────────────────────────────────────

pub const LOG_LEVEL: LevelFilter = if cfg!(feature = "verbose") {
    LevelFilter::Trace
} else {
    LevelFilter::Info
};
