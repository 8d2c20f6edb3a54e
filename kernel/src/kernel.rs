//! The kernel context
//!
//! Всё глобальное состояние ядра собрано в одну структуру и передаётся явно.
//! На цели сборки единственный экземпляр живёт в `spin::Once`; тесты строят
//! собственные экземпляры.
//! All global kernel state sits in one struct that is passed explicitly. On
//! the target the single instance lives in a `spin::Once`; tests build their
//! own instances.

use log::info;

use crate::error::Result;
use crate::mm::pmm::FrameAllocator;
use crate::mm::vmm::KernelSpace;
use crate::proc::ProcessTable;
use crate::sched::Scheduler;
use crate::syscall::SyscallTable;
use crate::trap::{InterruptController, IrqTable, Ticks};

pub struct Kernel {
    pub frames:    FrameAllocator,
    pub space:     KernelSpace,
    pub procs:     ProcessTable,
    pub scheduler: Scheduler,
    pub ticks:     Ticks,
    pub irqs:      IrqTable,
    pub plic:      &'static dyn InterruptController,
    pub syscalls:  &'static dyn SyscallTable,
}

impl Kernel {
    /// Построить ядро поверх готового аллокатора кадров.
    /// Build the kernel on top of a ready frame allocator.
    pub fn new(
        frames: FrameAllocator,
        plic: &'static dyn InterruptController,
        syscalls: &'static dyn SyscallTable,
    ) -> Result<Self> {
        let space = KernelSpace::new(&frames)?;
        info!(target: "kernel", "kernel root at {:?}", space.root());
        Ok(Self {
            frames,
            space,
            procs: ProcessTable::new(),
            scheduler: Scheduler::new(),
            ticks: Ticks::new(),
            irqs: IrqTable::new(),
            plic,
            syscalls,
        })
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
static KERNEL: spin::Once<Kernel> = spin::Once::new();

/// Опубликовать ядро (один раз, на харте 0).
/// Publish the kernel (once, on hart 0).
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn install(kernel: Kernel) -> &'static Kernel {
    KERNEL.call_once(|| kernel)
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn get() -> &'static Kernel {
    match KERNEL.get() {
        Some(kernel) => kernel,
        None => panic!("kernel used before install"),
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn try_get() -> Option<&'static Kernel> {
    KERNEL.get()
}
