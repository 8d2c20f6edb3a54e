//! Corvid Kernel — точка входа / entry point

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod boot {
    use core::arch::global_asm;
    use core::panic::PanicInfo;
    use core::ptr;
    use core::sync::atomic::{AtomicBool, Ordering};

    use log::{error, info};

    use corvid::arch::current::{self as arch, sbi, trap};
    use corvid::config::{HARDWARE_VBASE, HART_COUNT, PLIC_BASE, PLIC_SIZE, RAM_BASE, RAM_SIZE, USER_IMAGE_BASE};
    use corvid::cpu::this_cpu;
    use corvid::mm::heap::{self, HEAP};
    use corvid::mm::pmm::FrameAllocator;
    use corvid::mm::vmm::{PageFlags, SystemMapping};
    use corvid::mm::{page_round_up, MemoryRegion, PhysAddr, VirtAddr};
    use corvid::proc::{self, FlatBinary};
    use corvid::syscall::CoreSyscalls;
    use corvid::trap::Plic;
    use corvid::{kernel, kprintln, logging, sched, Kernel};

    global_asm!(include_str!("arch/riscv64/entry.asm"));

    extern "C" {
        fn _start();
        static mut __bss_start: u8;
        static mut __bss_end: u8;
        static _kernel_end: u8;
    }

    /// `li a7, 124; ecall; j -8` — init только уступает харт.
    /// `li a7, 124; ecall; j -8`: init just keeps yielding the hart.
    static INIT_CODE: [u8; 12] = [
        0x93, 0x08, 0xc0, 0x07,
        0x73, 0x00, 0x00, 0x00,
        0x6f, 0xf0, 0x9f, 0xff,
    ];

    static PLIC: Plic = Plic::new(HARDWARE_VBASE);
    static SYSCALLS: CoreSyscalls = CoreSyscalls;

    /// Харт 0 закончил инициализацию / hart 0 finished bring-up
    static STARTED: AtomicBool = AtomicBool::new(false);

    /// Точка входа каждого харта (из `entry.asm`).
    /// Entry point of every hart (from `entry.asm`).
    #[no_mangle]
    extern "C" fn kernel_entry(hart: usize, _dtb: usize) -> ! {
        let kernel = if hart == 0 { boot_primary() } else { boot_secondary(hart) };
        sched::run(kernel, this_cpu())
    }

    fn boot_primary() -> &'static Kernel {
        unsafe { clear_bss() };
        logging::init();
        kprintln!("Corvid booting on hart 0...");

        let kernel_end = unsafe { ptr::addr_of!(_kernel_end) as usize };
        let region = MemoryRegion::new(
            PhysAddr::new(RAM_BASE),
            PhysAddr::new(page_round_up(kernel_end)),
            PhysAddr::new(RAM_BASE + RAM_SIZE),
        );
        // 1. Physical Memory Manager
        let frames = unsafe { FrameAllocator::new(region) };
        // 2. Kernel Heap — после этого работают Box<T>, Vec<T>
        //    Kernel Heap — after this Box<T>, Vec<T> work
        heap::populate(&HEAP, &frames);

        // 3. Kernel context
        let kernel = match Kernel::new(frames, &PLIC, &SYSCALLS) {
            Ok(k) => kernel::install(k),
            Err(err) => panic!("kernel context: {}", err),
        };

        // 4. MMIO + Sv39
        let plic_window = SystemMapping {
            virt:  VirtAddr::new(HARDWARE_VBASE),
            phys:  PhysAddr::new(PLIC_BASE),
            size:  PLIC_SIZE,
            flags: PageFlags::RW | PageFlags::GLOBAL,
        };
        if let Err(err) = kernel.space.map_system(&kernel.frames, plic_window) {
            panic!("map PLIC: {}", err);
        }
        kernel.space.activate();

        // 5. Traps + interrupts
        trap::init_hart();
        kernel.plic.init_hart(0);
        kernel.frames.log_stats();

        // 6. Первый процесс / First process
        let mut init = FlatBinary::new(USER_IMAGE_BASE, &INIT_CODE);
        match proc::setup_init(kernel, &mut init) {
            Ok(pid) => info!(target: "boot", "init is pid {}", pid),
            Err(err) => panic!("init: {}", err),
        }

        STARTED.store(true, Ordering::Release);
        for other in 1..HART_COUNT {
            let rc = sbi::hart_start(other, _start as usize, 0);
            if rc != 0 {
                error!(target: "boot", "hart {} did not start: {}", other, rc);
            }
        }
        kprintln!("Kernel ready on {} hart(s).", HART_COUNT);
        kernel
    }

    fn boot_secondary(hart: usize) -> &'static Kernel {
        while !STARTED.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        let kernel = kernel::get();
        kernel.space.activate();
        trap::init_hart();
        kernel.plic.init_hart(hart);
        info!(target: "boot", "hart {} online", hart);
        kernel
    }

    unsafe fn clear_bss() {
        unsafe {
            let start = ptr::addr_of_mut!(__bss_start);
            let end = ptr::addr_of_mut!(__bss_end);
            ptr::write_bytes(start, 0, end as usize - start as usize);
        }
    }

    /// Panic handler — выводим в консоль и останавливаем харт.
    /// Panic handler — print to the console and halt the hart.
    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        arch::intr_off();
        unsafe { corvid::drivers::console::force_unlock() };
        kprintln!("\n[KERNEL PANIC] hart {}: {}", arch::hart_id(), info);
        arch::halt()
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn main() {
    eprintln!("corvid-kernel boots on riscv64gc-unknown-none-elf; run `cargo test` on the host.");
}
