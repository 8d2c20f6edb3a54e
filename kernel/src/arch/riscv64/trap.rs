//! Trap vectors and the Rust side of trap entry / exit
//!
//! Два вектора: `__user_vector` (сохраняет регистры в `TrapState` процесса,
//! адрес которого лежит в sscratch) и `__kernel_vector` (кадр на стеке ядра).
//! Two vectors: `__user_vector` (spills registers into the process's
//! `TrapState`, whose address sits in sscratch) and `__kernel_vector`
//! (frame on the kernel stack).

use core::arch::{asm, global_asm};

use riscv::register::{scause, sepc, sie, sstatus, stval, stvec};
use riscv::register::stvec::TrapMode;

use super::{hart_id, intr_off, sbi};
use crate::config::USE_SOFT_INT_COMP;
use crate::cpu::this_cpu;
use crate::trap::{self, TrapFrame, TrapInfo, TrapOutcome, TrapState};

global_asm!(include_str!("trap.asm"));

extern "C" {
    fn __user_vector();
    fn __kernel_vector();
    fn __user_ret(state: *mut TrapState) -> !;
}

/// Настроить stvec, разрешить прерывания таймера / внешние / программные и завести таймер.
/// Point stvec at the kernel vector, unmask timer / external / software interrupts, arm the timer.
pub fn init_hart() {
    unsafe {
        stvec::write(__kernel_vector as usize, TrapMode::Direct);
        sie::set_stimer();
        sie::set_sext();
        sie::set_ssoft();
    }
    if USE_SOFT_INT_COMP {
        sbi::k210_enable_external();
    }
    super::set_next_timer();
}

const SSTATUS_SUM: usize = 1 << 18;

fn read_sstatus() -> usize {
    let bits: usize;
    unsafe { asm!("csrr {}, sstatus", out(reg) bits) };
    bits
}

fn write_sstatus(bits: usize) {
    unsafe { asm!("csrw sstatus, {}", in(reg) bits) };
}

fn read_info() -> TrapInfo {
    TrapInfo {
        scause:  scause::read().bits(),
        stval:   stval::read(),
        sepc:    sepc::read(),
        sstatus: read_sstatus(),
    }
}

#[no_mangle]
extern "C" fn user_trap_handler(_state: *mut TrapState) -> ! {
    unsafe { stvec::write(__kernel_vector as usize, TrapMode::Direct) };

    let kernel = crate::kernel::get();
    let cpu = this_cpu();
    let info = read_info();

    if let TrapOutcome::Terminate(code) = trap::handle_user_trap(kernel, cpu, &info) {
        crate::proc::exit(kernel, code);
    }
    user_trap_return()
}

/// Вернуться в пользовательский режим текущего процесса.
/// Drop back into user mode for the current process.
#[no_mangle]
pub extern "C" fn user_trap_return() -> ! {
    intr_off();
    let kernel = crate::kernel::get();
    let cpu = this_cpu();
    let Some(pid) = cpu.current() else {
        panic!("user_trap_return: hart {} has no process", hart_id());
    };
    let Some(kstack_top) = kernel.procs.lock(pid).map(|p| p.kernel_stack_top()) else {
        panic!("user_trap_return: pid {} vanished", pid);
    };
    let state = kernel.procs.trap_state(pid);

    unsafe {
        (*state).kernel_sp = kstack_top;
        (*state).hart = hart_id();
        stvec::write(__user_vector as usize, TrapMode::Direct);
        sstatus::set_spp(sstatus::SPP::User);
        sstatus::set_spie();
        __user_ret(state)
    }
}

#[no_mangle]
extern "C" fn kernel_trap_handler(frame: &mut TrapFrame) {
    let info = read_info();
    let cpu = this_cpu();
    match crate::kernel::try_get() {
        Some(kernel) => trap::handle_kernel_trap(kernel, cpu, frame, &info),
        None => {
            trap::dump::dump_trap(cpu, &info, frame, None);
            panic!("trap during early boot");
        }
    }
    unsafe { sepc::write(info.sepc) };
    // SUM, выставленный при разборе исключения, должен пережить возврат.
    write_sstatus(info.sstatus | (read_sstatus() & SSTATUS_SUM));
}
