//! Trap & interrupt dispatch
//!
//! Архитектурный код сохраняет регистры и передаёт сюда `TrapInfo`;
//! решения (syscall, страничная ошибка, прерывание, убийство процесса)
//! принимаются здесь и не зависят от цели сборки.
//! Arch code spills the registers and hands a `TrapInfo` here; the decisions
//! (syscall, page fault, interrupt, killing the process) are made here and
//! do not depend on the build target.

pub mod dump;
pub mod frame;
pub mod irq;
pub mod plic;
pub mod timer;

use core::fmt;

use log::{error, warn};

pub use frame::{TrapFrame, TrapState};
pub use irq::{IrqHandler, IrqTable};
pub use plic::{InterruptController, Plic};
pub use timer::{sleep_ticks, Ticks};

use crate::arch::current as arch;
use crate::config::{KERN_BASE, USE_SOFT_INT_COMP};
use crate::cpu::Cpu;
use crate::error::Result;
use crate::kernel::Kernel;
use crate::mm::VirtAddr;
use crate::proc::{Pid, ProcStatus};

const INTERRUPT_BIT: usize = 1 << 63;

/// stval программного прерывания, которым SBI на K210 передаёт внешнее.
/// stval of the software interrupt SBI uses on K210 to forward an external one.
const K210_EXTERNAL_STVAL: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoft,
    SupervisorTimer,
    SupervisorExternal,
    Other(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionMisaligned,
    InstructionFault,
    IllegalInstruction,
    Breakpoint,
    LoadMisaligned,
    LoadFault,
    StoreMisaligned,
    StoreFault,
    UserEnvCall,
    SupervisorEnvCall,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
    Reserved(usize),
}

impl Exception {
    fn from_code(code: usize) -> Self {
        match code {
            0  => Exception::InstructionMisaligned,
            1  => Exception::InstructionFault,
            2  => Exception::IllegalInstruction,
            3  => Exception::Breakpoint,
            4  => Exception::LoadMisaligned,
            5  => Exception::LoadFault,
            6  => Exception::StoreMisaligned,
            7  => Exception::StoreFault,
            8  => Exception::UserEnvCall,
            9  => Exception::SupervisorEnvCall,
            12 => Exception::InstructionPageFault,
            13 => Exception::LoadPageFault,
            15 => Exception::StorePageFault,
            n  => Exception::Reserved(n),
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Exception::InstructionMisaligned => "Instruction address misaligned.",
            Exception::InstructionFault      => "Instruction access fault.",
            Exception::IllegalInstruction    => "Illegal instruction.",
            Exception::Breakpoint            => "Breakpoint.",
            Exception::LoadMisaligned        => "Load address misaligned.",
            Exception::LoadFault             => "Load access fault.",
            Exception::StoreMisaligned       => "AMO address misaligned.",
            Exception::StoreFault            => "Store/AMO access fault.",
            Exception::UserEnvCall           => "Environment call.",
            Exception::SupervisorEnvCall     => "Environment call from S-mode.",
            Exception::InstructionPageFault  => "Instruction page fault.",
            Exception::LoadPageFault         => "Load page fault.",
            Exception::StorePageFault        => "Store/AMO page fault.",
            Exception::Reserved(_)           => "Reserved.",
        }
    }

    /// Страничная ошибка; на K210 сюда же относится load access fault.
    /// A page fault; on K210 a load access fault counts as well.
    pub fn is_page_fault(self) -> bool {
        match self {
            Exception::InstructionPageFault | Exception::LoadPageFault | Exception::StorePageFault => true,
            Exception::LoadFault => USE_SOFT_INT_COMP,
            _ => false,
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, Exception::StorePageFault | Exception::StoreFault)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Interrupt(Interrupt),
    Exception(Exception),
}

impl Trap {
    pub fn from_scause(scause: usize) -> Self {
        let code = scause & !INTERRUPT_BIT;
        if scause & INTERRUPT_BIT != 0 {
            Trap::Interrupt(match code {
                1 => Interrupt::SupervisorSoft,
                5 => Interrupt::SupervisorTimer,
                9 => Interrupt::SupervisorExternal,
                n => Interrupt::Other(n),
            })
        } else {
            Trap::Exception(Exception::from_code(code))
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trap::Interrupt(irq) => write!(f, "interrupt {:?}", irq),
            Trap::Exception(e) => f.write_str(e.description()),
        }
    }
}

/// CSR, прочитанные на входе в ловушку / CSRs read on trap entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapInfo {
    pub scause:  usize,
    pub stval:   usize,
    pub sepc:    usize,
    pub sstatus: usize,
}

impl TrapInfo {
    pub fn trap(&self) -> Trap {
        Trap::from_scause(self.scause)
    }
}

/// Что делать с процессом после ловушки / What to do with the process after a trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapOutcome {
    Resume,
    Terminate(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    User,
    Kernel,
}

// ── Interrupts ────────────────────────────────────────────────────────────────

pub fn handle_interrupt(kernel: &Kernel, cpu: &Cpu, irq: Interrupt, stval: usize, origin: Origin) {
    match irq {
        Interrupt::SupervisorTimer => timer::on_timer(kernel, cpu, origin),
        Interrupt::SupervisorExternal => external(kernel),
        Interrupt::SupervisorSoft if USE_SOFT_INT_COMP && stval == K210_EXTERNAL_STVAL => {
            external(kernel);
            arch::clear_soft_interrupt();
        }
        Interrupt::SupervisorSoft => arch::clear_soft_interrupt(),
        Interrupt::Other(code) => warn!(target: "trap", "unexpected interrupt {}", code),
    }
}

fn external(kernel: &Kernel) {
    let hart = arch::hart_id();
    if let Some(irq) = kernel.plic.claim(hart) {
        if !kernel.irqs.dispatch(irq) {
            warn!(target: "trap", "irq {} has no handler", irq);
        }
        kernel.plic.complete(hart, irq);
    }
}

/// Зарегистрировать обработчик и разрешить IRQ в контроллере.
/// Register a handler and enable the IRQ at the controller.
pub fn register_irq_handler(kernel: &Kernel, irq: u32, handler: IrqHandler) -> Result<()> {
    kernel.irqs.register(irq, handler)?;
    kernel.plic.enable(irq);
    Ok(())
}

pub fn unregister_irq_handler(kernel: &Kernel, irq: u32, handler: IrqHandler) -> Result<()> {
    kernel.irqs.unregister(irq, handler)
}

// ── Faults ────────────────────────────────────────────────────────────────────

fn resolve_fault(kernel: &Kernel, pid: Pid, va: usize, is_write: bool) -> bool {
    if va >= KERN_BASE {
        return false;
    }
    kernel
        .procs
        .lock(pid)
        .and_then(|mut p| {
            p.page_dir
                .as_mut()
                .map(|dir| dir.resolve_fault(&kernel.frames, VirtAddr::new(va), is_write))
        })
        .unwrap_or(false)
}

fn kill(kernel: &Kernel, cpu: &Cpu, pid: Pid, info: &TrapInfo) -> TrapOutcome {
    let (frame, name) = match kernel.procs.lock(pid) {
        Some(mut p) => {
            p.status.insert(ProcStatus::ERROR);
            (p.trap.frame, p.name)
        }
        None => (TrapFrame::zero(), Default::default()),
    };
    dump::dump_trap(cpu, info, &frame, Some(name.as_str()));
    error!(target: "trap", "killing pid {} ({})", pid, name.as_str());
    TrapOutcome::Terminate(-1)
}

/// Ловушка из пользовательского режима текущего процесса.
/// A trap from the current process's user mode.
pub fn handle_user_trap(kernel: &Kernel, cpu: &Cpu, info: &TrapInfo) -> TrapOutcome {
    let Some(pid) = cpu.current() else {
        panic!("user trap on hart {} without a process", arch::hart_id());
    };
    match info.trap() {
        Trap::Interrupt(irq) => {
            handle_interrupt(kernel, cpu, irq, info.stval, Origin::User);
            TrapOutcome::Resume
        }
        Trap::Exception(Exception::UserEnvCall) => {
            let Some(mut frame) = kernel.procs.lock(pid).map(|mut p| {
                p.trap.user_pc += 4;
                p.trap.frame
            }) else {
                panic!("syscall from vanished pid {}", pid);
            };
            arch::intr_on();
            kernel.syscalls.dispatch(kernel, pid, &mut frame);
            arch::intr_off();
            if let Some(mut p) = kernel.procs.lock(pid) {
                p.trap.frame.a0 = frame.a0;
            }
            TrapOutcome::Resume
        }
        Trap::Exception(e) if e.is_page_fault() && resolve_fault(kernel, pid, info.stval, e.is_write()) => {
            TrapOutcome::Resume
        }
        Trap::Exception(_) => kill(kernel, cpu, pid, info),
    }
}

/// Ловушка из режима ядра. Прерывания обслуживаются без вытеснения;
/// неразрешимое исключение останавливает харт.
/// A trap from kernel mode. Interrupts are served without preemption; an
/// unresolvable exception halts the hart.
pub fn handle_kernel_trap(kernel: &Kernel, cpu: &Cpu, frame: &TrapFrame, info: &TrapInfo) {
    match info.trap() {
        Trap::Interrupt(irq) => handle_interrupt(kernel, cpu, irq, info.stval, Origin::Kernel),
        Trap::Exception(e) if e.is_page_fault() => {
            let resolved = cpu
                .current()
                .is_some_and(|pid| resolve_fault(kernel, pid, info.stval, e.is_write()));
            if resolved {
                arch::enable_user_access();
            } else {
                dump::dump_trap(cpu, info, frame, None);
                panic!("unresolved kernel page fault at {:#x}", info.stval);
            }
        }
        Trap::Exception(e) => {
            dump::dump_trap(cpu, info, frame, None);
            panic!("kernel trap: {}", e.description());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scause_decoding() {
        assert_eq!(Trap::from_scause(INTERRUPT_BIT | 5), Trap::Interrupt(Interrupt::SupervisorTimer));
        assert_eq!(Trap::from_scause(INTERRUPT_BIT | 9), Trap::Interrupt(Interrupt::SupervisorExternal));
        assert_eq!(Trap::from_scause(INTERRUPT_BIT | 1), Trap::Interrupt(Interrupt::SupervisorSoft));
        assert_eq!(Trap::from_scause(INTERRUPT_BIT | 3), Trap::Interrupt(Interrupt::Other(3)));
        assert_eq!(Trap::from_scause(8), Trap::Exception(Exception::UserEnvCall));
        assert_eq!(Trap::from_scause(15), Trap::Exception(Exception::StorePageFault));
        assert_eq!(Trap::from_scause(14), Trap::Exception(Exception::Reserved(14)));
    }

    #[test]
    fn page_fault_classes() {
        assert!(Exception::LoadPageFault.is_page_fault());
        assert!(Exception::StorePageFault.is_write());
        assert!(!Exception::LoadPageFault.is_write());
        assert_eq!(Exception::LoadFault.is_page_fault(), USE_SOFT_INT_COMP);
        assert!(!Exception::IllegalInstruction.is_page_fault());
    }

    #[test]
    fn descriptions_follow_the_cause_table() {
        assert_eq!(Exception::from_code(2).description(), "Illegal instruction.");
        assert_eq!(Exception::from_code(13).description(), "Load page fault.");
        assert_eq!(Exception::from_code(10).description(), "Reserved.");
    }
}
