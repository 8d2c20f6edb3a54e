//! Exception dump
//!
//! Печать причины, sstatus и всех регистров. Дампы с разных хартов не
//! перемешиваются: их сериализует отдельная блокировка.
//! Prints the cause, sstatus and every register. Dumps from different harts
//! do not interleave: a dedicated lock serialises them.

use core::fmt;

use bitflags::bitflags;
use spin::Mutex;

use super::{TrapFrame, TrapInfo};
use crate::arch::current as arch;
use crate::config::KERN_BASE;
use crate::cpu::Cpu;

bitflags! {
    /// Биты sstatus / sstatus bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sstatus: usize {
        const SIE  = 1 << 1;
        const SPIE = 1 << 5;
        const UBE  = 1 << 6;
        const SPP  = 1 << 8;
        const SUM  = 1 << 18;
        const MXR  = 1 << 19;
        const SD   = 1 << 63;
    }
}

/// sstatus в виде `SIE|SPP    FS: 1, XS: 0, UXL: 2`.
/// sstatus rendered as `SIE|SPP    FS: 1, XS: 0, UXL: 2`.
pub struct SstatusDisplay(pub usize);

impl fmt::Display for SstatusDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = Sstatus::from_bits_truncate(self.0);
        for (i, (name, _)) in flags.iter_names().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            f.write_str(name)?;
        }
        let field = |shift: u32| (self.0 >> shift) & 0x3;
        write!(f, "    FS: {}, XS: {}, UXL: {}", field(13), field(15), field(32))
    }
}

static DUMP_LOCK: Mutex<()> = Mutex::new(());

/// Напечатать ловушку. `name` — имя процесса, если он есть.
/// Print a trap. `name` is the process name, when there is one.
pub fn dump_trap(cpu: &Cpu, info: &TrapInfo, frame: &TrapFrame, name: Option<&str>) {
    let _serial = DUMP_LOCK.lock();

    kprintln!("\n==================== hart {} ====================", arch::hart_id());
    kprintln!("Exception {}: {}", info.scause, info.trap());
    if let Some(pid) = cpu.current() {
        kprintln!("Happened in process [{}] {}", pid, name.unwrap_or("?"));
    }
    kprintln!("sstatus: {}", SstatusDisplay(info.sstatus));
    kprintln!("{:>7}: {:#018x}\t{:>7}: {:#018x}", "sepc", info.sepc, "stval", info.stval);
    for (i, (reg, value)) in frame.named().enumerate() {
        let end = if i % 2 == 1 { "\n" } else { "\t" };
        kprint!("{:>7}: {:#018x}{}", reg, value, end);
    }
    kprintln!();
    kprintln!("KERN_BASE: {:#x}", KERN_BASE);
    kprintln!("================================================\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn sstatus_names_and_fields() {
        let bits = Sstatus::SIE.bits() | Sstatus::SPP.bits() | Sstatus::SUM.bits() | (1 << 13) | (2 << 32);
        assert_eq!(format!("{}", SstatusDisplay(bits)), "SIE|SPP|SUM    FS: 1, XS: 0, UXL: 2");
        assert_eq!(format!("{}", SstatusDisplay(0)), "    FS: 0, XS: 0, UXL: 0");
    }

    #[test]
    fn dump_prints_without_a_process() {
        let info = TrapInfo { scause: 2, stval: 0, sepc: 0x8020_0000, sstatus: 0 };
        dump_trap(crate::cpu::this_cpu(), &info, &TrapFrame::zero(), None);
    }
}
