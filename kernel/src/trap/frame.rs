//! Saved register state

/// 31 регистр общего назначения в порядке соглашения о вызовах.
/// The 31 general registers in calling-convention order.
///
/// Смещения полей зашиты в `trap.asm`; порядок не менять.
/// Field offsets are baked into `trap.asm`; do not reorder.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub ra:  usize,
    pub sp:  usize,
    pub gp:  usize,
    pub tp:  usize,
    pub t0:  usize,
    pub t1:  usize,
    pub t2:  usize,
    pub s0:  usize,
    pub s1:  usize,
    pub a0:  usize,
    pub a1:  usize,
    pub a2:  usize,
    pub a3:  usize,
    pub a4:  usize,
    pub a5:  usize,
    pub a6:  usize,
    pub a7:  usize,
    pub s2:  usize,
    pub s3:  usize,
    pub s4:  usize,
    pub s5:  usize,
    pub s6:  usize,
    pub s7:  usize,
    pub s8:  usize,
    pub s9:  usize,
    pub s10: usize,
    pub s11: usize,
    pub t3:  usize,
    pub t4:  usize,
    pub t5:  usize,
    pub t6:  usize,
}

const NAMES: [&str; 31] = [
    "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5",
    "t6",
];

impl TrapFrame {
    pub const fn zero() -> Self {
        Self {
            ra: 0, sp: 0, gp: 0, tp: 0, t0: 0, t1: 0, t2: 0, s0: 0, s1: 0,
            a0: 0, a1: 0, a2: 0, a3: 0, a4: 0, a5: 0, a6: 0, a7: 0,
            s2: 0, s3: 0, s4: 0, s5: 0, s6: 0, s7: 0, s8: 0, s9: 0, s10: 0, s11: 0,
            t3: 0, t4: 0, t5: 0, t6: 0,
        }
    }

    /// Аргумент системного вызова `n` (a0–a5).
    /// System call argument `n` (a0–a5).
    pub fn arg(&self, n: usize) -> usize {
        match n {
            0 => self.a0,
            1 => self.a1,
            2 => self.a2,
            3 => self.a3,
            4 => self.a4,
            5 => self.a5,
            _ => panic!("syscall argument {} out of range", n),
        }
    }

    pub fn syscall_number(&self) -> usize {
        self.a7
    }

    pub fn set_return(&mut self, value: usize) {
        self.a0 = value;
    }

    /// Пары «имя — значение» для дампа.
    /// Name/value pairs for the register dump.
    pub fn named(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        let raw = self as *const Self as *const usize;
        NAMES
            .iter()
            .enumerate()
            .map(move |(i, &name)| (name, unsafe { *raw.add(i) }))
    }
}

/// Состояние, которое `__user_vector` находит через sscratch.
/// State that `__user_vector` reaches through sscratch.
///
/// Смещения: kernel_sp 0, user_pc 8, hart 16, frame 24.
/// Offsets: kernel_sp 0, user_pc 8, hart 16, frame 24.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapState {
    pub kernel_sp: usize,
    pub user_pc:   usize,
    pub hart:      usize,
    pub frame:     TrapFrame,
}

impl TrapState {
    pub const fn zero() -> Self {
        Self { kernel_sp: 0, user_pc: 0, hart: 0, frame: TrapFrame::zero() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn layout_matches_the_trap_vector() {
        assert_eq!(size_of::<TrapFrame>(), 31 * 8);
        assert_eq!(offset_of!(TrapFrame, a0), 9 * 8);
        assert_eq!(offset_of!(TrapFrame, a7), 16 * 8);
        assert_eq!(offset_of!(TrapFrame, s2), 17 * 8);
        assert_eq!(offset_of!(TrapFrame, t6), 30 * 8);
        assert_eq!(offset_of!(TrapState, user_pc), 8);
        assert_eq!(offset_of!(TrapState, hart), 16);
        assert_eq!(offset_of!(TrapState, frame), 24);
    }

    #[test]
    fn named_registers_follow_field_order() {
        let mut f = TrapFrame::zero();
        f.sp = 0x1000;
        f.a7 = 93;
        f.t6 = 6;
        let regs: Vec<_> = f.named().collect();
        assert_eq!(regs.len(), 31);
        assert_eq!(regs[1], ("sp", 0x1000));
        assert_eq!(regs[16], ("a7", 93));
        assert_eq!(regs[30], ("t6", 6));
        assert_eq!(f.syscall_number(), 93);
    }
}
