//! PLIC — Platform-Level Interrupt Controller
//!
//! Раскладка регистров / Register layout (offsets from the base):
//!   0x000000 + 4*irq                 приоритет / priority
//!   0x002000 + 0x80*ctx + 4*(irq/32) биты разрешения / enable bits
//!   0x200000 + 0x1000*ctx            порог / threshold
//!   0x200004 + 0x1000*ctx            claim / complete
//!
//! Контекст S-режима харта — `plic_context(hart)` из конфигурации.
//! A hart's S-mode context is `plic_context(hart)` from the configuration.

use core::ptr;

use log::info;

use crate::config::{plic_context, HART_COUNT};

const PRIORITY: usize = 0x0000;
const ENABLE: usize = 0x2000;
const ENABLE_STRIDE: usize = 0x80;
const CONTEXT: usize = 0x20_0000;
const CONTEXT_STRIDE: usize = 0x1000;
const THRESHOLD: usize = 0x0;
const CLAIM: usize = 0x4;

/// Контроллер внешних прерываний / External interrupt controller
pub trait InterruptController: Sync {
    /// Нулевой порог для S-контекста харта.
    /// Zero threshold for the hart's S-mode context.
    fn init_hart(&self, hart: usize);
    /// Приоритет 1 и разрешение `irq` на всех хартах.
    /// Priority 1 and `irq` enabled on every hart.
    fn enable(&self, irq: u32);
    fn claim(&self, hart: usize) -> Option<u32>;
    fn complete(&self, hart: usize, irq: u32);
}

pub struct Plic {
    base: usize,
}

impl Plic {
    /// `base` — виртуальный адрес окна PLIC.
    /// `base` is the virtual address of the PLIC window.
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    fn reg(&self, offset: usize) -> *mut u32 {
        (self.base + offset) as *mut u32
    }

    fn read(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.reg(offset)) }
    }

    fn write(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile(self.reg(offset), value) }
    }

    fn context_reg(hart: usize, reg: usize) -> usize {
        CONTEXT + plic_context(hart) * CONTEXT_STRIDE + reg
    }
}

impl InterruptController for Plic {
    fn init_hart(&self, hart: usize) {
        self.write(Self::context_reg(hart, THRESHOLD), 0);
    }

    fn enable(&self, irq: u32) {
        let irq = irq as usize;
        self.write(PRIORITY + irq * 4, 1);
        for hart in 0..HART_COUNT {
            let word = ENABLE + plic_context(hart) * ENABLE_STRIDE + (irq / 32) * 4;
            self.write(word, self.read(word) | 1 << (irq % 32));
        }
        info!(target: "trap", "plic: irq {} enabled", irq);
    }

    fn claim(&self, hart: usize) -> Option<u32> {
        match self.read(Self::context_reg(hart, CLAIM)) {
            0 => None,
            irq => Some(irq),
        }
    }

    fn complete(&self, hart: usize, irq: u32) {
        self.write(Self::context_reg(hart, CLAIM), irq);
    }
}
