//! External interrupt handler table

use log::debug;

use crate::config::MAX_IRQ;
use crate::error::{KernelError, Result};
use crate::sync::SpinLock;

/// Обработчик внешнего прерывания; получает номер IRQ.
/// External interrupt handler; receives the IRQ number.
pub type IrqHandler = fn(irq: u32);

pub struct IrqTable {
    handlers: SpinLock<[Option<IrqHandler>; MAX_IRQ]>,
}

fn validate(irq: u32) -> Result<usize> {
    match irq as usize {
        0 => Err(KernelError::InvalidIrq),
        n if n >= MAX_IRQ => Err(KernelError::InvalidIrq),
        n => Ok(n),
    }
}

fn same(a: IrqHandler, b: IrqHandler) -> bool {
    a as *const () as usize == b as *const () as usize
}

impl IrqTable {
    pub const fn new() -> Self {
        Self { handlers: SpinLock::new("irq_table", [None; MAX_IRQ]) }
    }

    /// Повторная регистрация того же обработчика — успех без изменений.
    /// Registering the same handler again succeeds without change.
    pub fn register(&self, irq: u32, handler: IrqHandler) -> Result<()> {
        let index = validate(irq)?;
        let mut handlers = self.handlers.lock();
        match handlers[index] {
            None => {
                handlers[index] = Some(handler);
                debug!(target: "trap", "irq {} registered", irq);
                Ok(())
            }
            Some(existing) if same(existing, handler) => Ok(()),
            Some(_) => Err(KernelError::AlreadyRegistered),
        }
    }

    /// Снять обработчик. Пустой слот — успех; чужой обработчик не трогается.
    /// Remove a handler. An empty slot succeeds; someone else's handler stays.
    pub fn unregister(&self, irq: u32, handler: IrqHandler) -> Result<()> {
        let index = validate(irq)?;
        let mut handlers = self.handlers.lock();
        match handlers[index] {
            None => Ok(()),
            Some(existing) if same(existing, handler) => {
                handlers[index] = None;
                debug!(target: "trap", "irq {} unregistered", irq);
                Ok(())
            }
            Some(_) => Err(KernelError::NotRegistered),
        }
    }

    pub fn is_registered(&self, irq: u32) -> bool {
        validate(irq).is_ok_and(|index| self.handlers.lock()[index].is_some())
    }

    /// Вызвать обработчик вне блокировки таблицы. `false`, если его нет.
    /// Call the handler outside the table lock. `false` when there is none.
    pub fn dispatch(&self, irq: u32) -> bool {
        let Ok(index) = validate(irq) else {
            return false;
        };
        let handler = self.handlers.lock()[index];
        match handler {
            Some(handler) => {
                handler(irq);
                true
            }
            None => false,
        }
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}
