//! Kernel error type
//!
//! Исчерпание ресурсов возвращается как `Err`, нарушение инвариантов — `panic!`.
//! Resource exhaustion is returned as `Err`; invariant violations `panic!`.

use core::fmt;

/// Ошибки ядра / Kernel errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    OutOfMemory,
    NoProcessSlot,
    NoSuchProcess,
    NoChildren,
    InvalidIrq,
    AlreadyRegistered,
    NotRegistered,
    BadAddress,
    MapFailed,
    LoadFailed,
    InvalidArgument,
}

impl KernelError {
    /// Отрицательный errno для пользовательского пространства.
    /// Negative errno handed back to user space.
    pub const fn errno(self) -> isize {
        match self {
            KernelError::OutOfMemory       => -12, // ENOMEM
            KernelError::NoProcessSlot     => -11, // EAGAIN
            KernelError::NoSuchProcess     => -3,  // ESRCH
            KernelError::NoChildren        => -10, // ECHILD
            KernelError::InvalidIrq        => -22, // EINVAL
            KernelError::AlreadyRegistered => -16, // EBUSY
            KernelError::NotRegistered     => -2,  // ENOENT
            KernelError::BadAddress        => -14, // EFAULT
            KernelError::MapFailed         => -12, // ENOMEM
            KernelError::LoadFailed        => -8,  // ENOEXEC
            KernelError::InvalidArgument   => -22, // EINVAL
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfMemory       => "out of memory",
            KernelError::NoProcessSlot     => "process table full",
            KernelError::NoSuchProcess     => "no such process",
            KernelError::NoChildren        => "no children to wait for",
            KernelError::InvalidIrq        => "invalid irq number",
            KernelError::AlreadyRegistered => "irq already has a different handler",
            KernelError::NotRegistered     => "irq handler not registered",
            KernelError::BadAddress        => "bad address",
            KernelError::MapFailed         => "mapping failed",
            KernelError::LoadFailed        => "program load failed",
            KernelError::InvalidArgument   => "invalid argument",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, KernelError>;
