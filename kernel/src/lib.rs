//! Corvid Kernel — ядро RISC-V 64 / RISC-V 64 kernel core
//!
//! Библиотека содержит всё ядро; `main.rs` только загружается на харте и
//! вызывает её. На хосте та же библиотека собирается со стандартной
//! библиотекой и симулированными хартами, чтобы гонять тесты.
//! The library holds the whole kernel; `main.rs` only boots a hart and calls
//! into it. On the host the same library builds against std with simulated
//! harts so the tests can run.

#![cfg_attr(target_os = "none", no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

// Box, Vec, Arc, ... из кучи ядра / from the kernel heap
extern crate alloc;

#[macro_use]
pub mod drivers;

pub mod arch;
pub mod config;
pub mod cpu;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod mm;
pub mod proc;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod trap;

#[cfg(not(target_os = "none"))]
pub mod testing;

pub use error::{KernelError, Result};
pub use kernel::Kernel;
