//! Synchronization primitives
//!
//!   spinlock  — атомарный флаг + владелец-харт, держится с запрещёнными прерываниями
//!               atomic flag + owner hart, held with interrupts off
//!   sleeplock — блокировка, которую можно держать через `sleep`
//!               a lock that may be held across `sleep`
//!   sleep / wakeup живут в `proc::sleep`, потому что трогают таблицу процессов.
//!   sleep / wakeup live in `proc::sleep` since they touch the process table.

pub mod sleeplock;
pub mod spinlock;

pub use crate::proc::sleep::{sleep, wakeup, WaitChannel};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
