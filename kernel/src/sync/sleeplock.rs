//! Sleeplock
//!
//! Занятая блокировка не крутится, а усыпляет процесс на канале
//! `WaitChannel::SleepLock(адрес)`. Её можно держать через `sleep`, но не
//! в обработчике прерывания.
//! A contended lock does not spin: it puts the process to sleep on
//! `WaitChannel::SleepLock(address)`. It may be held across `sleep`, never
//! inside an interrupt handler.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::spinlock::SpinLock;
use crate::cpu::this_cpu;
use crate::kernel::Kernel;
use crate::proc::sleep::{sleep, wakeup, WaitChannel};
use crate::proc::Pid;

#[derive(Debug, Clone, Copy, Default)]
struct Holder {
    locked: bool,
    pid:    Option<Pid>,
}

pub struct SleepLock<T: ?Sized> {
    state: SpinLock<Holder>,
    data:  UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for SleepLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

pub struct SleepLockGuard<'a, T: ?Sized> {
    lock:   &'a SleepLock<T>,
    kernel: &'a Kernel,
}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            state: SpinLock::new(name, Holder { locked: false, pid: None }),
            data:  UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SleepLock<T> {
    fn channel(&self) -> WaitChannel {
        WaitChannel::SleepLock(self as *const Self as *const u8 as usize)
    }

    /// Захватить, засыпая, пока блокировка занята. Повторный захват тем же
    /// процессом — фатальная ошибка.
    /// Acquire, sleeping while the lock is taken. Re-acquiring from the same
    /// process is fatal.
    pub fn lock<'a>(&'a self, kernel: &'a Kernel) -> SleepLockGuard<'a, T> {
        let me = this_cpu().current();
        let mut state = self.state.lock();
        while state.locked {
            if me.is_some() && state.pid == me {
                panic!("sleeplock {}: re-acquired by its holder", self.state.name());
            }
            state = sleep(kernel, self.channel(), state);
        }
        state.locked = true;
        state.pid = me;
        SleepLockGuard { lock: self, kernel }
    }

    pub fn try_lock<'a>(&'a self, kernel: &'a Kernel) -> Option<SleepLockGuard<'a, T>> {
        let mut state = self.state.lock();
        if state.locked {
            return None;
        }
        state.locked = true;
        state.pid = this_cpu().current();
        Some(SleepLockGuard { lock: self, kernel })
    }

    /// Держит ли блокировку текущий процесс.
    /// Whether the current process holds the lock.
    pub fn holding(&self) -> bool {
        let state = self.state.lock();
        state.locked && state.pid == this_cpu().current()
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }
}

impl<T: ?Sized> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        {
            let mut state = self.lock.state.lock();
            state.locked = false;
            state.pid = None;
        }
        wakeup(self.kernel, self.lock.channel());
    }
}
