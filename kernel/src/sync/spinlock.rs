//! Spinlock with an owner hart
//!
//! Захват сначала поднимает глубину `push_off`, освобождение — опускает.
//! Acquire raises the `push_off` depth first; release lowers it last.
//! Повторный захват владельцем или освобождение чужим хартом — паника.
//! Re-acquire by the owner or release by another hart is fatal.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crate::cpu::{pop_off, push_off, this_cpu, Cpu};

pub struct SpinLock<T: ?Sized> {
    name:   &'static str,
    locked: AtomicBool,
    owner:  AtomicPtr<Cpu>,
    data:   UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

/// Держатель блокировки; освобождает её при `drop`.
/// Lock holder; releases on `drop`.
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    // Гард привязан к харту, на котором захвачен.
    _not_send: PhantomData<*const ()>,
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            owner:  AtomicPtr::new(ptr::null_mut()),
            data:   UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Захватить блокировку, крутясь до успеха.
    /// Acquire the lock, spinning until it is free.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        push_off();
        if self.holding() {
            panic!("spinlock {}: acquired twice on one hart", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        self.owner.store(current_cpu_ptr(), Ordering::Relaxed);
        SpinLockGuard { lock: self, _not_send: PhantomData }
    }

    /// Одна попытка захвата.
    /// Single acquisition attempt.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        push_off();
        if self.holding() {
            panic!("spinlock {}: acquired twice on one hart", self.name);
        }
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(current_cpu_ptr(), Ordering::Relaxed);
            Some(SpinLockGuard { lock: self, _not_send: PhantomData })
        } else {
            pop_off();
            None
        }
    }

    /// Держит ли блокировку текущий харт. Вызывать с запрещёнными прерываниями.
    /// Whether the current hart holds the lock. Call with interrupts off.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.owner.load(Ordering::Relaxed) == current_cpu_ptr()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Сырой указатель на данные в обход блокировки.
    /// Raw pointer to the data, bypassing the lock.
    pub fn data_ptr(&self) -> *mut T {
        self.data.get()
    }

    fn release(&self) {
        if !self.holding() {
            panic!("spinlock {}: released by a hart that does not own it", self.name);
        }
        self.owner.store(ptr::null_mut(), Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new("anon", T::default())
    }
}

fn current_cpu_ptr() -> *mut Cpu {
    this_cpu() as *const Cpu as *mut Cpu
}

impl<'a, T: ?Sized> SpinLockGuard<'a, T> {
    /// Блокировка, которой принадлежит гард (нужна `sleep`, чтобы перезахватить её).
    /// The lock this guard belongs to (`sleep` needs it to re-acquire).
    pub fn source(this: &Self) -> &'a SpinLock<T> {
        this.lock
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::current as arch;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn guard_gives_exclusive_access() {
        let lock = SpinLock::new("counter", 0u32);
        {
            let mut g = lock.lock();
            *g += 1;
            assert!(lock.holding());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn interrupts_stay_off_while_held_and_come_back() {
        arch::intr_on();
        let a = SpinLock::new("a", ());
        let b = SpinLock::new("b", ());
        let ga = a.lock();
        assert!(!arch::intr_get());
        let gb = b.lock();
        drop(ga);
        assert!(!arch::intr_get(), "still holding b");
        drop(gb);
        assert!(arch::intr_get());
    }

    #[test]
    fn release_keeps_interrupts_off_when_they_were_off() {
        arch::intr_off();
        let lock = SpinLock::new("quiet", ());
        drop(lock.lock());
        assert!(!arch::intr_get());
    }

    #[test]
    #[should_panic(expected = "acquired twice")]
    fn reacquire_on_same_hart_panics() {
        let lock = SpinLock::new("twice", ());
        let _g = lock.lock();
        let _again = lock.lock();
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = Arc::new(SpinLock::new("try", 5));
        let g = lock.lock();
        let other = Arc::clone(&lock);
        let got = thread::spawn(move || other.try_lock().is_some()).join().unwrap();
        assert!(!got);
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn harts_never_lose_increments() {
        const HARTS: usize = 4;
        const ROUNDS: usize = 10_000;
        let lock = Arc::new(SpinLock::new("shared", 0usize));
        let handles: Vec<_> = (0..HARTS)
            .map(|hart| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    arch::set_hart_id(hart);
                    arch::intr_on();
                    for _ in 0..ROUNDS {
                        let mut g = lock.lock();
                        let seen = *g;
                        core::hint::spin_loop();
                        *g = seen + 1;
                    }
                    assert!(arch::intr_get());
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), HARTS * ROUNDS);
    }
}
