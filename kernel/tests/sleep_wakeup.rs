//! sleep / wakeup, ticks and sleeplocks

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use corvid::arch::current as arch;
use corvid::cpu::this_cpu;
use corvid::proc::sleep::{sleep, wakeup};
use corvid::proc::{ProcStatus, WaitChannel};
use corvid::sync::{SleepLock, SpinLock};
use corvid::testing;
use corvid::trap::{self, timer};

#[test]
fn sleep_ticks_wakes_after_enough_ticks() {
    let kernel = testing::kernel();
    let pid = testing::spawn(kernel, "sleeper");
    testing::enter(kernel, pid);

    let switches = arch::switch_count();
    arch::set_switch_hook(move || timer::tick(kernel));
    trap::sleep_ticks(kernel, 3);
    arch::clear_switch_hook();

    assert_eq!(kernel.ticks.now(), 3);
    assert_eq!(arch::switch_count() - switches, 3);
    let p = kernel.procs.lock(pid).unwrap();
    assert!(!p.status.contains(ProcStatus::WAITING));
    assert_eq!(p.wait_chan, None);
    drop(p);
    testing::leave(kernel);
}

#[test]
fn sleep_reacquires_the_condition_lock() {
    let kernel = testing::kernel();
    let pid = testing::spawn(kernel, "waiter");
    testing::enter(kernel, pid);

    let flag: &'static SpinLock<bool> = Box::leak(Box::new(SpinLock::new("flag", false)));
    arch::set_switch_hook(move || {
        // Условие свободно, пока процесс спит.
        let mut set = flag.try_lock().expect("condition lock held across sleep");
        *set = true;
        drop(set);
        wakeup(kernel, WaitChannel::Custom(42));
    });

    let mut guard = flag.lock();
    while !*guard {
        guard = sleep(kernel, WaitChannel::Custom(42), guard);
    }
    assert!(flag.holding());
    drop(guard);
    arch::clear_switch_hook();
    assert_eq!(this_cpu().trap_depth(), 0);
    testing::leave(kernel);
}

#[test]
fn wakeup_only_touches_its_channel() {
    let kernel = testing::kernel();
    let a = testing::spawn(kernel, "a");
    let b = testing::spawn(kernel, "b");
    for (pid, chan) in [(a, WaitChannel::Pipe(1)), (b, WaitChannel::Pipe(2))] {
        let mut p = kernel.procs.lock(pid).unwrap();
        p.status.remove(ProcStatus::READY);
        p.status.insert(ProcStatus::WAITING);
        p.wait_chan = Some(chan);
    }

    assert_eq!(wakeup(kernel, WaitChannel::Pipe(1)), 1);
    assert_eq!(wakeup(kernel, WaitChannel::Disk(1)), 0);

    let pa = kernel.procs.lock(a).unwrap();
    assert!(pa.status.contains(ProcStatus::READY | ProcStatus::NORMAL));
    assert!(!pa.status.contains(ProcStatus::WAITING));
    drop(pa);
    assert!(kernel.procs.lock(b).unwrap().status.contains(ProcStatus::WAITING));
}

#[test]
fn a_contended_sleeplock_hands_over_on_release() {
    let kernel = testing::kernel();
    let owner = testing::spawn(kernel, "owner");
    let waiter = testing::spawn(kernel, "waiter");
    let lock: &'static SleepLock<u32> = Box::leak(Box::new(SleepLock::new("inode", 0)));

    testing::enter(kernel, owner);
    let mut held = lock.lock(kernel);
    *held += 1;
    assert!(lock.holding());
    testing::leave(kernel);

    // Владелец отпускает блокировку, пока ожидающий спит.
    let mut held = Some(held);
    arch::set_switch_hook(move || {
        assert!(kernel.procs.lock(waiter).unwrap().status.contains(ProcStatus::WAITING));
        held.take();
    });

    testing::enter(kernel, waiter);
    let switches = arch::switch_count();
    let mut guard = lock.lock(kernel);
    arch::clear_switch_hook();
    assert_eq!(arch::switch_count() - switches, 1);
    *guard += 1;
    assert_eq!(*guard, 2);
    assert!(lock.holding());
    drop(guard);
    assert!(!lock.is_locked());
    testing::leave(kernel);
}

#[test]
#[should_panic(expected = "re-acquired by its holder")]
fn a_sleeplock_is_not_reentrant() {
    let kernel = testing::kernel();
    let pid = testing::spawn(kernel, "p");
    let lock: &'static SleepLock<()> = Box::leak(Box::new(SleepLock::new("buf", ())));
    testing::enter(kernel, pid);
    let _first = lock.lock(kernel);
    let _second = lock.lock(kernel);
}

#[test]
fn spinlock_excludes_across_harts() {
    const HARTS: usize = 4;
    const ROUNDS: usize = 10_000;

    let counter = Arc::new(SpinLock::new("counter", 0usize));
    let inside = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..HARTS)
        .map(|hart| {
            let counter = Arc::clone(&counter);
            let inside = Arc::clone(&inside);
            thread::spawn(move || {
                arch::set_hart_id(hart);
                arch::intr_on();
                for _ in 0..ROUNDS {
                    let mut n = counter.lock();
                    assert!(!arch::intr_get());
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    *n += 1;
                    inside.fetch_sub(1, Ordering::SeqCst);
                }
                assert!(arch::intr_get());
                assert_eq!(this_cpu().trap_depth(), 0);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*counter.lock(), HARTS * ROUNDS);
}
