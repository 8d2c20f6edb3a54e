//! User and kernel traps through the dispatcher

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::thread;

use corvid::arch::current as arch;
use corvid::config::{KERN_BASE, PAGE_SIZE, USER_IMAGE_BASE};
use corvid::cpu::this_cpu;
use corvid::mm::vmm::{PageFlags, PageTableImpl};
use corvid::mm::VirtAddr;
use corvid::proc::{self, ProcStatus, WaitChannel, WaitTarget};
use corvid::syscall::{ENOSYS, SYS_GETPID, SYS_TICKS};
use corvid::testing::{self, FakePlic};
use corvid::trap::{self, TrapFrame, TrapInfo, TrapOutcome};
use corvid::KernelError;

const INTERRUPT: usize = 1 << 63;

fn info(scause: usize, stval: usize) -> TrapInfo {
    TrapInfo { scause, stval, sepc: 0, sstatus: 0 }
}

#[test]
fn ecall_dispatches_and_steps_over_the_instruction() {
    let kernel = testing::kernel();
    let pid = testing::spawn(kernel, "caller");
    testing::enter(kernel, pid);

    kernel.procs.lock(pid).unwrap().trap.frame.a7 = SYS_GETPID;
    assert_eq!(trap::handle_user_trap(kernel, this_cpu(), &info(8, 0)), TrapOutcome::Resume);
    {
        let p = kernel.procs.lock(pid).unwrap();
        assert_eq!(p.trap.frame.a0, pid);
        assert_eq!(p.trap.user_pc, USER_IMAGE_BASE + 4);
    }

    kernel.procs.lock(pid).unwrap().trap.frame.a7 = 4242;
    trap::handle_user_trap(kernel, this_cpu(), &info(8, 0));
    assert_eq!(kernel.procs.lock(pid).unwrap().trap.frame.a0 as isize, ENOSYS);
    assert!(!arch::intr_get());
    testing::leave(kernel);
}

#[test]
fn faults_on_mapped_user_pages_resume() {
    let kernel = testing::kernel();
    let pid = testing::spawn(kernel, "p");
    testing::enter(kernel, pid);

    let load_page_fault = 13;
    let store_page_fault = 15;
    let outcome = trap::handle_user_trap(kernel, this_cpu(), &info(load_page_fault, USER_IMAGE_BASE + 8));
    assert_eq!(outcome, TrapOutcome::Resume);
    let outcome = trap::handle_user_trap(kernel, this_cpu(), &info(store_page_fault, USER_IMAGE_BASE));
    assert_eq!(outcome, TrapOutcome::Resume);
    testing::leave(kernel);
}

#[test]
fn bad_accesses_kill_the_process() {
    let kernel = testing::kernel();
    let pid = testing::spawn(kernel, "victim");
    testing::enter(kernel, pid);

    let cpu = this_cpu();
    assert_eq!(trap::handle_user_trap(kernel, cpu, &info(13, 0x4000_0000)), TrapOutcome::Terminate(-1));
    assert_eq!(trap::handle_user_trap(kernel, cpu, &info(15, KERN_BASE)), TrapOutcome::Terminate(-1));
    assert_eq!(trap::handle_user_trap(kernel, cpu, &info(2, 0)), TrapOutcome::Terminate(-1));
    testing::leave(kernel);
}

#[test]
fn a_killed_process_is_marked_and_still_reaped() {
    let kernel = testing::kernel();
    let _init = testing::spawn(kernel, "init");
    let parent = testing::spawn(kernel, "parent");
    let child = proc::fork_process(kernel, parent).unwrap();
    testing::enter(kernel, child);

    let illegal_instruction = 2;
    let outcome = trap::handle_user_trap(kernel, this_cpu(), &info(illegal_instruction, 0));
    assert_eq!(outcome, TrapOutcome::Terminate(-1));
    assert!(kernel.procs.lock(child).unwrap().status.contains(ProcStatus::ERROR));

    proc::exit_process(kernel, child, -1);
    let status = kernel.procs.lock(child).unwrap().status;
    assert_eq!(status, ProcStatus::RUNNING | ProcStatus::STOPPED | ProcStatus::ERROR);
    testing::leave(kernel);

    this_cpu().set_current(Some(parent));
    assert_eq!(proc::wait(kernel, WaitTarget::Pid(child), true), Ok(Some((child, -1))));
    this_cpu().set_current(None);
}

#[test]
fn write_faults_on_shared_pages_get_a_private_copy() {
    let kernel = testing::kernel();
    let pid = testing::spawn(kernel, "writer");
    let page = USER_IMAGE_BASE;
    let shared = {
        let mut p = kernel.procs.lock(pid).unwrap();
        let dir = p.page_dir.as_mut().unwrap();
        let (pte, _) = dir.lookup(VirtAddr::new(page)).unwrap();
        let frame = pte.addr();
        dir.unmap(&kernel.frames, VirtAddr::new(page), 1, false);
        kernel.frames.ref_inc(frame);
        kernel.frames.ref_inc(frame);
        dir.map(&kernel.frames, VirtAddr::new(page), frame, PAGE_SIZE, PageFlags::RX | PageFlags::USER)
            .unwrap();
        frame
    };
    testing::enter(kernel, pid);

    let store_page_fault = 15;
    let outcome = trap::handle_user_trap(kernel, this_cpu(), &info(store_page_fault, page + 4));
    assert_eq!(outcome, TrapOutcome::Resume);
    let p = kernel.procs.lock(pid).unwrap();
    let (pte, _) = p.page_dir.as_ref().unwrap().lookup(VirtAddr::new(page)).unwrap();
    assert_ne!(pte.addr(), shared);
    assert!(pte.flags().contains(PageFlags::WRITE | PageFlags::USER));
    assert_eq!(kernel.frames.page_info(shared).unwrap().refs, 1);
    drop(p);
    testing::leave(kernel);
}

#[test]
fn timer_ticks_on_hart_zero_and_preempts_user_code() {
    let kernel = testing::kernel();
    let pid = testing::spawn(kernel, "spinner");
    let sleeper = testing::spawn(kernel, "sleeper");
    {
        let mut p = kernel.procs.lock(sleeper).unwrap();
        p.status.remove(ProcStatus::READY);
        p.status.insert(ProcStatus::WAITING);
        p.wait_chan = Some(WaitChannel::Tick);
    }
    testing::enter(kernel, pid);

    let armed = arch::timer_armed_count();
    let switches = arch::switch_count();
    let timer = info(INTERRUPT | 5, 0);
    assert_eq!(trap::handle_user_trap(kernel, this_cpu(), &timer), TrapOutcome::Resume);

    assert_eq!(kernel.ticks.now(), 1);
    assert_eq!(arch::timer_armed_count() - armed, 1);
    assert_eq!(arch::switch_count() - switches, 1);
    assert!(kernel.procs.lock(pid).unwrap().status.contains(ProcStatus::READY));
    assert!(kernel.procs.lock(sleeper).unwrap().is_runnable());

    kernel.procs.lock(pid).unwrap().trap.frame.a7 = SYS_TICKS;
    trap::handle_user_trap(kernel, this_cpu(), &info(8, 0));
    assert_eq!(kernel.procs.lock(pid).unwrap().trap.frame.a0, 1);
    testing::leave(kernel);
}

#[test]
fn other_harts_rearm_without_ticking() {
    let kernel = testing::kernel();
    thread::spawn(move || {
        arch::set_hart_id(1);
        let frame = TrapFrame::zero();
        trap::handle_kernel_trap(kernel, this_cpu(), &frame, &info(INTERRUPT | 5, 0));
        assert_eq!(arch::timer_armed_count(), 1);
        assert_eq!(arch::switch_count(), 0);
    })
    .join()
    .unwrap();
    assert_eq!(kernel.ticks.now(), 0);
}

static LAST_IRQ: AtomicU32 = AtomicU32::new(0);
static UART_HITS: AtomicUsize = AtomicUsize::new(0);

fn uart_handler(irq: u32) {
    LAST_IRQ.store(irq, Ordering::SeqCst);
    UART_HITS.fetch_add(1, Ordering::SeqCst);
}

fn other_handler(_irq: u32) {}

#[test]
fn external_interrupts_reach_their_handler_and_complete() {
    let plic: &'static FakePlic = Box::leak(Box::default());
    let kernel = testing::kernel_with(plic);

    trap::register_irq_handler(kernel, 10, uart_handler).unwrap();
    assert_eq!(plic.enabled(), [10]);
    assert_eq!(trap::register_irq_handler(kernel, 10, other_handler), Err(KernelError::AlreadyRegistered));
    assert_eq!(trap::register_irq_handler(kernel, 0, other_handler), Err(KernelError::InvalidIrq));

    let frame = TrapFrame::zero();
    let external = info(INTERRUPT | 9, 0);
    plic.raise(10);
    trap::handle_kernel_trap(kernel, this_cpu(), &frame, &external);
    assert_eq!(LAST_IRQ.load(Ordering::SeqCst), 10);
    assert_eq!(UART_HITS.load(Ordering::SeqCst), 1);

    // Без обработчика IRQ всё равно завершается в контроллере.
    plic.raise(11);
    trap::handle_kernel_trap(kernel, this_cpu(), &frame, &external);
    assert_eq!(UART_HITS.load(Ordering::SeqCst), 1);
    assert_eq!(plic.completed(), [(0, 10), (0, 11)]);

    trap::unregister_irq_handler(kernel, 10, uart_handler).unwrap();
    plic.raise(10);
    trap::handle_kernel_trap(kernel, this_cpu(), &frame, &external);
    assert_eq!(UART_HITS.load(Ordering::SeqCst), 1);
}

#[test]
#[should_panic(expected = "unresolved kernel page fault")]
fn an_unresolved_kernel_fault_is_fatal() {
    let kernel = testing::kernel();
    let frame = TrapFrame::zero();
    trap::handle_kernel_trap(kernel, this_cpu(), &frame, &info(13, 0x1234_5000));
}
