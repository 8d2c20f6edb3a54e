//! Process lifecycle: alloc, fork, exit, brk

use core::mem;

use log::{debug, info};

use super::exec::{exec, ProgramLoader};
use super::sleep::{wakeup, WaitChannel};
use super::{FileTable, Pid, ProcStatus, Process, ProgramImage, StackBounds};
use crate::arch::{current as arch, TaskContext};
use crate::config::{INIT_PID, KERNEL_STACK_PAGES, PAGE_SIZE, USER_STACK_BASE, USER_STACK_SIZE};
use crate::cpu::this_cpu;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::mm::pmm::{FrameAllocator, PageType};
use crate::mm::vmm::{PageDirectory, PageFlags, PageTableImpl};
use crate::mm::{page_round_down, page_round_up, PhysAddr, VirtAddr};
use crate::sched;
use crate::sync::SpinLockGuard;

/// Снять все отображённые листы в `start..end`, пропуская дыры.
/// Drop every mapped leaf in `start..end`, skipping holes.
pub(crate) fn unmap_present(dir: &mut PageDirectory, frames: &FrameAllocator, start: usize, end: usize) {
    let mut va = page_round_down(start);
    while va < end {
        if let Some((_, 0)) = dir.lookup(VirtAddr::new(va)) {
            dir.unmap(frames, VirtAddr::new(va), 1, true);
        }
        va += PAGE_SIZE;
    }
}

/// Освободить ресурсы ядра, оставшиеся в слоте, и вернуть pid в пул.
/// Release the kernel resources left in a slot and return the pid to the pool.
pub(crate) fn reclaim(kernel: &Kernel, pid: Pid, dir: Option<PageDirectory>, kernel_stack: Option<PhysAddr>) {
    if let Some(dir) = dir {
        dir.destroy(&kernel.frames);
    }
    if let Some(stack) = kernel_stack {
        kernel.frames.free(stack, KERNEL_STACK_PAGES);
    }
    kernel.procs.release(pid);
}

// ── Allocation ────────────────────────────────────────────────────────────────

/// Занять слот: стек ядра, каталог страниц, контекст возврата в пользователя.
/// Claim a slot: kernel stack, page directory, user-return context.
///
/// Процесс возвращается в состоянии NORMAL (ещё не готов) и захваченным.
/// The process comes back NORMAL (not yet ready) and locked.
pub fn alloc_process(kernel: &Kernel) -> Result<SpinLockGuard<'_, Process>> {
    let pid = kernel.procs.claim()?;

    let Some(kernel_stack) = kernel.frames.alloc(KERNEL_STACK_PAGES, PageType::SYSTEM) else {
        kernel.procs.release(pid);
        return Err(KernelError::OutOfMemory);
    };
    let dir = match kernel.space.new_directory(&kernel.frames) {
        Ok(dir) => dir,
        Err(err) => {
            reclaim(kernel, pid, None, Some(kernel_stack));
            return Err(err);
        }
    };

    let mut p = kernel.procs.slot(pid).lock();
    *p = Process::vacant();
    p.pid = pid;
    p.status = ProcStatus::NORMAL;
    p.kernel_stack = Some(kernel_stack);
    p.page_dir = Some(dir);
    p.context = TaskContext::new(arch::user_return_entry(), p.kernel_stack_top());
    debug!(target: "proc", "alloc pid {}", pid);
    Ok(p)
}

/// Бросить ещё не опубликованный процесс.
/// Discard a process that was never published.
fn discard(kernel: &Kernel, mut p: SpinLockGuard<'_, Process>) {
    let pid = p.pid;
    let image = p.image;
    let stack = p.stack;
    let mut dir = p.page_dir.take();
    let kernel_stack = p.kernel_stack.take();
    *p = Process::vacant();
    drop(p);
    if let Some(dir) = dir.as_mut() {
        unmap_present(dir, &kernel.frames, image.start, page_round_up(image.brk));
        unmap_present(dir, &kernel.frames, stack.low, stack.high);
    }
    reclaim(kernel, pid, dir, kernel_stack);
}

// ── Fork ──────────────────────────────────────────────────────────────────────

/// Копия родителя: образ и стек копируются сразу, файлы общие.
/// Copy of the parent: image and stack are copied eagerly, files are shared.
///
/// Ребёнок возвращает 0 из системного вызова; родителю отдаётся pid ребёнка.
/// The child returns 0 from the system call; the parent gets the child's pid.
pub fn fork_process(kernel: &Kernel, parent: Pid) -> Result<Pid> {
    let (image, stack, files, trap, name, parent_root) = {
        let p = kernel.procs.lock(parent).ok_or(KernelError::NoSuchProcess)?;
        let root = p.page_dir.as_ref().map(PageDirectory::root);
        (p.image, p.stack, p.files.clone(), p.trap, p.name, root)
    };
    let parent_root = parent_root.ok_or(KernelError::BadAddress)?;
    // Каталог родителя только читается; родитель сейчас в ядре и не меняет его.
    let parent_dir = unsafe { PageDirectory::from_root(parent_root) };

    let mut child = alloc_process(kernel)?;
    let child_pid = child.pid;
    child.image = image;
    child.stack = stack;
    let copied = match child.page_dir.as_mut() {
        Some(dir) => dir
            .copy_range(
                &parent_dir,
                &kernel.frames,
                VirtAddr::new(image.start),
                VirtAddr::new(page_round_up(image.brk)),
            )
            .and_then(|()| {
                dir.copy_range(
                    &parent_dir,
                    &kernel.frames,
                    VirtAddr::new(stack.low),
                    VirtAddr::new(stack.high),
                )
            }),
        None => Err(KernelError::BadAddress),
    };
    if let Err(err) = copied {
        discard(kernel, child);
        return Err(err);
    }

    child.files = files;
    child.trap = trap;
    child.trap.frame.set_return(0);
    child.name = name;
    child.parent = Some(parent);
    drop(child);

    match kernel.procs.lock(parent) {
        Some(mut p) => p.children.push(child_pid),
        None => panic!("fork: parent {} vanished", parent),
    }
    kernel.procs.slot(child_pid).lock().status.insert(ProcStatus::READY);
    info!(target: "proc", "fork {} -> {}", parent, child_pid);
    Ok(child_pid)
}

/// fork для текущего процесса; после создания ребёнка харт уступается.
/// fork for the current process; the hart is yielded once the child exists.
pub fn fork(kernel: &Kernel) -> Result<Pid> {
    let parent = this_cpu().current().ok_or(KernelError::NoSuchProcess)?;
    let child = fork_process(kernel, parent)?;
    sched::yield_now(kernel);
    Ok(child)
}

// ── Exit ──────────────────────────────────────────────────────────────────────

/// Завершить процесс: освободить память и файлы, передать детей родителю,
/// разбудить родителя. Слот остаётся зомби до `wait`.
/// Terminate a process: free memory and files, hand children to the parent,
/// wake the parent. The slot stays a zombie until `wait`.
pub fn exit_process(kernel: &Kernel, pid: Pid, code: i64) {
    if pid == INIT_PID {
        panic!("init exited with status {}", code);
    }

    let (parent, orphans, files) = {
        let Some(mut p) = kernel.procs.lock(pid) else {
            panic!("exit: no process {}", pid);
        };
        let image = p.image;
        let stack = p.stack;
        if let Some(dir) = p.page_dir.as_mut() {
            unmap_present(dir, &kernel.frames, image.start, page_round_up(image.brk));
            unmap_present(dir, &kernel.frames, stack.low, stack.high);
        }
        p.image = ProgramImage::empty();
        p.stack = StackBounds::default();
        p.exit_status = code;
        p.wait_chan = None;
        p.status = (p.status & (ProcStatus::RUNNING | ProcStatus::ERROR)) | ProcStatus::STOPPED;
        let files = mem::replace(&mut p.files, FileTable::new());
        (p.parent.unwrap_or(INIT_PID), mem::take(&mut p.children), files)
    };
    drop(files);

    reparent(kernel, &orphans, parent);
    info!(target: "proc", "pid {} exited with {}", pid, code);
    wakeup(kernel, WaitChannel::Child(parent));
}

fn reparent(kernel: &Kernel, orphans: &[Pid], parent: Pid) {
    if orphans.is_empty() {
        return;
    }
    for &orphan in orphans {
        if let Some(mut child) = kernel.procs.lock(orphan) {
            child.parent = Some(parent);
        }
    }
    match kernel.procs.lock(parent) {
        Some(mut p) => p.children.extend_from_slice(orphans),
        None => panic!("exit: new parent {} is gone", parent),
    }
}

/// Завершить текущий процесс и больше не возвращаться.
/// Terminate the current process and never come back.
pub fn exit(kernel: &Kernel, code: i64) -> ! {
    let Some(pid) = this_cpu().current() else {
        panic!("exit outside a process");
    };
    exit_process(kernel, pid, code);
    let context = kernel.procs.slot(pid).data_ptr();
    sched::switch_to_scheduler(unsafe { core::ptr::addr_of_mut!((*context).context) });
    panic!("pid {} resumed after exit", pid);
}

// ── Program break ─────────────────────────────────────────────────────────────

/// Сдвинуть конец образа. `addr == 0` только сообщает текущий break.
/// Move the end of the image. `addr == 0` only reports the current break.
/// The break may not reach past the bottom of the user stack.
pub fn brk(kernel: &Kernel, pid: Pid, addr: usize) -> Result<usize> {
    let mut p = kernel.procs.lock(pid).ok_or(KernelError::NoSuchProcess)?;
    let image = p.image;
    if addr == 0 {
        return Ok(image.brk);
    }
    // Куча растёт не выше нижнего края стека.
    let ceiling = if p.stack.low != 0 { p.stack.low } else { USER_STACK_BASE - USER_STACK_SIZE };
    if addr < image.start || addr > ceiling {
        return Err(KernelError::InvalidArgument);
    }

    let old_end = page_round_up(image.brk);
    let new_end = page_round_up(addr);
    let dir = p.page_dir.as_mut().ok_or(KernelError::BadAddress)?;
    if new_end > old_end {
        let mut va = old_end;
        while va < new_end {
            if let Err(err) = map_zeroed(dir, &kernel.frames, va) {
                unmap_present(dir, &kernel.frames, old_end, va);
                return Err(err);
            }
            va += PAGE_SIZE;
        }
    } else if new_end < old_end {
        unmap_present(dir, &kernel.frames, new_end, old_end);
    }

    p.image.brk = addr;
    p.image.size = addr - image.start;
    debug!(target: "proc", "pid {} brk {:#x} -> {:#x}", pid, image.brk, addr);
    Ok(addr)
}

fn map_zeroed(dir: &mut PageDirectory, frames: &FrameAllocator, va: usize) -> Result<()> {
    let frame = frames
        .alloc_zeroed(1, PageType::USER)
        .ok_or(KernelError::OutOfMemory)?;
    dir.map(frames, VirtAddr::new(va), frame, PAGE_SIZE, PageFlags::RW | PageFlags::USER)
        .inspect_err(|_| frames.free(frame, 1))
}

// ── Init ──────────────────────────────────────────────────────────────────────

/// Создать pid 1 и загрузить в него программу.
/// Create pid 1 and load a program into it.
pub fn setup_init(kernel: &Kernel, loader: &mut dyn ProgramLoader) -> Result<Pid> {
    let pid = {
        let mut p = alloc_process(kernel)?;
        p.name.set("init");
        p.pid
    };
    assert_eq!(pid, INIT_PID, "init must be the first process");
    exec(kernel, pid, loader, &["init"], &[])?;
    info!(target: "proc", "init is pid {}", pid);
    Ok(pid)
}
