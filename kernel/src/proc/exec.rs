//! exec: replace a process image
//!
//! Формат программы — забота загрузчика ([`ProgramLoader`]): ядро даёт ему
//! пустой каталог и собирает стек с аргументами.
//! The program format belongs to the loader ([`ProgramLoader`]): the kernel
//! hands it an empty directory and builds the argument stack.
//!
//! Стек после exec, от младших адресов к старшим:
//! Stack after exec, low addresses first:
//!
//! ```text
//!   sp →  argc
//!         argv  ─┐
//!         envp  ─┼─┐
//!         argv[0..argc], NULL   ◄┘ │
//!         envp[0..envc], NULL   ◄──┘
//!         строки / strings
//!         USER_STACK_BASE
//! ```

use core::ptr;

use log::{debug, info, warn};

use super::lifecycle::unmap_present;
use super::{Pid, ProcStatus, ProgramImage, StackBounds};
use crate::config::{PAGE_SIZE, USER_STACK_BASE, USER_STACK_SIZE};
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::mm::pmm::{FrameAllocator, PageType};
use crate::mm::vmm::{PageDirectory, PageFlags, PageTableImpl};
use crate::mm::{page_round_down, page_round_up, PhysAddr, VirtAddr};
use crate::trap::TrapFrame;

/// Загрузчик формата программы / Program format loader
pub trait ProgramLoader {
    /// Разложить сегменты через `target` и назначить точку входа.
    /// Lay out segments through `target` and set the entry point.
    fn load(&mut self, target: &mut LoadTarget<'_>) -> Result<()>;
}

/// Адресное пространство, в которое загружается программа.
/// The address space a program is being loaded into.
pub struct LoadTarget<'a> {
    frames: &'a FrameAllocator,
    dir:    &'a mut PageDirectory,
    image:  ProgramImage,
}

impl<'a> LoadTarget<'a> {
    pub fn new(frames: &'a FrameAllocator, dir: &'a mut PageDirectory) -> Self {
        Self { frames, dir, image: ProgramImage::empty() }
    }

    pub fn image(&self) -> &ProgramImage {
        &self.image
    }

    pub fn set_entry(&mut self, entry: usize) {
        self.image.entry = entry;
    }

    /// Поднять break выше последнего сегмента (например, под .bss без данных).
    /// Raise the break above the last segment (e.g. for a data-less .bss).
    pub fn set_break(&mut self, brk: usize) {
        if brk > self.image.brk {
            self.image.brk = brk;
            self.image.size = brk - self.image.start;
        }
    }

    pub fn page_directory(&mut self) -> &mut PageDirectory {
        self.dir
    }

    /// Отобразить сегмент `va..va+mem_size` и скопировать в его начало `data`.
    /// Хвост за `data` остаётся нулевым. Страницы, уже занятые соседним
    /// сегментом, используются повторно.
    /// Map the segment `va..va+mem_size` and copy `data` to its start. The tail
    /// past `data` stays zeroed. Pages already taken by a neighbouring segment
    /// are reused.
    pub fn map_segment(&mut self, va: VirtAddr, data: &[u8], mem_size: usize, flags: PageFlags) -> Result<()> {
        if data.len() > mem_size || va.as_usize().checked_add(mem_size).is_none() {
            return Err(KernelError::InvalidArgument);
        }
        let start = va.as_usize();
        let end = start + mem_size;
        if end > USER_STACK_BASE - USER_STACK_SIZE {
            return Err(KernelError::BadAddress);
        }

        let mut page = page_round_down(start);
        while page < end {
            let at = VirtAddr::new(page);
            match self.dir.lookup(at) {
                None => {
                    let frame = self
                        .frames
                        .alloc_zeroed(1, PageType::USER)
                        .ok_or(KernelError::OutOfMemory)?;
                    if let Err(err) = self.dir.map(self.frames, at, frame, PAGE_SIZE, flags | PageFlags::USER) {
                        self.frames.free(frame, 1);
                        return Err(err);
                    }
                }
                Some((pte, 0)) if pte.flags().contains(PageFlags::USER) => {}
                Some(_) => return Err(KernelError::BadAddress),
            }
            page += PAGE_SIZE;
        }

        let mut copied = 0;
        while copied < data.len() {
            let at = VirtAddr::new(start + copied);
            let chunk = (PAGE_SIZE - at.page_offset()).min(data.len() - copied);
            let pa = self
                .dir
                .user_translate(at, PageFlags::empty())
                .ok_or(KernelError::MapFailed)?;
            unsafe {
                ptr::copy_nonoverlapping(data[copied..].as_ptr(), pa.as_mut_ptr::<u8>(), chunk);
            }
            copied += chunk;
        }

        let image = &mut self.image;
        if image.brk == 0 {
            image.start = page_round_down(start);
        } else {
            image.start = image.start.min(page_round_down(start));
        }
        image.brk = image.brk.max(end);
        image.size = image.brk - image.start;
        debug!(target: "exec", "segment {:#x}..{:#x} {:?}", start, end, flags);
        Ok(())
    }
}

/// Плоский образ: код копируется как есть по `base`, вход — `base`.
/// A flat image: the code is copied verbatim at `base`, entry is `base`.
pub struct FlatBinary<'a> {
    base: usize,
    code: &'a [u8],
}

impl<'a> FlatBinary<'a> {
    pub const fn new(base: usize, code: &'a [u8]) -> Self {
        Self { base, code }
    }
}

impl ProgramLoader for FlatBinary<'_> {
    fn load(&mut self, target: &mut LoadTarget<'_>) -> Result<()> {
        if self.code.is_empty() {
            return Err(KernelError::LoadFailed);
        }
        target.map_segment(VirtAddr::new(self.base), self.code, self.code.len(), PageFlags::RWX)?;
        target.set_entry(self.base);
        Ok(())
    }
}

// ── Argument stack ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StackLayout {
    sp:   usize,
    argc: usize,
    argv: usize,
    envp: usize,
}

/// Собрать стек в кадрах `stack` (от нижнего края), адреса — пользовательские.
/// Build the stack inside the frames at `stack` (from the low end); the
/// addresses written are user addresses.
fn build_stack(stack: PhysAddr, argv: &[&str], envp: &[&str]) -> Result<StackLayout> {
    let low_va = USER_STACK_BASE - USER_STACK_SIZE;
    let base = stack.as_usize();
    let too_long = KernelError::InvalidArgument;

    let mut top = USER_STACK_SIZE;
    let mut push_strings = |strings: &[&str], out: &mut alloc::vec::Vec<usize>| -> Result<()> {
        for s in strings {
            top = top.checked_sub(s.len() + 1).ok_or(too_long)?;
            unsafe {
                ptr::copy_nonoverlapping(s.as_ptr(), (base + top) as *mut u8, s.len());
                *((base + top + s.len()) as *mut u8) = 0;
            }
            out.push(low_va + top);
        }
        Ok(())
    };
    let mut env_ptrs = alloc::vec::Vec::with_capacity(envp.len());
    let mut arg_ptrs = alloc::vec::Vec::with_capacity(argv.len());
    push_strings(envp, &mut env_ptrs)?;
    push_strings(argv, &mut arg_ptrs)?;

    let top = top & !7;
    let env_table = top.checked_sub((envp.len() + 1) * 8).ok_or(too_long)?;
    let arg_table = env_table.checked_sub((argv.len() + 1) * 8).ok_or(too_long)?;
    let sp = arg_table.checked_sub(3 * 8).ok_or(too_long)? & !15;
    // Половина стека остаётся программе.
    if sp < USER_STACK_SIZE / 2 {
        return Err(too_long);
    }

    let write = |offset: usize, value: usize| unsafe { ((base + offset) as *mut usize).write(value) };
    for (i, &p) in arg_ptrs.iter().chain(core::iter::once(&0)).enumerate() {
        write(arg_table + i * 8, p);
    }
    for (i, &p) in env_ptrs.iter().chain(core::iter::once(&0)).enumerate() {
        write(env_table + i * 8, p);
    }
    write(sp, argv.len());
    write(sp + 8, low_va + arg_table);
    write(sp + 16, low_va + env_table);

    Ok(StackLayout {
        sp:   low_va + sp,
        argc: argv.len(),
        argv: low_va + arg_table,
        envp: low_va + env_table,
    })
}

// ── exec ──────────────────────────────────────────────────────────────────────

/// Заменить образ процесса `pid` программой из `loader`. Возвращает argc,
/// который вызывающий кладёт в a0.
/// Replace the image of `pid` with the program from `loader`. Returns argc,
/// which the caller places in a0.
///
/// При ошибке загрузчика старый образ уже снят: процесс должен завершиться.
/// On a loader error the old image is already gone: the process must exit.
pub fn exec(
    kernel: &Kernel,
    pid: Pid,
    loader: &mut dyn ProgramLoader,
    argv: &[&str],
    envp: &[&str],
) -> Result<usize> {
    let frames = &kernel.frames;
    let stack_pages = USER_STACK_SIZE / PAGE_SIZE;
    let stack = frames
        .alloc_zeroed(stack_pages, PageType::USER)
        .ok_or(KernelError::OutOfMemory)?;
    let layout = match build_stack(stack, argv, envp) {
        Ok(layout) => layout,
        Err(err) => {
            frames.free(stack, stack_pages);
            return Err(err);
        }
    };

    // Каталог вынимается из слота на время загрузки: загрузчик может спать.
    let (mut dir, old_image, old_stack) = {
        let mut p = kernel.procs.lock(pid).ok_or(KernelError::NoSuchProcess)?;
        match p.page_dir.take() {
            Some(dir) => (dir, p.image, p.stack),
            None => {
                drop(p);
                frames.free(stack, stack_pages);
                return Err(KernelError::BadAddress);
            }
        }
    };
    unmap_present(&mut dir, frames, old_image.start, page_round_up(old_image.brk));
    unmap_present(&mut dir, frames, old_stack.low, old_stack.high);

    let bounds = StackBounds { low: USER_STACK_BASE - USER_STACK_SIZE, high: USER_STACK_BASE };
    let mapped = dir.map(frames, VirtAddr::new(bounds.low), stack, USER_STACK_SIZE, PageFlags::RW | PageFlags::USER);
    let (loaded, image) = match mapped {
        Ok(()) => {
            let mut target = LoadTarget::new(frames, &mut dir);
            let loaded = loader.load(&mut target);
            (loaded, target.image)
        }
        Err(err) => {
            frames.free(stack, stack_pages);
            (Err(err), ProgramImage::empty())
        }
    };

    let Some(mut p) = kernel.procs.lock(pid) else {
        unmap_present(&mut dir, frames, image.start, page_round_up(image.brk));
        unmap_present(&mut dir, frames, bounds.low, bounds.high);
        dir.destroy(frames);
        return Err(KernelError::NoSuchProcess);
    };
    p.page_dir = Some(dir);
    p.image = image;
    if let Err(err) = loaded {
        p.stack = if mapped.is_ok() { bounds } else { StackBounds::default() };
        warn!(target: "exec", "pid {} load failed: {}", pid, err);
        return Err(KernelError::LoadFailed);
    }

    p.stack = bounds;
    p.trap.frame = TrapFrame::zero();
    p.trap.frame.sp = layout.sp;
    p.trap.frame.a0 = layout.argc;
    p.trap.frame.a1 = layout.argv;
    p.trap.frame.a2 = layout.envp;
    p.trap.user_pc = image.entry;
    if let Some(name) = argv.first() {
        p.name.set(name.rsplit('/').next().unwrap_or(name));
    }
    p.status.insert(ProcStatus::READY | ProcStatus::NORMAL);
    info!(target: "exec", "pid {} exec {:?} entry {:#x}", pid, p.name, image.entry);
    Ok(layout.argc)
}
