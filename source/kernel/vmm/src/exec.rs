// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Program loader replacing a process image with an ELF64 executable
//! OWNERS: @kernel-mm-team
//! PUBLIC API: exec(env, proc, path, argv), ExecEnv, ExecError, flags_to_perm
//! DEPENDS_ON: goblin (ELF header/program headers), fs::Storage, mmap::MmapTeardown, mm::*
//! INVARIANTS: The caller's image is untouched until commit; a failed load frees every page it
//!             allocated; the old image is destroyed only after the new one is installed

use core::cmp::min;

use goblin::container::{Container, Ctx};
use goblin::elf::header::{Header, ELFMAG, SELFMAG};
use goblin::elf::program_header::{ProgramHeader, PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use goblin::elf64::header::SIZEOF_EHDR;
use goblin::elf64::program_header::SIZEOF_PHDR;
use thiserror::Error;

use crate::config::{MAX_ARGS, MAX_MMAP_AREAS, TRAMPOLINE, USER_STACK_PAGES};
use crate::fs::{FsOp, LockedInode, Storage};
use crate::halt::{halt, OrHalt};
use crate::mm::uaccess::copy_out;
use crate::mm::{
    page_round_up, AddressSpace, Fatal, MemRef, PageFlags, PhysMemory, VmError, PAGE_SIZE,
};
use crate::mmap::{MmapArea, MmapTeardown};
use crate::proc::Process;
use crate::trap::TrapFrame;

/// Collaborators used while loading a program.
pub struct ExecEnv<'a> {
    pub mem: MemRef,
    pub storage: &'a dyn Storage,
    pub mmap: &'a dyn MmapTeardown,
    /// Physical address of the trampoline page mapped into every user space.
    pub trampoline: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("executable not found")]
    NotFound,
    #[error("invalid executable: {0}")]
    Format(&'static str),
    #[error("executable truncated")]
    ShortRead,
    #[error("too many arguments")]
    TooManyArgs,
    #[error("arguments do not fit on the user stack")]
    StackOverflow,
    #[error(transparent)]
    Vm(#[from] VmError),
}

/// Maps ELF segment flags to leaf permissions for a user mapping.
pub fn flags_to_perm(flags: u32) -> PageFlags {
    let mut perm = PageFlags::USER;
    if flags & PF_X != 0 {
        perm |= PageFlags::EXECUTE;
    }
    if flags & PF_W != 0 {
        perm |= PageFlags::WRITE;
    }
    if flags & PF_R != 0 {
        perm |= PageFlags::READ;
    }
    perm
}

struct Image {
    space: AddressSpace,
    entry: usize,
    sp: usize,
    argc: usize,
}

/// Replaces the image of `proc` with the executable at `path`.
///
/// Returns the argument count, which the syscall layer hands back in `a0`.
/// On failure `proc` keeps its address space, name, registers and mapped
/// files.
pub fn exec(
    env: &ExecEnv<'_>,
    proc: &mut Process,
    path: &[u8],
    argv: &[&[u8]],
) -> Result<usize, ExecError> {
    let image = match load_image(env, path, argv) {
        Ok(image) => image,
        Err(err) => {
            log_debug!(
                target: "exec",
                "pid {}: exec {} failed: {}",
                proc.pid(),
                core::str::from_utf8(path).unwrap_or("?"),
                err
            );
            return Err(err);
        }
    };
    release_mmap_areas(env, proc);
    Ok(commit(proc, path, image))
}

fn load_image(env: &ExecEnv<'_>, path: &[u8], argv: &[&[u8]]) -> Result<Image, ExecError> {
    let (mut space, entry) = load_program(env, path)?;
    let (sp, argc) = build_stack(&mut space, argv)?;
    Ok(Image { space, entry, sp, argc })
}

/// Opens the executable, validates it, and loads every LOAD segment into a
/// fresh address space.
fn load_program(env: &ExecEnv<'_>, path: &[u8]) -> Result<(AddressSpace, usize), ExecError> {
    let op = FsOp::begin(env.storage);
    let ip = op.open(path).ok_or(ExecError::NotFound)?;

    let mut raw = [0u8; SIZEOF_EHDR];
    if !ip.read_exact(&mut raw, 0) {
        return Err(ExecError::ShortRead);
    }
    let (header, ctx) = parse_header(&raw)?;
    let entry = usize::try_from(header.e_entry).map_err(|_| ExecError::Format("entry"))?;
    if header.e_phnum > 0 && usize::from(header.e_phentsize) < SIZEOF_PHDR {
        return Err(ExecError::Format("program header size"));
    }

    let mut space = AddressSpace::new_user(env.mem.clone(), env.trampoline).or_halt()?;
    for index in 0..u64::from(header.e_phnum) {
        let ph = read_program_header(&ip, &header, ctx, index)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        let (va, end) = check_segment(&ph)?;
        space.grow(end, flags_to_perm(ph.p_flags)).or_halt()?;
        load_segment(&space, &ip, va, ph.p_offset, ph.p_filesz)?;
    }
    Ok((space, entry))
}

fn parse_header(raw: &[u8; SIZEOF_EHDR]) -> Result<(Header, Ctx), ExecError> {
    if raw[..SELFMAG] != ELFMAG[..] {
        return Err(ExecError::Format("bad magic"));
    }
    let header = Elf::parse_header(raw).map_err(|_| ExecError::Format("malformed header"))?;
    let container = header.container().map_err(|_| ExecError::Format("unknown class"))?;
    if container != Container::Big {
        return Err(ExecError::Format("not a 64-bit executable"));
    }
    let endian = header.endianness().map_err(|_| ExecError::Format("unknown byte order"))?;
    Ok((header, Ctx::new(container, endian)))
}

fn read_program_header(
    ip: &LockedInode<'_>,
    header: &Header,
    ctx: Ctx,
    index: u64,
) -> Result<ProgramHeader, ExecError> {
    let offset = index
        .checked_mul(u64::from(header.e_phentsize))
        .and_then(|rel| header.e_phoff.checked_add(rel))
        .ok_or(ExecError::Format("program header offset"))?;
    let mut raw = [0u8; SIZEOF_PHDR];
    if !ip.read_exact(&mut raw, offset) {
        return Err(ExecError::ShortRead);
    }
    ProgramHeader::parse(&raw, 0, 1, ctx)
        .ok()
        .and_then(|headers| headers.into_iter().next())
        .ok_or(ExecError::Format("malformed program header"))
}

/// Validates a LOAD segment; returns its start and end addresses.
fn check_segment(ph: &ProgramHeader) -> Result<(usize, usize), ExecError> {
    if ph.p_memsz < ph.p_filesz {
        return Err(ExecError::Format("memsz smaller than filesz"));
    }
    let end = ph.p_vaddr.checked_add(ph.p_memsz).ok_or(ExecError::Format("segment wraps"))?;
    if ph.p_vaddr % PAGE_SIZE as u64 != 0 {
        return Err(ExecError::Format("segment not page aligned"));
    }
    match (usize::try_from(ph.p_vaddr), usize::try_from(end)) {
        (Ok(va), Ok(end)) if end <= TRAMPOLINE => Ok((va, end)),
        _ => Err(ExecError::Format("segment outside user address space")),
    }
}

/// Reads `filesz` bytes at `offset` straight into the frames mapped at `va`.
/// The rest of the segment stays zero from allocation.
fn load_segment(
    space: &AddressSpace,
    ip: &LockedInode<'_>,
    va: usize,
    offset: u64,
    filesz: u64,
) -> Result<(), ExecError> {
    let filesz = usize::try_from(filesz).map_err(|_| ExecError::Format("filesz"))?;
    let mem = space.mem().clone();
    let mut done = 0;
    while done < filesz {
        let page = va + done;
        let pa = match space.page_table().translate(page) {
            Some(pa) => pa,
            None => halt(&Fatal::MissingPte { what: "load_segment", va: page }),
        };
        let n = min(PAGE_SIZE, filesz - done);
        let at = offset
            .checked_add(done as u64)
            .ok_or(ExecError::Format("segment offset"))?;
        let mut read = 0;
        mem.with_page(pa, &mut |frame| read = ip.read(&mut frame[..n], at));
        if read != n {
            return Err(ExecError::ShortRead);
        }
        done += n;
    }
    Ok(())
}

/// Maps a guard page and the user stack above the loaded image, then pushes
/// the argument strings and the argv pointer array.
fn build_stack(space: &mut AddressSpace, argv: &[&[u8]]) -> Result<(usize, usize), ExecError> {
    if argv.len() > MAX_ARGS {
        return Err(ExecError::TooManyArgs);
    }
    let guard = page_round_up(space.size());
    let top = guard + (USER_STACK_PAGES + 1) * PAGE_SIZE;
    space.grow(top, PageFlags::WRITE).or_halt()?;
    space.page_table_mut().clear_user(guard).or_halt()?;
    let stack_base = top - USER_STACK_PAGES * PAGE_SIZE;

    let mut sp = top;
    let mut ustack = [0u64; MAX_ARGS + 1];
    for (slot, arg) in ustack.iter_mut().zip(argv) {
        sp = push_down(sp, arg.len() + 1, stack_base)?;
        copy_out(space, sp, arg).or_halt()?;
        copy_out(space, sp + arg.len(), &[0]).or_halt()?;
        *slot = sp as u64;
    }

    let argc = argv.len();
    let len = (argc + 1) * core::mem::size_of::<u64>();
    sp = push_down(sp, len, stack_base)?;
    let mut raw = [0u8; (MAX_ARGS + 1) * 8];
    for (chunk, ptr) in raw.chunks_exact_mut(8).zip(&ustack[..=argc]) {
        chunk.copy_from_slice(&ptr.to_le_bytes());
    }
    copy_out(space, sp, &raw[..len]).or_halt()?;
    Ok((sp, argc))
}

/// Moves `sp` down by `len` and aligns it to 16 bytes, staying above `floor`.
fn push_down(sp: usize, len: usize, floor: usize) -> Result<usize, ExecError> {
    let sp = sp.checked_sub(len).ok_or(ExecError::StackOverflow)?;
    let sp = sp - sp % 16;
    if sp < floor {
        return Err(ExecError::StackOverflow);
    }
    Ok(sp)
}

/// Tears down every memory-mapped area of the caller. A failing collaborator
/// is backed up by unmapping the pages and closing the file here.
fn release_mmap_areas(env: &ExecEnv<'_>, proc: &mut Process) {
    for slot in 0..MAX_MMAP_AREAS {
        let area = proc.mmap_areas[slot];
        if !area.used {
            continue;
        }
        let result = match proc.space_mut() {
            Some(space) => env.mmap.teardown_region(space, &area),
            None => Ok(()),
        };
        if let Err(err) = result {
            log_warn!(
                target: "exec",
                "pid {}: mmap teardown {:#x}+{:#x} failed ({}); unmapping directly",
                proc.pid(),
                area.addr,
                area.len,
                err
            );
            if let Some(space) = proc.space_mut() {
                let _ = space.page_table_mut().unmap(area.addr, area.pages(), true).or_halt();
            }
            if let Some(file) = area.file {
                let _op = FsOp::begin(env.storage);
                env.storage.close(file);
            }
        }
        proc.mmap_areas[slot] = MmapArea::EMPTY;
    }
    proc.mmap_hint = 0;
}

fn commit(proc: &mut Process, path: &[u8], image: Image) -> usize {
    let name = path.rsplit(|&b| b == b'/').next().unwrap_or(path);
    proc.set_name(name);
    proc.trapframe.sepc = image.entry;
    proc.trapframe.set_x(TrapFrame::SP, image.sp);
    proc.trapframe.set_x(TrapFrame::A1, image.sp);
    if let Some(old) = proc.install_space(image.space) {
        let _ = old.destroy().or_halt();
    }
    image.argc
}
