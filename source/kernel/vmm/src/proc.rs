// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process record as seen by the memory subsystem
//! OWNERS: @kernel-team
//! PUBLIC API: Process::{new, install_space, grow, grow_lazy, fork, kill, name}
//! DEPENDS_ON: mm::AddressSpace, trap::TrapFrame, mmap::MmapArea
//! INVARIANTS: A process owns at most one address space; the kill flag is only acted on when
//!             returning to user mode

use crate::config::{MAX_MMAP_AREAS, PROC_NAME_LEN};
use crate::fs::Inode;
use crate::mm::{AddressSpace, PageFlags, VmError, VmResult};
use crate::mmap::MmapArea;
use crate::trap::TrapFrame;
use crate::types::Pid;

/// Per-process state touched by exec, fork, sbrk and the trap path.
pub struct Process {
    pid: Pid,
    name: [u8; PROC_NAME_LEN],
    space: Option<AddressSpace>,
    pub trapframe: TrapFrame,
    killed: bool,
    yield_requested: bool,
    pub mmap_areas: [MmapArea; MAX_MMAP_AREAS],
    pub mmap_hint: usize,
}

impl Process {
    /// Creates a process without an address space.
    pub fn new(pid: Pid, name: &[u8]) -> Self {
        let mut proc = Self {
            pid,
            name: [0; PROC_NAME_LEN],
            space: None,
            trapframe: TrapFrame::default(),
            killed: false,
            yield_requested: false,
            mmap_areas: [MmapArea::EMPTY; MAX_MMAP_AREAS],
            mmap_hint: 0,
        };
        proc.set_name(name);
        proc
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Name bytes up to the terminator.
    pub fn name(&self) -> &[u8] {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(PROC_NAME_LEN);
        &self.name[..len]
    }

    /// Name for diagnostics; invalid UTF-8 prints as `?`.
    pub fn name_str(&self) -> &str {
        core::str::from_utf8(self.name()).unwrap_or("?")
    }

    /// Stores `name`, truncated so a terminator always fits.
    pub fn set_name(&mut self, name: &[u8]) {
        let len = name.len().min(PROC_NAME_LEN - 1);
        self.name = [0; PROC_NAME_LEN];
        self.name[..len].copy_from_slice(&name[..len]);
    }

    pub fn space(&self) -> Option<&AddressSpace> {
        self.space.as_ref()
    }

    pub fn space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.space.as_mut()
    }

    /// Current user size, zero without an address space.
    pub fn size(&self) -> usize {
        self.space.as_ref().map_or(0, AddressSpace::size)
    }

    /// Replaces the address space and returns the previous one.
    pub fn install_space(&mut self, space: AddressSpace) -> Option<AddressSpace> {
        self.space.replace(space)
    }

    pub fn take_space(&mut self) -> Option<AddressSpace> {
        self.space.take()
    }

    /// Grows (`delta > 0`) or shrinks (`delta < 0`) the user memory eagerly.
    /// Returns the new size.
    pub fn grow(&mut self, delta: isize) -> VmResult<usize> {
        let space = self.space.as_mut().ok_or(VmError::NoAddressSpace)?;
        let target = resize_target(space.size(), delta)?;
        if delta >= 0 {
            space.grow(target, PageFlags::WRITE)
        } else {
            space.shrink(target)
        }
    }

    /// Like [`Process::grow`], but growth only raises the size and leaves
    /// the pages to the fault resolver.
    pub fn grow_lazy(&mut self, delta: isize) -> VmResult<usize> {
        let space = self.space.as_mut().ok_or(VmError::NoAddressSpace)?;
        let target = resize_target(space.size(), delta)?;
        if delta >= 0 {
            space.reserve(target)
        } else {
            space.shrink(target)
        }
    }

    /// Duplicates this process under `child_pid`: the address space is deep
    /// copied and the child sees a zero return value.
    pub fn fork(&self, child_pid: Pid) -> VmResult<Process> {
        let space = self.space.as_ref().ok_or(VmError::NoAddressSpace)?;
        let mut child = Process::new(child_pid, self.name());
        child.space = Some(space.try_clone()?);
        child.trapframe = self.trapframe;
        child.trapframe.x[TrapFrame::A0] = 0;
        Ok(child)
    }

    /// Marks the process for termination on its next return to user mode.
    pub fn kill(&mut self) {
        self.killed = true;
    }

    pub fn killed(&self) -> bool {
        self.killed
    }

    pub fn request_yield(&mut self) {
        self.yield_requested = true;
    }

    /// Returns and clears the pending yield request.
    pub fn take_yield_request(&mut self) -> bool {
        core::mem::take(&mut self.yield_requested)
    }

    /// Records a memory-mapped region in the first free slot.
    pub fn track_mmap(&mut self, addr: usize, len: usize, file: Option<Inode>) -> Option<usize> {
        let slot = self.mmap_areas.iter().position(|area| !area.used)?;
        self.mmap_areas[slot] = MmapArea { used: true, addr, len, file };
        Some(slot)
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name_str())
            .field("size", &format_args!("{:#x}", self.size()))
            .field("killed", &self.killed)
            .finish()
    }
}

fn resize_target(size: usize, delta: isize) -> VmResult<usize> {
    let target = if delta >= 0 {
        size.checked_add(delta.unsigned_abs())
    } else {
        size.checked_sub(delta.unsigned_abs())
    };
    target.ok_or(VmError::BoundsViolation { va: size, limit: size })
}
