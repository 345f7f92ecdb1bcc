// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-process Sv39 address spaces: creation, growth, duplication, teardown.
//!
//! An [`AddressSpace`] owns its page table, every data page mapped below
//! `size`, and the table nodes. Fixed mappings (the trampoline) point at
//! kernel-owned frames and are unmapped without being freed.

extern crate alloc;

use alloc::vec::Vec;

use super::{
    page_round_up, FrameAllocator, Mapping, MemRef, PageFlags, PageTable, PhysMemory, VmError,
    VmResult, LEAF_PERMS, PAGE_SIZE,
};
use crate::config::TRAMPOLINE;
use crate::halt::OrHalt;

/// Flags carried over when a leaf is copied into another table.
const COPY_MASK: PageFlags = LEAF_PERMS.union(PageFlags::USER).union(PageFlags::GLOBAL);

/// Address space of a single process.
pub struct AddressSpace {
    table: PageTable,
    size: usize,
    fixed: Vec<usize>,
    released: bool,
}

impl AddressSpace {
    /// Creates an empty address space with a fresh root table.
    pub fn create(mem: MemRef) -> VmResult<Self> {
        Ok(Self { table: PageTable::create(mem)?, size: 0, fixed: Vec::new(), released: false })
    }

    /// Creates a user address space with the trampoline mapped at
    /// [`TRAMPOLINE`] (kernel-only, read/execute).
    pub fn new_user(mem: MemRef, trampoline_pa: usize) -> VmResult<Self> {
        let mut space = Self::create(mem)?;
        space.map_fixed(TRAMPOLINE, trampoline_pa, PageFlags::READ | PageFlags::EXECUTE)?;
        Ok(space)
    }

    /// Maps one page of memory the space does not own.
    pub fn map_fixed(&mut self, va: usize, pa: usize, perm: PageFlags) -> VmResult<()> {
        self.table.map(va, PAGE_SIZE, pa, perm)?;
        self.fixed.push(va);
        Ok(())
    }

    /// Current user size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.table
    }

    pub fn mem(&self) -> &MemRef {
        self.table.mem()
    }

    /// SATP value selecting this space.
    pub fn satp(&self) -> usize {
        self.table.satp()
    }

    /// Allocates and maps zeroed pages from the page-rounded current size up
    /// to `new_size`, always adding read and user access to `perm`.
    ///
    /// Either every page is mapped and the new size returned, or nothing
    /// allocated by this call survives.
    pub fn grow(&mut self, new_size: usize, perm: PageFlags) -> VmResult<usize> {
        let old = self.size;
        if new_size <= old {
            return Ok(old);
        }
        check_user_limit(new_size)?;
        let perm = perm | PageFlags::READ | PageFlags::USER;
        let start = page_round_up(old);
        let mut va = start;
        while va < new_size {
            if let Err(err) = self.map_zeroed(va, perm) {
                let mapped = (va - start) / PAGE_SIZE;
                self.table.unmap(start, mapped, true)?;
                // The failing page may have left fresh nodes behind as well.
                self.table.prune(start, mapped + 1)?;
                return Err(err);
            }
            va += PAGE_SIZE;
        }
        self.size = new_size;
        self.check()?;
        Ok(new_size)
    }

    /// Raises the size without mapping anything; pages are installed on first
    /// touch by the fault resolver.
    pub fn reserve(&mut self, new_size: usize) -> VmResult<usize> {
        if new_size > self.size {
            check_user_limit(new_size)?;
            self.size = new_size;
        }
        Ok(self.size)
    }

    /// Unmaps and frees the pages between the page-rounded `new_size` and the
    /// page-rounded current size, then the table nodes left empty. Pages
    /// never touched are skipped.
    pub fn shrink(&mut self, new_size: usize) -> VmResult<usize> {
        let old = self.size;
        if new_size >= old {
            return Ok(old);
        }
        let from = page_round_up(new_size);
        let to = page_round_up(old);
        if from < to {
            let npages = (to - from) / PAGE_SIZE;
            self.table.unmap(from, npages, true)?;
            self.table.prune(from, npages)?;
        }
        self.size = new_size;
        self.check()?;
        Ok(new_size)
    }

    /// Deep-copies every mapped page below `size` into a new space with the
    /// same permissions and re-installs the fixed mappings.
    ///
    /// The source is never modified. On failure the partial copy is torn
    /// down before the error is returned.
    pub fn try_clone(&self) -> VmResult<Self> {
        let mem = self.mem().clone();
        let mut child = Self::create(mem.clone())?;
        child.size = self.size;
        let mut va = 0;
        while va < self.size {
            if let Some(Mapping { pa, flags }) = self.table.lookup(va) {
                let frame = mem.allocate_page().ok_or(VmError::AllocationFailure)?;
                mem.copy_page(frame, pa);
                if let Err(err) = child.table.map(va, PAGE_SIZE, frame, flags & COPY_MASK) {
                    mem.free_page(frame);
                    return Err(err);
                }
            }
            va += PAGE_SIZE;
        }
        for &va in &self.fixed {
            if let Some(Mapping { pa, flags }) = self.table.lookup(va) {
                child.map_fixed(va, pa, flags & COPY_MASK)?;
            }
        }
        child.check()?;
        Ok(child)
    }

    /// Releases every owned page and table node.
    pub fn destroy(mut self) -> VmResult<()> {
        self.teardown()
    }

    fn map_zeroed(&mut self, va: usize, perm: PageFlags) -> VmResult<()> {
        let mem = self.table.mem().clone();
        let pa = mem.allocate_page().ok_or(VmError::AllocationFailure)?;
        mem.zero_page(pa);
        self.table.map(va, PAGE_SIZE, pa, perm).map_err(|err| {
            mem.free_page(pa);
            err
        })
    }

    fn teardown(&mut self) -> VmResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.table.unmap(0, page_round_up(self.size) / PAGE_SIZE, true)?;
        for va in self.fixed.drain(..) {
            self.table.unmap(va, 1, false)?;
        }
        self.size = 0;
        self.table.release()
    }

    #[cfg(feature = "debug_pt_verify")]
    fn check(&self) -> VmResult<()> {
        self.table.verify()
    }

    #[cfg(not(feature = "debug_pt_verify"))]
    #[inline(always)]
    fn check(&self) -> VmResult<()> {
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let _ = self.teardown().or_halt();
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &format_args!("{:#x}", self.table.root()))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

fn check_user_limit(size: usize) -> VmResult<()> {
    if size > TRAMPOLINE {
        return Err(VmError::BoundsViolation { va: size, limit: TRAMPOLINE });
    }
    Ok(())
}
