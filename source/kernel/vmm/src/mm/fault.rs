// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Zero-fill-on-demand page fault resolver
//! OWNERS: @kernel-mm-team
//! PUBLIC API: resolve_fault(space, va, access), Access
//! DEPENDS_ON: mm::address_space, mm::page_table
//! INVARIANTS: Only pages below the space size are installed; a mapped page is never remapped;
//!             the trap path and the copy layer share this single entry point

use super::{
    page_round_down, AddressSpace, FrameAllocator, PageFlags, PhysMemory, VmError, VmResult,
    PAGE_SIZE,
};

/// Kind of access that faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Installs a zeroed read/write user page covering `va`.
///
/// Returns the physical address of the new page. Fails with
/// [`VmError::BoundsViolation`] when `va` lies at or above the space size and
/// with [`VmError::AccessViolation`] when the page is already mapped, so a
/// permission fault is never masked as a lazy allocation.
pub fn resolve_fault(space: &mut AddressSpace, va: usize, access: Access) -> VmResult<usize> {
    if va >= space.size() {
        return Err(VmError::BoundsViolation { va, limit: space.size() });
    }
    let page = page_round_down(va);
    if space.page_table().is_mapped(page) {
        log_trace!(target: "mm", "fault {:?} on mapped page {:#x}", access, page);
        return Err(VmError::AccessViolation { va });
    }
    let mem = space.mem().clone();
    let pa = mem.allocate_page().ok_or(VmError::AllocationFailure)?;
    mem.zero_page(pa);
    if let Err(err) = space.page_table_mut().map(page, PAGE_SIZE, pa, PageFlags::USER_RW) {
        mem.free_page(pa);
        return Err(err);
    }
    Ok(pa)
}
