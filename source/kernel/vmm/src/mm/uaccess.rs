// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Byte and string transfer across the user/kernel boundary
//! OWNERS: @kernel-mm-team
//! PUBLIC API: copy_out, copy_in, copy_in_string, fetch_addr
//! DEPENDS_ON: mm::fault::resolve_fault, mm::page_table
//! INVARIANTS: Only leaves carrying the USER bit are touched; every transfer is split at page
//!             boundaries; bytes already copied before a failure stay copied

use core::cmp::min;

use super::fault::{resolve_fault, Access};
use super::{
    page_round_down, AddressSpace, Mapping, PageFlags, PhysMemory, VmError, VmResult, PAGE_SIZE,
};

/// Bytes scanned per read while looking for a string terminator.
const STRING_CHUNK: usize = 64;

/// Copies `src` into user memory at `dst_va`, faulting in missing pages.
pub fn copy_out(space: &mut AddressSpace, dst_va: usize, src: &[u8]) -> VmResult<()> {
    let mem = space.mem().clone();
    let mut va = dst_va;
    let mut rest = src;
    while !rest.is_empty() {
        let pa = user_page(space, va, Access::Write)?;
        let off = va - page_round_down(va);
        let n = min(PAGE_SIZE - off, rest.len());
        mem.write(pa + off, &rest[..n]);
        rest = &rest[n..];
        va = advance(va, n, space.size())?;
    }
    Ok(())
}

/// Copies user memory at `src_va` into `dst`, faulting in missing pages.
pub fn copy_in(space: &mut AddressSpace, dst: &mut [u8], src_va: usize) -> VmResult<()> {
    let mem = space.mem().clone();
    let mut va = src_va;
    let mut done = 0;
    while done < dst.len() {
        let pa = user_page(space, va, Access::Read)?;
        let off = va - page_round_down(va);
        let n = min(PAGE_SIZE - off, dst.len() - done);
        mem.read(pa + off, &mut dst[done..done + n]);
        done += n;
        va = advance(va, n, space.size())?;
    }
    Ok(())
}

/// Copies a NUL-terminated string from user memory into `dst`.
///
/// At most `min(max, dst.len())` bytes, terminator included, are examined.
/// Unmapped source pages are an error; this path never faults pages in.
/// Returns the string length without the terminator.
pub fn copy_in_string(
    space: &AddressSpace,
    dst: &mut [u8],
    src_va: usize,
    max: usize,
) -> VmResult<usize> {
    let limit = min(max, dst.len());
    let mem = space.mem();
    let mut scratch = [0u8; STRING_CHUNK];
    let mut va = src_va;
    let mut copied = 0;
    while copied < limit {
        let page = page_round_down(va);
        let pa = space.page_table().translate(page).ok_or(VmError::LookupMiss { va })?;
        let off = va - page;
        let n = min(min(PAGE_SIZE - off, limit - copied), STRING_CHUNK);
        let chunk = &mut scratch[..n];
        mem.read(pa + off, chunk);
        // Nothing past the terminator reaches `dst`.
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            dst[copied..=copied + nul].copy_from_slice(&chunk[..=nul]);
            return Ok(copied + nul);
        }
        dst[copied..copied + n].copy_from_slice(chunk);
        copied += n;
        va = va.checked_add(n).ok_or(VmError::LookupMiss { va })?;
    }
    Err(VmError::Unterminated { va: src_va, max: limit })
}

/// Reads a user word at `va`; the whole word must lie below the space size.
pub fn fetch_addr(space: &mut AddressSpace, va: usize) -> VmResult<u64> {
    let end = va.checked_add(core::mem::size_of::<u64>());
    match end {
        Some(end) if end <= space.size() => {}
        _ => return Err(VmError::BoundsViolation { va, limit: space.size() }),
    }
    let mut raw = [0u8; 8];
    copy_in(space, &mut raw, va)?;
    Ok(u64::from_le_bytes(raw))
}

fn user_page(space: &mut AddressSpace, va: usize, access: Access) -> VmResult<usize> {
    let page = page_round_down(va);
    match space.page_table().lookup(page) {
        Some(Mapping { flags, .. }) if !flags.contains(PageFlags::USER) => {
            Err(VmError::AccessViolation { va })
        }
        Some(Mapping { flags, .. }) if access == Access::Write && !flags.contains(PageFlags::WRITE) => {
            Err(VmError::PermissionDenied { va })
        }
        Some(Mapping { pa, .. }) => Ok(pa),
        None => resolve_fault(space, va, access),
    }
}

fn advance(va: usize, n: usize, limit: usize) -> VmResult<usize> {
    va.checked_add(n).ok_or(VmError::BoundsViolation { va, limit })
}
