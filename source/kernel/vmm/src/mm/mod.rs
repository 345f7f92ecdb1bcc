// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory primitives for Sv39.

use bitflags::bitflags;
use thiserror::Error;

pub mod address_space;
pub mod fault;
pub mod frame;
pub mod kernel_space;
pub mod page_table;
pub mod uaccess;

pub use address_space::AddressSpace;
pub use fault::{resolve_fault, Access};
pub use frame::{FrameAllocator, FramePool, MemRef, PhysMemory};
pub use kernel_space::KernelSpace;
pub use page_table::{Entry, Mapping, PageTable, PteSlot};

pub use crate::config::{MAXVA, PAGE_SIZE};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: u64 {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

/// Any of these set on a valid entry makes it a leaf.
pub const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

impl PageFlags {
    /// Read/write data accessible from user mode.
    pub const USER_RW: Self = Self::READ.union(Self::WRITE).union(Self::USER);

    /// Returns true when the flags describe a leaf rather than a table link.
    pub const fn is_leaf(self) -> bool {
        self.intersects(LEAF_PERMS)
    }
}

/// Recoverable virtual-memory errors plus the fatal escape hatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum VmError {
    /// No physical page available.
    #[error("out of physical pages")]
    AllocationFailure,
    /// Translation or walk found no mapping.
    #[error("no mapping for va {va:#x}")]
    LookupMiss { va: usize },
    /// Address beyond the address-space size.
    #[error("va {va:#x} outside address space of size {limit:#x}")]
    BoundsViolation { va: usize, limit: usize },
    /// Fault on a page that is already mapped; not a lazy-allocation candidate.
    #[error("access violation at mapped va {va:#x}")]
    AccessViolation { va: usize },
    /// Destination page is not writable.
    #[error("page at va {va:#x} is not writable")]
    PermissionDenied { va: usize },
    /// No terminator within the allowed length.
    #[error("string at va {va:#x} not terminated within {max} bytes")]
    Unterminated { va: usize, max: usize },
    /// The process has no address space installed.
    #[error("no address space installed")]
    NoAddressSpace,
    /// Invariant violation; the system must halt.
    #[error("fatal: {0}")]
    Fatal(#[from] Fatal),
}

impl VmError {
    /// Returns true if this error signals a bug rather than a runtime condition.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, VmError::Fatal(_))
    }
}

/// Conditions that indicate kernel corruption. Never returned to user space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error("misaligned range va={va:#x} size={size:#x}")]
    Misaligned { va: usize, size: usize },
    #[error("misaligned physical frame pa={pa:#x}")]
    MisalignedFrame { pa: usize },
    #[error("zero-length mapping at va={va:#x}")]
    ZeroLength { va: usize },
    #[error("walk: va {va:#x} beyond MAXVA")]
    VaOutOfRange { va: usize },
    #[error("remap of valid entry at va={va:#x}")]
    Remap { va: usize },
    #[error("leaf flags {flags:#x} carry no R/W/X at va={va:#x}")]
    InvalidLeafFlags { va: usize, flags: u64 },
    #[error("leaf entry at level {level} while walking va={va:#x}")]
    UnexpectedLeaf { va: usize, level: usize },
    #[error("table link where a leaf was expected at va={va:#x}")]
    NotALeaf { va: usize },
    #[error("freewalk: leaf still mapped in table {table:#x} slot {index}")]
    FreeLeaf { table: usize, index: usize },
    #[error("table {table:#x} linked from more than one entry")]
    SharedTable { table: usize },
    #[error("{what}: page table entry missing for va={va:#x}")]
    MissingPte { what: &'static str, va: usize },
    #[error("kerneltrap: unexpected scause {scause:#x}")]
    UnexpectedKernelTrap { scause: usize },
}

/// Result alias used by the memory subsystem.
pub type VmResult<T> = Result<T, VmError>;

/// Rounds `addr` down to its page boundary.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds `addr` up to the next page boundary, saturating at the last page.
#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => v & !(PAGE_SIZE - 1),
        None => usize::MAX & !(PAGE_SIZE - 1),
    }
}
