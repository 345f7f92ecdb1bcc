// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Compile-time configuration and physical memory layout
//! OWNERS: @kernel-mm-team
//! PUBLIC API: PAGE_SIZE, MAXVA, limits, KernelLayout
//! DEPENDS_ON: static_assertions
//! INVARIANTS: PAGE_SIZE is a power of two; TRAMPOLINE is the last page below MAXVA

use static_assertions::const_assert;

/// Size of a single page in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Bits of offset within a page.
pub const PAGE_SHIFT: usize = 12;
/// Number of entries per Sv39 page-table page.
pub const PT_ENTRIES: usize = 512;
/// Number of page-table levels.
pub const PT_LEVELS: usize = 3;

/// One beyond the highest virtual address usable by Sv39.
///
/// Sv39 allows 39 bits but sign extension of bit 38 would require the upper
/// half; staying below 1 << 38 keeps every address canonical.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

/// Trampoline page, mapped at the top of every address space.
pub const TRAMPOLINE: usize = MAXVA - PAGE_SIZE;

/// Usable user stack pages (the guard page comes in addition).
pub const USER_STACK_PAGES: usize = 1;
/// Maximum number of exec arguments.
pub const MAX_ARGS: usize = 32;
/// Maximum length of a path handed to exec, including the terminator.
pub const MAX_PATH: usize = 128;
/// Length of the diagnostic process name buffer.
pub const PROC_NAME_LEN: usize = 16;
/// Memory-mapped areas tracked per process.
pub const MAX_MMAP_AREAS: usize = 16;
/// Maximum number of process slots (one kernel stack each).
pub const MAX_PROCS: usize = 64;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1 << PAGE_SHIFT == PAGE_SIZE);
const_assert!(PT_ENTRIES * core::mem::size_of::<u64>() == PAGE_SIZE);
const_assert!(MAXVA % PAGE_SIZE == 0);
const_assert!(PROC_NAME_LEN >= 2);

/// Physical and virtual layout of the machine (QEMU `virt` by default).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelLayout {
    pub uart0: usize,
    pub virtio0: usize,
    pub plic: usize,
    pub plic_size: usize,
    pub kernbase: usize,
    pub phystop: usize,
    /// First byte after kernel text; must be page aligned.
    pub etext: usize,
}

impl KernelLayout {
    /// Kernel stack address for process slot `slot`, each followed by an
    /// unmapped guard page.
    pub const fn kstack(slot: usize) -> usize {
        TRAMPOLINE - (slot + 1) * 2 * PAGE_SIZE
    }
}

impl Default for KernelLayout {
    fn default() -> Self {
        const KERNBASE: usize = 0x8000_0000;
        Self {
            uart0: 0x1000_0000,
            virtio0: 0x1000_1000,
            plic: 0x0c00_0000,
            plic_size: 0x400_0000,
            kernbase: KERNBASE,
            phystop: KERNBASE + 128 * 1024 * 1024,
            etext: KERNBASE + 0x8000,
        }
    }
}
