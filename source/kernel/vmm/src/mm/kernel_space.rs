// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Persistent identity-mapped kernel address space
//! OWNERS: @kernel-mm-team
//! PUBLIC API: KernelSpace::{build, activate, destroy}, kvminit(), kernel_space()
//! DEPENDS_ON: mm::page_table, arch::Cpu, spin::Once
//! INVARIANTS: Built exactly once during boot; read-only afterwards; no USER bit on any leaf;
//!             every kernel stack is followed by an unmapped guard page

extern crate alloc;

use alloc::vec::Vec;

use spin::Once;

use super::{FrameAllocator, MemRef, PageFlags, PageTable, PhysMemory, VmError, VmResult, PAGE_SIZE};
use crate::arch::Cpu;
use crate::config::{KernelLayout, MAX_PROCS, TRAMPOLINE};

const RW: PageFlags = PageFlags::READ.union(PageFlags::WRITE);
const RX: PageFlags = PageFlags::READ.union(PageFlags::EXECUTE);

#[derive(Clone, Copy, Debug)]
struct Region {
    va: usize,
    pages: usize,
    owned: bool,
}

/// Kernel page table together with the regions it maps.
pub struct KernelSpace {
    table: PageTable,
    regions: Vec<Region>,
    stacks: usize,
}

impl KernelSpace {
    /// Builds the kernel table: devices, kernel text and data identity mapped,
    /// the trampoline at [`TRAMPOLINE`], and one kernel stack per process slot.
    /// At most [`MAX_PROCS`] stacks are mapped.
    ///
    /// On failure every page allocated so far is returned.
    pub fn build(
        mem: MemRef,
        layout: &KernelLayout,
        trampoline_pa: usize,
        nprocs: usize,
    ) -> VmResult<Self> {
        let mut space =
            Self { table: PageTable::create(mem)?, regions: Vec::new(), stacks: 0 };
        if let Err(err) = space.populate(layout, trampoline_pa, nprocs) {
            space.teardown()?;
            return Err(err);
        }
        log_info!(
            target: "mm",
            "kernel space: root={:#x} text={:#x}..{:#x} phystop={:#x} stacks={}",
            space.table.root(),
            layout.kernbase,
            layout.etext,
            layout.phystop,
            space.stacks
        );
        Ok(space)
    }

    fn populate(&mut self, layout: &KernelLayout, trampoline_pa: usize, nprocs: usize) -> VmResult<()> {
        self.identity(layout.uart0, PAGE_SIZE, RW)?;
        self.identity(layout.virtio0, PAGE_SIZE, RW)?;
        self.identity(layout.plic, layout.plic_size, RW)?;
        self.identity(layout.kernbase, layout.etext - layout.kernbase, RX)?;
        self.identity(layout.etext, layout.phystop - layout.etext, RW)?;
        self.regions.push(Region { va: TRAMPOLINE, pages: 1, owned: false });
        self.table.map(TRAMPOLINE, PAGE_SIZE, trampoline_pa, RX)?;
        for slot in 0..nprocs.min(MAX_PROCS) {
            let mem = self.table.mem().clone();
            let pa = mem.allocate_page().ok_or(VmError::AllocationFailure)?;
            mem.zero_page(pa);
            let va = KernelLayout::kstack(slot);
            if let Err(err) = self.table.map(va, PAGE_SIZE, pa, RW) {
                mem.free_page(pa);
                return Err(err);
            }
            self.regions.push(Region { va, pages: 1, owned: true });
            self.stacks += 1;
        }
        Ok(())
    }

    fn identity(&mut self, pa: usize, size: usize, perm: PageFlags) -> VmResult<()> {
        self.regions.push(Region { va: pa, pages: size / PAGE_SIZE, owned: false });
        self.table.map(pa, size, pa, perm)
    }

    fn teardown(&mut self) -> VmResult<()> {
        // A region whose map failed part way may have left leaves behind; unmap
        // skips the ones that were never installed.
        for region in self.regions.drain(..).rev() {
            self.table.unmap(region.va, region.pages, region.owned)?;
        }
        self.table.release()
    }

    /// Unmaps everything, freeing the kernel stacks and the table nodes.
    pub fn destroy(mut self) -> VmResult<()> {
        self.teardown()
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    /// Number of kernel stacks mapped.
    pub fn stacks(&self) -> usize {
        self.stacks
    }

    /// Switches the hart to this table.
    pub fn activate(&self, cpu: &mut Cpu) {
        cpu.write_satp(self.table.satp());
    }
}

static KERNEL_SPACE: Once<KernelSpace> = Once::new();

/// Builds the kernel address space on first call; later calls return the
/// existing one and ignore their arguments.
pub fn kvminit(
    mem: MemRef,
    layout: &KernelLayout,
    trampoline_pa: usize,
    nprocs: usize,
) -> VmResult<&'static KernelSpace> {
    KERNEL_SPACE.try_call_once(|| KernelSpace::build(mem, layout, trampoline_pa, nprocs))
}

/// Returns the kernel address space once [`kvminit`] has succeeded.
pub fn kernel_space() -> Option<&'static KernelSpace> {
    KERNEL_SPACE.get()
}
