// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.
//!
//! Nodes live in physical pages obtained from the [`PhysMemory`] collaborator
//! and are addressed by their physical address. Entries are decoded into
//! [`Entry`] before use so a data frame can never be followed as a table.

extern crate alloc;

use alloc::collections::BTreeSet;

use super::{Fatal, FrameAllocator, MemRef, PageFlags, PhysMemory, VmError, VmResult, LEAF_PERMS};
use crate::config::{MAXVA, PAGE_SHIFT, PAGE_SIZE, PT_ENTRIES, PT_LEVELS};

const PTE_SIZE: usize = core::mem::size_of::<u64>();
const FLAG_BITS: u64 = 0x3ff;

/// Physical address of a page-table node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TableRef(usize);

impl TableRef {
    /// Physical address of the node.
    pub const fn pa(self) -> usize {
        self.0
    }
}

/// Decoded page-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Entry {
    Invalid,
    /// Link to the next-level node owned by this entry.
    Table(TableRef),
    /// Mapping of a data page; `flags` always contains VALID and one of R/W/X.
    Leaf { pa: usize, flags: PageFlags },
}

impl Entry {
    /// Decodes a raw Sv39 entry.
    pub fn decode(raw: u64) -> Self {
        let flags = PageFlags::from_bits_truncate(raw & FLAG_BITS);
        if !flags.contains(PageFlags::VALID) {
            return Entry::Invalid;
        }
        let pa = ((raw >> 10) << PAGE_SHIFT) as usize;
        if flags.intersects(LEAF_PERMS) {
            Entry::Leaf { pa, flags }
        } else {
            Entry::Table(TableRef(pa))
        }
    }

    /// Encodes the entry into its raw Sv39 form.
    pub fn encode(self) -> u64 {
        match self {
            Entry::Invalid => 0,
            Entry::Table(table) => ppn_bits(table.0) | PageFlags::VALID.bits(),
            Entry::Leaf { pa, flags } => ppn_bits(pa) | (flags | PageFlags::VALID).bits(),
        }
    }

    pub fn is_valid(self) -> bool {
        !matches!(self, Entry::Invalid)
    }
}

fn ppn_bits(pa: usize) -> u64 {
    ((pa >> PAGE_SHIFT) as u64) << 10
}

/// Location of one entry: a node plus an index into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PteSlot {
    table: usize,
    index: usize,
}

impl PteSlot {
    const fn new(table: usize, index: usize) -> Self {
        Self { table, index }
    }

    /// Physical address of the entry word.
    pub const fn pa(self) -> usize {
        self.table + self.index * PTE_SIZE
    }
}

/// Result of a successful lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub pa: usize,
    pub flags: PageFlags,
}

/// Three-level Sv39 page table allocating intermediate levels on demand.
///
/// Dropping a `PageTable` without [`PageTable::free`] leaks its nodes;
/// [`super::AddressSpace`] owns the teardown sequence.
#[must_use]
pub struct PageTable {
    root: usize,
    mem: MemRef,
}

impl PageTable {
    /// Creates an empty page table with a fresh zeroed root page.
    pub fn create(mem: MemRef) -> VmResult<Self> {
        let root = mem.allocate_page().ok_or(VmError::AllocationFailure)?;
        mem.zero_page(root);
        Ok(Self { root, mem })
    }

    /// Physical address of the root node.
    pub fn root(&self) -> usize {
        self.root
    }

    /// Physical memory backing this table.
    pub fn mem(&self) -> &MemRef {
        &self.mem
    }

    /// Returns the SATP value selecting this table in Sv39 mode.
    pub fn satp(&self) -> usize {
        const MODE_SV39: usize = 8;
        (MODE_SV39 << 60) | (self.root >> PAGE_SHIFT)
    }

    /// Slot `index` of the root node.
    pub fn root_slot(&self, index: usize) -> PteSlot {
        PteSlot::new(self.root, index % PT_ENTRIES)
    }

    /// Reads the entry stored in `slot`.
    pub fn load(&self, slot: PteSlot) -> Entry {
        Entry::decode(self.mem.read_u64(slot.pa()))
    }

    /// Overwrites the entry stored in `slot`.
    pub fn store(&mut self, slot: PteSlot, entry: Entry) {
        self.mem.write_u64(slot.pa(), entry.encode());
    }

    /// Finds the level-0 slot for `va`, creating missing nodes when `allocate`
    /// is set.
    pub fn walk(&mut self, va: usize, allocate: bool) -> VmResult<PteSlot> {
        if va >= MAXVA {
            return Err(Fatal::VaOutOfRange { va }.into());
        }
        let mut table = self.root;
        for level in (1..PT_LEVELS).rev() {
            let slot = PteSlot::new(table, px(level, va));
            table = match self.load(slot) {
                Entry::Table(next) => next.pa(),
                Entry::Leaf { .. } => return Err(Fatal::UnexpectedLeaf { va, level }.into()),
                Entry::Invalid if !allocate => return Err(VmError::LookupMiss { va }),
                Entry::Invalid => {
                    let node = self.mem.allocate_page().ok_or(VmError::AllocationFailure)?;
                    self.mem.zero_page(node);
                    self.store(slot, Entry::Table(TableRef(node)));
                    node
                }
            };
        }
        Ok(PteSlot::new(table, px(0, va)))
    }

    /// Non-allocating walk usable through a shared reference.
    pub fn find(&self, va: usize) -> VmResult<PteSlot> {
        if va >= MAXVA {
            return Err(Fatal::VaOutOfRange { va }.into());
        }
        let mut table = self.root;
        for level in (1..PT_LEVELS).rev() {
            table = match self.load(PteSlot::new(table, px(level, va))) {
                Entry::Table(next) => next.pa(),
                Entry::Leaf { .. } => return Err(Fatal::UnexpectedLeaf { va, level }.into()),
                Entry::Invalid => return Err(VmError::LookupMiss { va }),
            };
        }
        Ok(PteSlot::new(table, px(0, va)))
    }

    /// Translates a user virtual address to the physical address of its page.
    ///
    /// Kernel-only leaves (no USER bit) are invisible here.
    pub fn translate(&self, va: usize) -> Option<usize> {
        match self.lookup(va)? {
            Mapping { pa, flags } if flags.contains(PageFlags::USER) => Some(pa),
            _ => None,
        }
    }

    /// Returns the leaf mapping covering `va`, regardless of the USER bit.
    pub fn lookup(&self, va: usize) -> Option<Mapping> {
        if va >= MAXVA {
            return None;
        }
        let slot = self.find(va).ok()?;
        match self.load(slot) {
            Entry::Leaf { pa, flags } => Some(Mapping { pa, flags }),
            _ => None,
        }
    }

    /// Returns true if the page containing `va` has a valid leaf.
    pub fn is_mapped(&self, va: usize) -> bool {
        self.lookup(va).is_some()
    }

    /// Installs leaves for `[va, va + size)` pointing at `[pa, pa + size)`.
    ///
    /// Misalignment, empty ranges, flags without R/W/X and remapping are bugs
    /// in the caller and reported as [`Fatal`]. Running out of pages for
    /// intermediate nodes leaves the pages mapped so far in place.
    pub fn map(&mut self, va: usize, size: usize, pa: usize, perm: PageFlags) -> VmResult<()> {
        if va % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
            return Err(Fatal::Misaligned { va, size }.into());
        }
        if pa % PAGE_SIZE != 0 {
            return Err(Fatal::MisalignedFrame { pa }.into());
        }
        if size == 0 {
            return Err(Fatal::ZeroLength { va }.into());
        }
        if !perm.is_leaf() {
            return Err(Fatal::InvalidLeafFlags { va, flags: perm.bits() }.into());
        }
        let last = va
            .checked_add(size - PAGE_SIZE)
            .ok_or(Fatal::VaOutOfRange { va: usize::MAX })?;
        let flags = perm | PageFlags::VALID;
        let mut a = va;
        let mut frame = pa;
        loop {
            let slot = self.walk(a, true)?;
            if self.load(slot).is_valid() {
                return Err(Fatal::Remap { va: a }.into());
            }
            self.store(slot, Entry::Leaf { pa: frame, flags });
            if a == last {
                break;
            }
            a += PAGE_SIZE;
            frame += PAGE_SIZE;
        }
        #[cfg(feature = "debug_pt_verify")]
        self.verify()?;
        Ok(())
    }

    /// Clears `npages` leaves starting at `va`, optionally returning the
    /// backing pages to the allocator. Already-invalid entries are skipped.
    pub fn unmap(&mut self, va: usize, npages: usize, free: bool) -> VmResult<()> {
        if va % PAGE_SIZE != 0 {
            return Err(Fatal::Misaligned { va, size: npages * PAGE_SIZE }.into());
        }
        for page in 0..npages {
            let a = va + page * PAGE_SIZE;
            let slot = match self.find(a) {
                Ok(slot) => slot,
                Err(VmError::LookupMiss { .. }) => continue,
                Err(err) => return Err(err),
            };
            match self.load(slot) {
                Entry::Invalid => continue,
                Entry::Table(_) => return Err(Fatal::NotALeaf { va: a }.into()),
                Entry::Leaf { pa, .. } => {
                    if free {
                        self.mem.free_page(pa);
                    }
                    self.store(slot, Entry::Invalid);
                }
            }
        }
        Ok(())
    }

    /// Frees the intermediate nodes overlapping `npages` pages at `va` that no
    /// longer hold a valid entry, clearing the parent slot of each. The root
    /// is kept.
    pub fn prune(&mut self, va: usize, npages: usize) -> VmResult<()> {
        if va % PAGE_SIZE != 0 {
            return Err(Fatal::Misaligned { va, size: npages * PAGE_SIZE }.into());
        }
        if npages == 0 || va >= MAXVA {
            return Ok(());
        }
        let end = npages
            .checked_mul(PAGE_SIZE)
            .and_then(|len| va.checked_add(len))
            .map_or(MAXVA, |end| end.min(MAXVA));
        let root = self.root;
        self.prune_node(root, PT_LEVELS - 1, 0, va, end);
        Ok(())
    }

    /// Prunes the children of `table` overlapping `[start, end)` and reports
    /// whether `table` is empty afterwards.
    fn prune_node(
        &mut self,
        table: usize,
        level: usize,
        base: usize,
        start: usize,
        end: usize,
    ) -> bool {
        if level > 0 {
            let span = 1usize << (PAGE_SHIFT + 9 * level);
            for index in 0..PT_ENTRIES {
                let lo = base + index * span;
                if lo + span <= start || lo >= end {
                    continue;
                }
                let slot = PteSlot::new(table, index);
                if let Entry::Table(child) = self.load(slot) {
                    if self.prune_node(child.pa(), level - 1, lo, start, end) {
                        self.store(slot, Entry::Invalid);
                        self.mem.free_page(child.pa());
                    }
                }
            }
        }
        (0..PT_ENTRIES).all(|index| !self.load(PteSlot::new(table, index)).is_valid())
    }

    /// Removes the USER bit from an existing leaf (stack guard page).
    pub fn clear_user(&mut self, va: usize) -> VmResult<()> {
        let slot = match self.find(va) {
            Ok(slot) => slot,
            Err(VmError::LookupMiss { .. }) => {
                return Err(Fatal::MissingPte { what: "clear_user", va }.into())
            }
            Err(err) => return Err(err),
        };
        match self.load(slot) {
            Entry::Leaf { pa, flags } => {
                self.store(slot, Entry::Leaf { pa, flags: flags - PageFlags::USER });
                Ok(())
            }
            Entry::Invalid => Err(Fatal::MissingPte { what: "clear_user", va }.into()),
            Entry::Table(_) => Err(Fatal::NotALeaf { va }.into()),
        }
    }

    /// Frees every node bottom-up, then the root.
    ///
    /// All leaves must have been unmapped beforehand; a surviving leaf is
    /// reported as [`Fatal::FreeLeaf`].
    pub fn free(mut self) -> VmResult<()> {
        self.release()
    }

    /// In-place form of [`PageTable::free`]; the table must not be used
    /// afterwards.
    pub(crate) fn release(&mut self) -> VmResult<()> {
        let root = self.root;
        self.free_node(root)
    }

    fn free_node(&mut self, table: usize) -> VmResult<()> {
        for index in 0..PT_ENTRIES {
            let slot = PteSlot::new(table, index);
            match self.load(slot) {
                Entry::Invalid => {}
                Entry::Table(child) => {
                    self.free_node(child.pa())?;
                    self.store(slot, Entry::Invalid);
                }
                Entry::Leaf { .. } => return Err(Fatal::FreeLeaf { table, index }.into()),
            }
        }
        self.mem.free_page(table);
        Ok(())
    }

    /// Checks the owning-tree invariant: every node is linked exactly once
    /// and leaves only appear at level 0.
    pub fn verify(&self) -> VmResult<()> {
        let mut seen = BTreeSet::new();
        seen.insert(self.root);
        self.verify_node(self.root, PT_LEVELS - 1, 0, &mut seen)
    }

    fn verify_node(
        &self,
        table: usize,
        level: usize,
        va_base: usize,
        seen: &mut BTreeSet<usize>,
    ) -> VmResult<()> {
        for index in 0..PT_ENTRIES {
            let va = va_base | (index << (PAGE_SHIFT + 9 * level));
            match self.load(PteSlot::new(table, index)) {
                Entry::Invalid => {}
                Entry::Leaf { .. } if level == 0 => {}
                Entry::Leaf { .. } => return Err(Fatal::UnexpectedLeaf { va, level }.into()),
                Entry::Table(_) if level == 0 => return Err(Fatal::NotALeaf { va }.into()),
                Entry::Table(child) => {
                    if !seen.insert(child.pa()) {
                        return Err(Fatal::SharedTable { table: child.pa() }.into());
                    }
                    self.verify_node(child.pa(), level - 1, va, seen)?;
                }
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for PageTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTable").field("root", &format_args!("{:#x}", self.root)).finish()
    }
}

/// Index field of `va` for `level` (2 = root).
#[inline]
pub const fn px(level: usize, va: usize) -> usize {
    (va >> (PAGE_SHIFT + 9 * level)) & (PT_ENTRIES - 1)
}
