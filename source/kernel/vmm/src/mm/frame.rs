// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical page collaborator (allocator + frame access) and the frame pool
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator, PhysMemory, MemRef, FramePool
//! DEPENDS_ON: spin::Mutex
//! INVARIANTS: Pages are PAGE_SIZE and page aligned; a page is freed only by its owner;
//!             allocator state is internally synchronized for concurrent callers

extern crate alloc;

use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};

#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::PAGE_SIZE;

/// Hands out and accepts page-sized, page-aligned physical blocks.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one page, returning its physical address.
    fn allocate_page(&self) -> Option<usize>;
    /// Returns a page previously obtained from [`FrameAllocator::allocate_page`].
    fn free_page(&self, pa: usize);
    /// Number of pages currently available.
    fn free_pages(&self) -> usize;
}

/// Byte-level access to physical pages.
///
/// Only [`PhysMemory::with_page`] is required; the remaining helpers are built
/// on top of it. `pa` passed to `with_page` must be page aligned, the other
/// helpers accept any address but the accessed range must stay within one page.
pub trait PhysMemory: FrameAllocator {
    /// Runs `f` with exclusive access to the page at `pa`.
    fn with_page(&self, pa: usize, f: &mut dyn FnMut(&mut [u8]));

    /// Fills the page at `pa` with zeroes.
    fn zero_page(&self, pa: usize) {
        self.with_page(pa, &mut |page| page.fill(0));
    }

    /// Copies `dst.len()` bytes starting at `pa`.
    fn read(&self, pa: usize, dst: &mut [u8]) {
        let len = dst.len();
        let (base, off) = split(pa, len);
        self.with_page(base, &mut |page| dst.copy_from_slice(&page[off..off + len]));
    }

    /// Writes `src` starting at `pa`.
    fn write(&self, pa: usize, src: &[u8]) {
        let (base, off) = split(pa, src.len());
        self.with_page(base, &mut |page| page[off..off + src.len()].copy_from_slice(src));
    }

    /// Reads a little-endian 64-bit word.
    fn read_u64(&self, pa: usize) -> u64 {
        let mut raw = [0u8; 8];
        self.read(pa, &mut raw);
        u64::from_le_bytes(raw)
    }

    /// Writes a little-endian 64-bit word.
    fn write_u64(&self, pa: usize, value: u64) {
        self.write(pa, &value.to_le_bytes());
    }

    /// Copies a whole page from `src` to `dst`.
    fn copy_page(&self, dst: usize, src: usize) {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.read(src, &mut buf);
        self.write(dst, &buf);
    }
}

/// Shared handle to the physical memory collaborator.
pub type MemRef = Arc<dyn PhysMemory>;

fn split(pa: usize, len: usize) -> (usize, usize) {
    let base = pa & !(PAGE_SIZE - 1);
    let off = pa - base;
    assert!(off + len <= PAGE_SIZE, "phys access crosses a page: pa={:#x} len={}", pa, len);
    (base, off)
}

/// Byte pattern written into freed pages to expose dangling references.
const JUNK: u8 = 0x01;

struct FreeList {
    free: Vec<usize>,
    in_use: Vec<bool>,
}

/// Fixed arena of page frames starting at a base physical address.
///
/// Stands in for the kernel's page allocator: `allocate_page`/`free_page`
/// behave like `kalloc`/`kfree` and the frame contents live in host memory so
/// page tables and user data can be inspected by tests.
pub struct FramePool {
    base: usize,
    frames: Box<[Mutex<Box<[u8]>>]>,
    list: Mutex<FreeList>,
    #[cfg(feature = "failpoints")]
    fail_after: AtomicUsize,
}

impl FramePool {
    /// Creates a pool of `count` frames whose first frame sits at `base`.
    pub fn new(base: usize, count: usize) -> Self {
        assert!(base % PAGE_SIZE == 0, "frame pool base must be page aligned");
        let frames = (0..count)
            .map(|_| Mutex::new(vec![JUNK; PAGE_SIZE].into_boxed_slice()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        // Hand out low addresses first.
        let free = (0..count).rev().collect();
        Self {
            base,
            frames,
            list: Mutex::new(FreeList { free, in_use: vec![false; count] }),
            #[cfg(feature = "failpoints")]
            fail_after: AtomicUsize::new(usize::MAX),
        }
    }

    /// Total number of frames managed by the pool.
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Returns true if `pa` lies inside the pool.
    pub fn contains(&self, pa: usize) -> bool {
        pa >= self.base && (pa - self.base) / PAGE_SIZE < self.frames.len()
    }

    /// Makes every allocation after the next `allocations` successful ones fail
    /// until [`FramePool::clear_failpoint`] is called.
    #[cfg(feature = "failpoints")]
    pub fn fail_after(&self, allocations: usize) {
        self.fail_after.store(allocations, Ordering::SeqCst);
    }

    /// Disarms [`FramePool::fail_after`].
    #[cfg(feature = "failpoints")]
    pub fn clear_failpoint(&self) {
        self.fail_after.store(usize::MAX, Ordering::SeqCst);
    }

    #[cfg(feature = "failpoints")]
    fn failpoint_hit(&self) -> bool {
        self.fail_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => None,
                0 => None,
                n => Some(n - 1),
            })
            .map(|_| false)
            .unwrap_or_else(|left| left == 0)
    }

    #[cfg(not(feature = "failpoints"))]
    fn failpoint_hit(&self) -> bool {
        false
    }

    fn index_of(&self, pa: usize) -> usize {
        if pa % PAGE_SIZE != 0 || !self.contains(pa) {
            panic!("frame pool: foreign or misaligned page {:#x}", pa);
        }
        (pa - self.base) / PAGE_SIZE
    }
}

impl FrameAllocator for FramePool {
    fn allocate_page(&self) -> Option<usize> {
        if self.failpoint_hit() {
            return None;
        }
        let mut list = self.list.lock();
        let index = list.free.pop()?;
        list.in_use[index] = true;
        Some(self.base + index * PAGE_SIZE)
    }

    fn free_page(&self, pa: usize) {
        let index = self.index_of(pa);
        {
            let mut list = self.list.lock();
            if !list.in_use[index] {
                panic!("frame pool: double free of {:#x}", pa);
            }
            list.in_use[index] = false;
        }
        self.frames[index].lock().fill(JUNK);
        self.list.lock().free.push(index);
    }

    fn free_pages(&self) -> usize {
        self.list.lock().free.len()
    }
}

impl PhysMemory for FramePool {
    fn with_page(&self, pa: usize, f: &mut dyn FnMut(&mut [u8])) {
        let index = self.index_of(pa);
        let mut frame = self.frames[index].lock();
        f(&mut frame[..]);
    }
}
