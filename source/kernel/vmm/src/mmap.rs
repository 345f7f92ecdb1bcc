// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory-mapped file areas and their teardown collaborator
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MmapArea, MmapTeardown, MmapStub, MmapError
//! DEPENDS_ON: mm::AddressSpace, fs::Inode
//! INVARIANTS: Teardown through the stub never touches the address space and always reports
//!             NotImplemented, so callers must run their own unmap-and-close fallback

use thiserror::Error;

use crate::fs::Inode;
use crate::mm::{page_round_up, AddressSpace, PAGE_SIZE};

/// One tracked memory-mapped region of a process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MmapArea {
    pub used: bool,
    pub addr: usize,
    pub len: usize,
    pub file: Option<Inode>,
}

impl MmapArea {
    pub const EMPTY: Self = Self { used: false, addr: 0, len: 0, file: None };

    /// Pages covered by the area, counting a partial last page.
    pub fn pages(&self) -> usize {
        page_round_up(self.len) / PAGE_SIZE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum MmapError {
    #[error("memory-mapped files are not implemented")]
    NotImplemented,
    #[error("region {addr:#x}+{len:#x} could not be unmapped")]
    Unmap { addr: usize, len: usize },
}

/// Releases a memory-mapped region, writing back and closing as needed.
pub trait MmapTeardown: Send + Sync {
    fn teardown_region(&self, space: &mut AddressSpace, area: &MmapArea) -> Result<(), MmapError>;
}

/// Placeholder collaborator until file mappings exist.
#[derive(Clone, Copy, Debug, Default)]
pub struct MmapStub;

impl MmapTeardown for MmapStub {
    fn teardown_region(&self, _space: &mut AddressSpace, _area: &MmapArea) -> Result<(), MmapError> {
        Err(MmapError::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_round_partial_tail_up() {
        let area = MmapArea { used: true, addr: 0x4000_0000, len: PAGE_SIZE + 1, file: None };
        assert_eq!(area.pages(), 2);
        assert_eq!(MmapArea::EMPTY.pages(), 0);
        assert_eq!(MmapArea::default(), MmapArea::EMPTY);
    }
}
