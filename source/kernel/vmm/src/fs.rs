// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Storage collaborator used by the program loader
//! OWNERS: @kernel-fs-team
//! PUBLIC API: Storage, Inode, FsOp, LockedInode
//! INVARIANTS: Every begin_op is paired with end_op; every open inode is unlocked and closed
//!             before the transaction that opened it ends

/// Handle to an open inode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Inode(u32);

impl Inode {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// File system entry points the memory subsystem relies on.
pub trait Storage: Send + Sync {
    /// Starts a file system transaction.
    fn begin_op(&self);
    /// Ends the transaction started by [`Storage::begin_op`].
    fn end_op(&self);
    /// Resolves `path` to a referenced inode.
    fn open(&self, path: &[u8]) -> Option<Inode>;
    fn lock(&self, ip: Inode);
    fn unlock(&self, ip: Inode);
    /// Reads up to `dst.len()` bytes at `offset`; returns the count read.
    fn read(&self, ip: Inode, dst: &mut [u8], offset: u64) -> usize;
    /// Drops the reference taken by [`Storage::open`].
    fn close(&self, ip: Inode);
}

/// Open transaction; ends it on drop.
pub struct FsOp<'a> {
    storage: &'a dyn Storage,
}

impl<'a> FsOp<'a> {
    pub fn begin(storage: &'a dyn Storage) -> Self {
        storage.begin_op();
        Self { storage }
    }

    /// Opens and locks `path` inside this transaction.
    pub fn open(&self, path: &[u8]) -> Option<LockedInode<'_>> {
        let ip = self.storage.open(path)?;
        self.storage.lock(ip);
        Some(LockedInode { storage: self.storage, ip })
    }
}

impl Drop for FsOp<'_> {
    fn drop(&mut self) {
        self.storage.end_op();
    }
}

/// Locked, referenced inode; unlocks and closes on drop.
pub struct LockedInode<'a> {
    storage: &'a dyn Storage,
    ip: Inode,
}

impl LockedInode<'_> {
    pub fn inode(&self) -> Inode {
        self.ip
    }

    /// Reads up to `dst.len()` bytes at `offset`.
    pub fn read(&self, dst: &mut [u8], offset: u64) -> usize {
        self.storage.read(self.ip, dst, offset)
    }

    /// Reads exactly `dst.len()` bytes at `offset`.
    pub fn read_exact(&self, dst: &mut [u8], offset: u64) -> bool {
        self.read(dst, offset) == dst.len()
    }
}

impl Drop for LockedInode<'_> {
    fn drop(&mut self) {
        self.storage.unlock(self.ip);
        self.storage.close(self.ip);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{sync::Mutex, vec::Vec};

    use super::*;

    #[derive(Default)]
    struct Journal(Mutex<Vec<&'static str>>);

    impl Storage for Journal {
        fn begin_op(&self) {
            self.0.lock().expect("journal").push("begin");
        }
        fn end_op(&self) {
            self.0.lock().expect("journal").push("end");
        }
        fn open(&self, path: &[u8]) -> Option<Inode> {
            self.0.lock().expect("journal").push("open");
            (path == b"/init").then_some(Inode::from_raw(1))
        }
        fn lock(&self, _ip: Inode) {
            self.0.lock().expect("journal").push("lock");
        }
        fn unlock(&self, _ip: Inode) {
            self.0.lock().expect("journal").push("unlock");
        }
        fn read(&self, _ip: Inode, dst: &mut [u8], _offset: u64) -> usize {
            dst.fill(7);
            dst.len()
        }
        fn close(&self, _ip: Inode) {
            self.0.lock().expect("journal").push("close");
        }
    }

    #[test]
    fn guards_bracket_open_read_close() {
        let journal = Journal::default();
        {
            let op = FsOp::begin(&journal);
            let ip = op.open(b"/init").expect("found");
            let mut buf = [0u8; 4];
            assert!(ip.read_exact(&mut buf, 0));
            assert_eq!(buf, [7; 4]);
        }
        assert_eq!(
            *journal.0.lock().expect("journal"),
            ["begin", "open", "lock", "unlock", "close", "end"]
        );
    }

    #[test]
    fn missing_path_still_ends_transaction() {
        let journal = Journal::default();
        {
            let op = FsOp::begin(&journal);
            assert!(op.open(b"/missing").is_none());
        }
        assert_eq!(*journal.0.lock().expect("journal"), ["begin", "open", "end"]);
    }
}
