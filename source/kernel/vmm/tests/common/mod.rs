// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared doubles for the integration tests: a RAM-backed file system, an
//! ELF64 image builder, and frame pool setup.

#![allow(dead_code)]

use std::io::Cursor;
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, WriteBytesExt};
use goblin::elf::header::{ELFCLASS64, ELFDATA2LSB, EM_RISCV, ET_EXEC};
use goblin::elf::program_header::PT_LOAD;
use vmm::fs::{Inode, Storage};
use vmm::mm::{AddressSpace, FramePool, MemRef};

pub const POOL_BASE: usize = 0x8800_0000;
/// Kernel-owned trampoline frame; never read or written by the tests.
pub const TRAMPOLINE_PA: usize = 0x8000_1000;

pub fn pool(pages: usize) -> (Arc<FramePool>, MemRef) {
    let pool = Arc::new(FramePool::new(POOL_BASE, pages));
    let mem: MemRef = pool.clone();
    (pool, mem)
}

pub fn user_space(mem: &MemRef) -> AddressSpace {
    AddressSpace::new_user(mem.clone(), TRAMPOLINE_PA).expect("user space")
}

/// One LOAD segment of a generated image.
pub struct Segment {
    pub flags: u32,
    pub vaddr: u64,
    pub offset: u64,
    pub data: Vec<u8>,
    pub memsz: u64,
}

/// Builds a little-endian RISC-V ELF64 executable.
pub fn elf_image(entry: u64, segments: &[Segment]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    let mut e_ident = [0u8; 16];
    e_ident[..4].copy_from_slice(b"\x7fELF");
    e_ident[4] = ELFCLASS64;
    e_ident[5] = ELFDATA2LSB;
    e_ident[6] = 1;
    cursor.get_mut().extend_from_slice(&e_ident);
    cursor.set_position(16);
    cursor.write_u16::<LittleEndian>(ET_EXEC).unwrap();
    cursor.write_u16::<LittleEndian>(EM_RISCV).unwrap();
    cursor.write_u32::<LittleEndian>(1).unwrap(); // e_version
    cursor.write_u64::<LittleEndian>(entry).unwrap();
    cursor.write_u64::<LittleEndian>(0x40).unwrap(); // e_phoff
    cursor.write_u64::<LittleEndian>(0).unwrap(); // e_shoff
    cursor.write_u32::<LittleEndian>(0).unwrap(); // e_flags
    cursor.write_u16::<LittleEndian>(64).unwrap(); // e_ehsize
    cursor.write_u16::<LittleEndian>(56).unwrap(); // e_phentsize
    cursor.write_u16::<LittleEndian>(segments.len() as u16).unwrap();
    cursor.write_u16::<LittleEndian>(0).unwrap(); // e_shentsize
    cursor.write_u16::<LittleEndian>(0).unwrap(); // e_shnum
    cursor.write_u16::<LittleEndian>(0).unwrap(); // e_shstrndx
    for seg in segments {
        cursor.write_u32::<LittleEndian>(PT_LOAD).unwrap();
        cursor.write_u32::<LittleEndian>(seg.flags).unwrap();
        cursor.write_u64::<LittleEndian>(seg.offset).unwrap();
        cursor.write_u64::<LittleEndian>(seg.vaddr).unwrap();
        cursor.write_u64::<LittleEndian>(seg.vaddr).unwrap(); // p_paddr
        cursor.write_u64::<LittleEndian>(seg.data.len() as u64).unwrap();
        cursor.write_u64::<LittleEndian>(seg.memsz).unwrap();
        cursor.write_u64::<LittleEndian>(0x1000).unwrap(); // p_align
    }
    let mut image = cursor.into_inner();
    for seg in segments {
        let start = seg.offset as usize;
        let end = start + seg.data.len();
        if image.len() < end {
            image.resize(end, 0);
        }
        image[start..end].copy_from_slice(&seg.data);
    }
    image
}

/// File system double holding whole files in memory and journaling calls.
#[derive(Default)]
pub struct RamFs {
    files: Mutex<Vec<(Vec<u8>, Vec<u8>)>>,
    events: Mutex<Vec<String>>,
}

impl RamFs {
    pub fn with_file(path: &[u8], data: Vec<u8>) -> Self {
        let fs = Self::default();
        fs.add(path, data);
        fs
    }

    pub fn add(&self, path: &[u8], data: Vec<u8>) {
        self.files.lock().unwrap().push((path.to_vec(), data));
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// True when every transaction ended and every open inode was closed.
    pub fn balanced(&self) -> bool {
        let events = self.events();
        let count = |name: &str| events.iter().filter(|e| e.starts_with(name)).count();
        count("begin") == count("end") && count("open") == count("close")
    }

    fn log(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl Storage for RamFs {
    fn begin_op(&self) {
        self.log("begin".into());
    }

    fn end_op(&self) {
        self.log("end".into());
    }

    fn open(&self, path: &[u8]) -> Option<Inode> {
        let files = self.files.lock().unwrap();
        let index = files.iter().position(|(name, _)| name == path)?;
        self.log(format!("open {index}"));
        Some(Inode::from_raw(index as u32))
    }

    fn lock(&self, _ip: Inode) {}

    fn unlock(&self, _ip: Inode) {}

    fn read(&self, ip: Inode, dst: &mut [u8], offset: u64) -> usize {
        let files = self.files.lock().unwrap();
        let Some((_, data)) = files.get(ip.as_raw() as usize) else {
            return 0;
        };
        let start = (offset as usize).min(data.len());
        let n = dst.len().min(data.len() - start);
        dst[..n].copy_from_slice(&data[start..start + n]);
        n
    }

    fn close(&self, ip: Inode) {
        self.log(format!("close {}", ip.as_raw()));
    }
}
