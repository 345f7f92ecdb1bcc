// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual memory subsystem for a single-hart RISC-V Sv39 kernel
//! OWNERS: @kernel-mm-team
//! PUBLIC API: mm (page tables, address spaces, copy layer, fault resolver), exec, trap, syscall
//! DEPENDS_ON: bitflags, spin, riscv, thiserror, goblin
//! INVARIANTS: Host builds link std only under test; all hardware access is target-gated

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod arch;
pub mod config;
pub mod exec;
pub mod fs;
pub mod halt;
pub mod mm;
pub mod mmap;
pub mod proc;
pub mod syscall;
pub mod trap;
pub mod types;

#[cfg(all(feature = "panic_handler", not(test), target_os = "none"))]
mod panic;
