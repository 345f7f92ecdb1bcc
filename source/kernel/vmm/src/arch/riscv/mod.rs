// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V hart state touched by the memory subsystem.
//!
//! The implementation follows the Sv39 privileged specification. Host builds
//! keep the same interface but only record the requested state so trap and
//! activation logic can be exercised in tests.

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use riscv::register::{satp, sstatus};

/// Per-hart view of the supervisor interrupt-enable bit and the active SATP.
#[derive(Debug, Default)]
pub struct Cpu {
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    sie: bool,
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    satp: usize,
}

impl Cpu {
    pub const fn new() -> Self {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        {
            Self {}
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        {
            Self { sie: false, satp: 0 }
        }
    }

    /// Enables supervisor interrupts.
    #[inline]
    pub fn intr_on(&mut self) {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        // SAFETY: callers enable interrupts only after trap state is saved.
        unsafe {
            sstatus::set_sie();
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        {
            self.sie = true;
        }
    }

    /// Disables supervisor interrupts.
    #[inline]
    pub fn intr_off(&mut self) {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        // SAFETY: masking interrupts cannot violate memory safety.
        unsafe {
            sstatus::clear_sie();
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        {
            self.sie = false;
        }
    }

    /// Returns whether supervisor interrupts are enabled.
    #[inline]
    pub fn intr_get(&self) -> bool {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        {
            sstatus::read().sie()
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        {
            self.sie
        }
    }

    /// Installs `value` in SATP and flushes stale translations.
    #[inline]
    pub fn write_satp(&mut self, value: usize) {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        // SAFETY: `value` selects a table that identity-maps the running kernel.
        unsafe {
            core::arch::asm!("sfence.vma zero, zero", options(nostack));
            satp::write(value);
            core::arch::asm!("sfence.vma zero, zero", options(nostack));
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        {
            self.satp = value;
        }
    }

    /// Currently installed SATP value.
    #[inline]
    pub fn satp(&self) -> usize {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        {
            satp::read().bits()
        }
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        {
            self.satp
        }
    }
}

/// Issues a WFI instruction or yields on the host.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "riscv64"))]
    {
        core::hint::spin_loop();
    }
}
