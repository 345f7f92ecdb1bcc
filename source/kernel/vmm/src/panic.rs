// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Opt-in panic handler for bare-metal images linking this crate
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std, feature `panic_handler`)
//! DEPENDS_ON: diag::log, arch::riscv::wait_for_interrupt
//! INVARIANTS: Minimal formatting; no allocations; never returns

use core::panic::PanicInfo;

/// Emits the panic location and message, then parks the hart.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    match info.location() {
        Some(location) => log_error!(
            target: "panic",
            "PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        ),
        None => log_error!(target: "panic", "PANIC: {}", info.message()),
    }
    loop {
        crate::arch::riscv::wait_for_interrupt();
    }
}
