// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Single system-halt path for invariant violations
//! OWNERS: @kernel-team
//! PUBLIC API: halt(&Fatal), OrHalt
//! DEPENDS_ON: diag::log
//! INVARIANTS: Every Fatal is logged once before the hart stops; recoverable errors pass through

use crate::mm::{Fatal, VmError};

/// Logs `fatal` and stops the system.
#[track_caller]
pub fn halt(fatal: &Fatal) -> ! {
    log_error!(target: "halt", "unrecoverable memory fault: {}", fatal);
    panic!("fatal: {}", fatal);
}

/// Routes [`VmError::Fatal`] into [`halt`] and returns everything else.
pub trait OrHalt<T> {
    fn or_halt(self) -> Result<T, VmError>;
}

impl<T> OrHalt<T> for Result<T, VmError> {
    #[track_caller]
    fn or_halt(self) -> Result<T, VmError> {
        match self {
            Err(VmError::Fatal(fatal)) => halt(&fatal),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_errors_pass_through() {
        let miss: Result<(), VmError> = Err(VmError::LookupMiss { va: 0x1000 });
        assert_eq!(miss.or_halt(), Err(VmError::LookupMiss { va: 0x1000 }));
        assert_eq!(Ok::<_, VmError>(7).or_halt(), Ok(7));
    }

    #[test]
    #[should_panic(expected = "fatal: remap of valid entry")]
    fn fatal_errors_halt() {
        let remap: Result<(), VmError> = Err(Fatal::Remap { va: 0x2000 }.into());
        let _ = remap.or_halt();
    }
}
