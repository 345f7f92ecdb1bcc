// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Diagnostics (structured logging)
//! OWNERS: @kernel-team
//! PUBLIC API: log_* macros, log::{emit, set_max_level, install_sink}
//! DEPENDS_ON: spin::Once
//! INVARIANTS: Logging never allocates and never fails the caller

#[macro_use]
pub mod log;
