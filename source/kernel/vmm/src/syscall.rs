// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall entry for exec: argument copy-in and dispatch
//! OWNERS: @kernel-team
//! PUBLIC API: SYSCALL_EXEC, sys_exec, ExecSyscalls
//! DEPENDS_ON: exec, mm::uaccess, trap::SyscallHandler
//! INVARIANTS: Arguments are copied into kernel buffers before the loader runs; failures
//!             return usize::MAX (-1) in a0 and leave the caller's image intact

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;

use crate::arch::Cpu;
use crate::config::{MAX_ARGS, MAX_PATH};
use crate::exec::{exec, ExecEnv, ExecError};
use crate::halt::OrHalt;
use crate::mm::uaccess::{copy_in_string, fetch_addr};
use crate::mm::{VmError, PAGE_SIZE};
use crate::proc::Process;
use crate::trap::{SyscallHandler, TrapFrame};

/// Public syscall numbers.
pub const SYSCALL_EXEC: usize = 7;

/// Value written to `a0` when a syscall fails.
const SYSCALL_ERROR: usize = usize::MAX;

/// `exec(path, argv)`: `path_va` points at a NUL-terminated path and
/// `argv_va` at a null-terminated array of string pointers.
pub fn sys_exec(
    env: &ExecEnv<'_>,
    proc: &mut Process,
    path_va: usize,
    argv_va: usize,
) -> Result<usize, ExecError> {
    let space = proc.space_mut().ok_or(VmError::NoAddressSpace)?;
    let mut path = [0u8; MAX_PATH];
    let path_len = copy_in_string(space, &mut path, path_va, MAX_PATH).or_halt()?;

    let mut args: Vec<Vec<u8>> = Vec::new();
    for index in 0.. {
        let slot = index * core::mem::size_of::<u64>();
        let va = argv_va
            .checked_add(slot)
            .ok_or(VmError::BoundsViolation { va: argv_va, limit: space.size() })?;
        let ptr = fetch_addr(space, va).or_halt()?;
        if ptr == 0 {
            break;
        }
        if args.len() == MAX_ARGS {
            return Err(ExecError::TooManyArgs);
        }
        let mut arg = vec![0u8; PAGE_SIZE];
        let len = copy_in_string(space, &mut arg, ptr as usize, PAGE_SIZE).or_halt()?;
        arg.truncate(len);
        args.push(arg);
    }

    let argv: Vec<&[u8]> = args.iter().map(Vec::as_slice).collect();
    exec(env, proc, &path[..path_len], &argv)
}

/// Dispatcher serving the exec syscall.
pub struct ExecSyscalls<'a> {
    env: ExecEnv<'a>,
}

impl<'a> ExecSyscalls<'a> {
    pub fn new(env: ExecEnv<'a>) -> Self {
        Self { env }
    }
}

impl SyscallHandler for ExecSyscalls<'_> {
    fn dispatch(&mut self, _cpu: &mut Cpu, proc: &mut Process) {
        let number = proc.trapframe.x[TrapFrame::A7];
        let ret = match number {
            SYSCALL_EXEC => {
                let (path, argv) = (proc.trapframe.arg(0), proc.trapframe.arg(1));
                sys_exec(&self.env, proc, path, argv).unwrap_or(SYSCALL_ERROR)
            }
            _ => {
                log_warn!(
                    target: "syscall",
                    "pid {} {}: unknown sys call {}",
                    proc.pid(),
                    proc.name_str(),
                    number
                );
                SYSCALL_ERROR
            }
        };
        proc.trapframe.set_x(TrapFrame::A0, ret);
    }
}
