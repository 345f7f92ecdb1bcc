// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0
//! Trap classification and the user/kernel trap paths that route page faults
//! into the fault resolver.
//!
//! The assembly vector saves user registers into [`TrapFrame`] and calls
//! [`usertrap`] with the trap CSRs; the returned [`UserReturn`] tells the
//! trampoline whether to resume the process or terminate it.

use crate::arch::Cpu;
use crate::halt::{halt, OrHalt};
use crate::mm::{resolve_fault, Access, Fatal, VmError};
use crate::proc::Process;

const INTERRUPT_FLAG: usize = usize::MAX - (usize::MAX >> 1);

/// Saved user register state.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// x0..x31 (x0 is always 0; we never write it).
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
}

impl TrapFrame {
    pub const SP: usize = 2;
    pub const A0: usize = 10;
    pub const A1: usize = 11;
    pub const A7: usize = 17;

    #[inline]
    pub fn sp(&self) -> usize {
        self.x[Self::SP]
    }

    /// Syscall argument register `a<n>`.
    #[inline]
    pub fn arg(&self, n: usize) -> usize {
        self.x[Self::A0 + n]
    }

    #[inline]
    pub fn set_x(&mut self, rd: usize, value: usize) {
        if rd != 0 && rd < 32 {
            self.x[rd] = value;
        }
    }
}

/// Interrupt sources distinguished by the trap path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    Software,
    Timer,
    External,
    Other(usize),
}

/// Classified `scause`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapCause {
    SystemCall,
    LoadPageFault,
    StorePageFault,
    IllegalInstruction,
    Interrupt(Interrupt),
    Unknown(usize),
}

impl TrapCause {
    pub fn from_scause(scause: usize) -> Self {
        let code = scause & !INTERRUPT_FLAG;
        if is_interrupt(scause) {
            return TrapCause::Interrupt(match code {
                1 => Interrupt::Software,
                5 => Interrupt::Timer,
                9 => Interrupt::External,
                other => Interrupt::Other(other),
            });
        }
        match code {
            2 => TrapCause::IllegalInstruction,
            8 => TrapCause::SystemCall,
            13 => TrapCause::LoadPageFault,
            15 => TrapCause::StorePageFault,
            _ => TrapCause::Unknown(scause),
        }
    }
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

pub fn describe_cause(scause: usize) -> &'static str {
    let code = scause & (usize::MAX >> 1);
    if is_interrupt(scause) {
        match code {
            1 => "SupervisorSoftInt",
            5 => "SupervisorTimerInt",
            9 => "SupervisorExternalInt",
            _ => "Interrupt",
        }
    } else {
        match code {
            0 => "InstructionAddressMisaligned",
            1 => "InstructionAccessFault",
            2 => "IllegalInstruction",
            3 => "Breakpoint",
            4 => "LoadAddressMisaligned",
            5 => "LoadAccessFault",
            6 => "StoreAMOAddressMisaligned",
            7 => "StoreAMOAccessFault",
            8 => "EnvironmentCallFromUMode",
            9 => "EnvironmentCallFromSMode",
            12 => "InstructionPageFault",
            13 => "LoadPageFault",
            15 => "StoreAMOPageFault",
            _ => "Exception",
        }
    }
}

/// System call dispatcher invoked with interrupts enabled.
pub trait SyscallHandler {
    fn dispatch(&mut self, cpu: &mut Cpu, proc: &mut Process);
}

/// Device interrupt sinks.
pub trait DeviceInterrupts {
    /// Claims and services one external (PLIC) interrupt.
    fn external(&mut self);
    /// Advances the tick counter.
    fn tick(&mut self);
}

/// Collaborators reachable from the trap path.
pub struct TrapContext<'a> {
    pub syscalls: &'a mut dyn SyscallHandler,
    pub devices: &'a mut dyn DeviceInterrupts,
}

/// Trap CSRs captured by the assembly vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrapInfo {
    pub scause: usize,
    pub stval: usize,
    pub sepc: usize,
}

/// What the return path does once trap handling is complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserReturn {
    /// Jump back to user mode at `epc` with `satp` installed.
    Resume { epc: usize, satp: usize },
    /// The process was killed; exit with `status`.
    Exit { status: i32 },
}

/// Device interrupt classification result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevIntr {
    Device,
    Timer,
}

/// Services a device interrupt if `scause` names one.
pub fn devintr(devices: &mut dyn DeviceInterrupts, scause: usize) -> Option<DevIntr> {
    match TrapCause::from_scause(scause) {
        TrapCause::Interrupt(Interrupt::External) => {
            devices.external();
            Some(DevIntr::Device)
        }
        TrapCause::Interrupt(Interrupt::Software | Interrupt::Timer) => {
            devices.tick();
            Some(DevIntr::Timer)
        }
        _ => None,
    }
}

/// Handles a trap taken from user mode.
///
/// Faults that cannot be resolved only mark the process killed; termination
/// happens in [`prepare_return`] once the trap has been fully handled.
pub fn usertrap(
    ctx: &mut TrapContext<'_>,
    cpu: &mut Cpu,
    proc: &mut Process,
    trap: TrapInfo,
) -> UserReturn {
    proc.trapframe.sepc = trap.sepc;
    proc.trapframe.scause = trap.scause;
    proc.trapframe.stval = trap.stval;

    match TrapCause::from_scause(trap.scause) {
        TrapCause::SystemCall => {
            if proc.killed() {
                return prepare_return(cpu, proc);
            }
            proc.trapframe.sepc += 4;
            cpu.intr_on();
            ctx.syscalls.dispatch(cpu, proc);
        }
        cause @ (TrapCause::LoadPageFault | TrapCause::StorePageFault) => {
            let access =
                if cause == TrapCause::StorePageFault { Access::Write } else { Access::Read };
            page_fault(proc, trap.stval, access);
        }
        TrapCause::IllegalInstruction => {
            log_warn!(
                target: "trap",
                "pid {} {}: illegal instruction at {:#x}",
                proc.pid(),
                proc.name_str(),
                trap.sepc
            );
            proc.kill();
        }
        TrapCause::Interrupt(_) | TrapCause::Unknown(_) => match devintr(ctx.devices, trap.scause) {
            Some(DevIntr::Timer) => proc.request_yield(),
            Some(DevIntr::Device) => {}
            None => {
                log_warn!(
                    target: "trap",
                    "pid {}: unexpected scause {:#x} ({}) sepc={:#x} stval={:#x}",
                    proc.pid(),
                    trap.scause,
                    describe_cause(trap.scause),
                    trap.sepc,
                    trap.stval
                );
                proc.kill();
            }
        },
    }
    prepare_return(cpu, proc)
}

fn page_fault(proc: &mut Process, va: usize, access: Access) {
    let result = match proc.space_mut() {
        Some(space) => resolve_fault(space, va, access),
        None => Err(VmError::NoAddressSpace),
    };
    if let Err(err) = result.or_halt() {
        let kind = match access {
            Access::Read => "load",
            Access::Write => "store",
        };
        log_warn!(
            target: "trap",
            "pid {} {}: {} access fault va {:#x}: {}",
            proc.pid(),
            proc.name_str(),
            kind,
            va,
            err
        );
        proc.kill();
    }
}

/// Final step before leaving the kernel for user mode.
pub fn prepare_return(cpu: &mut Cpu, proc: &Process) -> UserReturn {
    cpu.intr_off();
    if proc.killed() {
        return UserReturn::Exit { status: -1 };
    }
    match proc.space() {
        Some(space) => UserReturn::Resume { epc: proc.trapframe.sepc, satp: space.satp() },
        None => UserReturn::Exit { status: -1 },
    }
}

/// Handles a trap taken in supervisor mode. Only device interrupts are
/// expected here; anything else halts. Returns true if the timer fired and the
/// current thread should yield.
pub fn kerneltrap(devices: &mut dyn DeviceInterrupts, scause: usize) -> bool {
    match devintr(devices, scause) {
        Some(DevIntr::Timer) => true,
        Some(DevIntr::Device) => false,
        None => halt(&Fatal::UnexpectedKernelTrap { scause }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_exceptions_and_interrupts() {
        assert_eq!(TrapCause::from_scause(8), TrapCause::SystemCall);
        assert_eq!(TrapCause::from_scause(13), TrapCause::LoadPageFault);
        assert_eq!(TrapCause::from_scause(15), TrapCause::StorePageFault);
        assert_eq!(TrapCause::from_scause(2), TrapCause::IllegalInstruction);
        assert_eq!(TrapCause::from_scause(12), TrapCause::Unknown(12));
        assert_eq!(
            TrapCause::from_scause(INTERRUPT_FLAG | 9),
            TrapCause::Interrupt(Interrupt::External)
        );
        assert_eq!(
            TrapCause::from_scause(INTERRUPT_FLAG | 1),
            TrapCause::Interrupt(Interrupt::Software)
        );
        assert_eq!(
            TrapCause::from_scause(INTERRUPT_FLAG | 3),
            TrapCause::Interrupt(Interrupt::Other(3))
        );
        assert_eq!(describe_cause(15), "StoreAMOPageFault");
    }

    #[derive(Default)]
    struct Devices {
        external: usize,
        ticks: usize,
    }

    impl DeviceInterrupts for Devices {
        fn external(&mut self) {
            self.external += 1;
        }
        fn tick(&mut self) {
            self.ticks += 1;
        }
    }

    #[test]
    fn kerneltrap_services_devices() {
        let mut devices = Devices::default();
        assert!(!kerneltrap(&mut devices, INTERRUPT_FLAG | 9));
        assert!(kerneltrap(&mut devices, INTERRUPT_FLAG | 5));
        assert_eq!((devices.external, devices.ticks), (1, 1));
    }

    #[test]
    #[should_panic(expected = "kerneltrap: unexpected scause")]
    fn kerneltrap_halts_on_exception() {
        let mut devices = Devices::default();
        kerneltrap(&mut devices, 13);
    }

    #[test]
    fn set_x_never_writes_zero_register() {
        let mut frame = TrapFrame::default();
        frame.set_x(0, 5);
        frame.set_x(TrapFrame::A1, 9);
        assert_eq!(frame.x[0], 0);
        assert_eq!(frame.arg(1), 9);
    }
}
