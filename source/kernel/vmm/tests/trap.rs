// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Integration tests for the user trap path and lazy page faults
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Stable
//!
//! TEST_SCOPE:
//!   - Page faults routed into the fault resolver
//!   - Kill-on-fault semantics and the return path
//!   - Syscall entry (sepc advance, interrupts on)
//!   - Timer and device interrupts
//!
//! TEST_SCENARIOS:
//!   - lazy_fault_resumes_with_zeroed_page(): Verify a fault below size installs a page
//!   - fault_beyond_size_kills(): Verify out-of-range faults exit with -1
//!   - fault_on_mapped_page_kills(): Verify protection faults are not resolved again
//!   - fault_without_address_space_kills(): Verify a bare process is killed
//!   - syscall_advances_sepc_and_enables_interrupts(): Verify syscall entry
//!   - killed_process_skips_syscall(): Verify dispatch is skipped once killed
//!   - illegal_instruction_kills(): Verify unknown user exceptions kill
//!   - timer_requests_yield(): Verify the timer tick path
//!
//! DEPENDENCIES:
//!   - vmm::trap::usertrap: trap entry under test
//!   - CountingSyscalls / CountingDevices: collaborator doubles

mod common;

use common::{pool, user_space};
use vmm::arch::Cpu;
use vmm::mm::uaccess::copy_in;
use vmm::mm::{FrameAllocator, PageFlags, PAGE_SIZE};
use vmm::proc::Process;
use vmm::trap::{
    usertrap, DeviceInterrupts, SyscallHandler, TrapContext, TrapFrame, TrapInfo, UserReturn,
};
use vmm::types::Pid;

const INTERRUPT: usize = 1 << (usize::BITS - 1);
const ILLEGAL_INSTRUCTION: usize = 2;
const ECALL_FROM_U: usize = 8;
const LOAD_PAGE_FAULT: usize = 13;
const STORE_PAGE_FAULT: usize = 15;

#[derive(Default)]
struct CountingSyscalls {
    calls: usize,
    interrupts_on: bool,
}

impl SyscallHandler for CountingSyscalls {
    fn dispatch(&mut self, cpu: &mut Cpu, proc: &mut Process) {
        self.calls += 1;
        self.interrupts_on = cpu.intr_get();
        proc.trapframe.set_x(TrapFrame::A0, 42);
    }
}

#[derive(Default)]
struct CountingDevices {
    external: usize,
    ticks: usize,
}

impl DeviceInterrupts for CountingDevices {
    fn external(&mut self) {
        self.external += 1;
    }

    fn tick(&mut self) {
        self.ticks += 1;
    }
}

fn trap(scause: usize, stval: usize) -> TrapInfo {
    TrapInfo { scause, stval, sepc: 0x1000 }
}

fn run(proc: &mut Process, info: TrapInfo) -> (UserReturn, CountingSyscalls, CountingDevices) {
    let mut syscalls = CountingSyscalls::default();
    let mut devices = CountingDevices::default();
    let mut cpu = Cpu::new();
    let ret = {
        let mut ctx = TrapContext { syscalls: &mut syscalls, devices: &mut devices };
        usertrap(&mut ctx, &mut cpu, proc, info)
    };
    assert!(!cpu.intr_get(), "interrupts are off on the way out");
    (ret, syscalls, devices)
}

fn lazy_process(mem: &vmm::mm::MemRef, pages: usize) -> Process {
    let mut proc = Process::new(Pid::from_raw(3), b"lazy");
    proc.install_space(user_space(mem));
    proc.grow_lazy((pages * PAGE_SIZE) as isize).expect("reserve");
    proc
}

#[test]
fn lazy_fault_resumes_with_zeroed_page() {
    let (pool, mem) = pool(32);
    let mut proc = lazy_process(&mem, 4);
    let satp = proc.space().expect("space").satp();
    let free = pool.free_pages();

    let (ret, _, _) = run(&mut proc, trap(STORE_PAGE_FAULT, 2 * PAGE_SIZE + 8));

    assert_eq!(ret, UserReturn::Resume { epc: 0x1000, satp });
    assert!(!proc.killed());
    assert!(pool.free_pages() < free);
    let space = proc.space_mut().expect("space");
    let page = space.page_table().lookup(2 * PAGE_SIZE).expect("installed");
    assert!(page.flags.contains(PageFlags::USER_RW));
    let mut bytes = [0xffu8; 16];
    copy_in(space, &mut bytes, 2 * PAGE_SIZE).expect("read");
    assert_eq!(bytes, [0; 16]);

    let (ret, _, _) = run(&mut proc, trap(LOAD_PAGE_FAULT, 0));
    assert!(matches!(ret, UserReturn::Resume { .. }));
}

#[test]
fn fault_beyond_size_kills() {
    let (pool, mem) = pool(32);
    let mut proc = lazy_process(&mem, 1);
    let free = pool.free_pages();

    let (ret, _, _) = run(&mut proc, trap(STORE_PAGE_FAULT, PAGE_SIZE));

    assert_eq!(ret, UserReturn::Exit { status: -1 });
    assert!(proc.killed());
    assert_eq!(pool.free_pages(), free);
    assert_eq!(proc.trapframe.stval, PAGE_SIZE);
}

#[test]
fn fault_on_mapped_page_kills() {
    let (_pool, mem) = pool(32);
    let mut proc = lazy_process(&mem, 2);
    let (ret, _, _) = run(&mut proc, trap(LOAD_PAGE_FAULT, 16));
    assert!(matches!(ret, UserReturn::Resume { .. }));

    let (ret, _, _) = run(&mut proc, trap(STORE_PAGE_FAULT, 16));
    assert_eq!(ret, UserReturn::Exit { status: -1 });
}

#[test]
fn fault_without_address_space_kills() {
    let mut proc = Process::new(Pid::from_raw(4), b"bare");
    let (ret, _, _) = run(&mut proc, trap(LOAD_PAGE_FAULT, 0));
    assert_eq!(ret, UserReturn::Exit { status: -1 });
    assert!(proc.killed());
}

#[test]
fn syscall_advances_sepc_and_enables_interrupts() {
    let (_pool, mem) = pool(32);
    let mut proc = lazy_process(&mem, 1);

    let (ret, syscalls, _) = run(&mut proc, trap(ECALL_FROM_U, 0));

    assert_eq!(syscalls.calls, 1);
    assert!(syscalls.interrupts_on);
    assert_eq!(proc.trapframe.sepc, 0x1004);
    assert_eq!(proc.trapframe.arg(0), 42);
    assert!(matches!(ret, UserReturn::Resume { epc: 0x1004, .. }));
}

#[test]
fn killed_process_skips_syscall() {
    let (_pool, mem) = pool(32);
    let mut proc = lazy_process(&mem, 1);
    proc.kill();

    let (ret, syscalls, _) = run(&mut proc, trap(ECALL_FROM_U, 0));

    assert_eq!(syscalls.calls, 0);
    assert_eq!(ret, UserReturn::Exit { status: -1 });
}

#[test]
fn illegal_instruction_kills() {
    let (_pool, mem) = pool(32);
    let mut proc = lazy_process(&mem, 1);
    let (ret, _, _) = run(&mut proc, trap(ILLEGAL_INSTRUCTION, 0));
    assert_eq!(ret, UserReturn::Exit { status: -1 });
}

#[test]
fn timer_requests_yield() {
    let (_pool, mem) = pool(32);
    let mut proc = lazy_process(&mem, 1);

    let (ret, _, devices) = run(&mut proc, trap(INTERRUPT | 5, 0));
    assert_eq!(devices.ticks, 1);
    assert!(proc.take_yield_request());
    assert!(matches!(ret, UserReturn::Resume { .. }));

    let (_, _, devices) = run(&mut proc, trap(INTERRUPT | 9, 0));
    assert_eq!(devices.external, 1);
    assert!(!proc.take_yield_request());
}
