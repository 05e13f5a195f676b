//! The memory-management and scheduling core of a small x86_64 kernel.
//!
//! Two tightly coupled subsystems live here: the virtual/physical memory manager (a bitmap
//! frame allocator plus 4-level page-table address spaces) and the preemptive FIFO scheduler
//! with its context-switch contract. A scheduled process cannot run without a valid address
//! space, and an address space is never destroyed while a process that might be switched to
//! still holds it; [`KernelCore`] ties the two together under one explicit init lifecycle.
//!
//! Boot descriptor tables, interrupt dispatch, drivers, the heap allocator and the syscall
//! marshalling layer are external collaborators, consumed through narrow seams: the platform
//! memory map (`bootinfo`), the [`TranslatePhys`](mm::pt::TranslatePhys) translator, the
//! [`AddrSpaceOps`](mm::aspace::AddrSpaceOps) hardware hooks and the
//! [`SwitchOps`](arch::context::SwitchOps) switch primitive. The same seams let the whole
//! core run hosted under the test suite.

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod arch;
pub mod err;
pub mod mm;
pub mod proc;
pub mod sync;

use core::ops::Range;

use alloc::sync::Arc;

use bootinfo::item::MemoryRange;

use arch::context::SwitchOps;
use err::Result;
use mm::aspace::{AddrSpace, AddrSpaceManager, AddrSpaceOps};
use mm::pmm::FrameAllocator;
use mm::pt::TranslatePhys;
use mm::types::{PhysAddr, PhysFrameNum, Protection, VirtAddr};
use proc::process::{Pid, ProcessTable, UserImage};
use proc::sched::Scheduler;
use sync::irq::IrqDisabled;

/// The whole core as one explicitly constructed, explicitly owned object.
///
/// The components are public: operations confined to one subsystem go straight to the field
/// (`core.spaces.map_range(&mut core.frames, ..)`), while the methods here cover the paths
/// that must keep several subsystems consistent.
pub struct KernelCore<T, O, S> {
    pub frames: FrameAllocator,
    pub spaces: AddrSpaceManager<T, O>,
    pub processes: ProcessTable,
    pub sched: Scheduler<S>,
}

impl<T: TranslatePhys + Clone, O: AddrSpaceOps, S: SwitchOps> KernelCore<T, O, S> {
    /// Initializes the core bottom-up: frame allocator over the platform memory map, the
    /// kernel address space, the process table with idle bootstrapped, and the scheduler.
    ///
    /// # Safety
    ///
    /// `translator` must provide correct virtual page numbers for every frame the memory map
    /// reports usable, for the lifetime of the core.
    pub unsafe fn new(
        mem_map: &[MemoryRange],
        reserved: &[Range<PhysFrameNum>],
        translator: T,
        aspace_ops: O,
        switch: S,
        idle_entry: extern "C" fn(usize),
        quantum: u32,
        _irq: &IrqDisabled,
    ) -> Result<Self> {
        let mut frames = FrameAllocator::new(mem_map, reserved)?;
        let spaces = unsafe { AddrSpaceManager::new(&mut frames, translator, aspace_ops)? };
        let processes = ProcessTable::new(idle_entry)?;
        let sched = Scheduler::new(&processes, switch, quantum);

        Ok(Self {
            frames,
            spaces,
            processes,
            sched,
        })
    }

    /// Creates a kernel process and hands it to the scheduler.
    pub fn spawn(
        &mut self,
        name: &str,
        entry: extern "C" fn(usize),
        arg: usize,
        irq: &IrqDisabled,
    ) -> Result<Pid> {
        let pid = self.processes.create(name, entry, arg)?;
        let pcb = Arc::clone(self.processes.get(pid).expect("just-created pid missing"));
        self.sched.add(&pcb, irq);
        Ok(pid)
    }

    /// Creates a user process owning `space` and hands it to the scheduler.
    pub fn spawn_user(
        &mut self,
        name: &str,
        entry: extern "C" fn(usize),
        arg: usize,
        space: AddrSpace,
        image: UserImage,
        irq: &IrqDisabled,
    ) -> Result<Pid> {
        let pid = self.processes.create_user(name, entry, arg, space, image)?;
        let pcb = Arc::clone(self.processes.get(pid).expect("just-created pid missing"));
        self.sched.add(&pcb, irq);
        Ok(pid)
    }

    pub fn create_address_space(&mut self, _irq: &IrqDisabled) -> Result<AddrSpace> {
        self.spaces.create_address_space(&mut self.frames)
    }

    pub fn destroy_address_space(&mut self, space: AddrSpace, _irq: &IrqDisabled) {
        self.spaces.destroy_address_space(&mut self.frames, space);
    }

    /// Maps one page of a user image: code read-only, stacks read-write and non-executable,
    /// as the protection argument dictates.
    pub fn map_user(
        &mut self,
        space: AddrSpace,
        virt: VirtAddr,
        phys: PhysAddr,
        prot: Protection,
        _irq: &IrqDisabled,
    ) -> Result<()> {
        self.spaces.map_user(&mut self.frames, space, virt, phys, prot)
    }

    pub fn tick(&mut self, irq: &IrqDisabled) {
        self.sched.tick(&self.processes, irq);
    }

    pub fn start(&mut self, irq: &IrqDisabled) {
        self.sched.start(irq);
    }

    pub fn yield_now(&mut self, irq: &IrqDisabled) {
        self.sched.yield_now(irq);
    }

    pub fn block(&mut self, irq: &IrqDisabled) {
        self.sched.block(irq);
    }

    pub fn unblock(&mut self, pid: Pid, irq: &IrqDisabled) {
        self.sched.unblock(&self.processes, pid, irq);
    }

    pub fn sleep(&mut self, ticks: u64, irq: &IrqDisabled) {
        self.sched.sleep(ticks, irq);
    }

    pub fn exit(&mut self, code: i32, irq: &IrqDisabled) {
        self.sched.exit(code, irq);
    }

    pub fn current_pid(&self) -> Pid {
        self.sched.current_pid()
    }
}
