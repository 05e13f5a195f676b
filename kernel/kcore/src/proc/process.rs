//! Process control blocks and the fixed-capacity process table.

use core::cell::Cell;
use core::cmp;
use core::fmt;
use core::mem;

use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayString;
use intrusive_collections::{intrusive_adapter, LinkedListLink};
use log::debug;

use crate::arch::context;
use crate::err::{Error, Result};
use crate::mm::aspace::AddrSpace;
use crate::mm::types::VirtAddr;

pub type Pid = u32;

pub const MAX_PROCESSES: usize = 64;

const KERNEL_STACK_SIZE: usize = 0x8000;

const MAX_NAME_LEN: usize = 32;

/// An inline, fixed-length string holding a process name for debugging purposes.
///
/// The contents may be truncated and should not be relied upon for correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Name(ArrayString<MAX_NAME_LEN>);

impl Name {
    pub fn new(name: &str) -> Self {
        Self(ArrayString::from(&name[..cmp::min(name.len(), MAX_NAME_LEN)]).unwrap())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unused,
    Ready,
    Running,
    Blocked,
    Terminated,
}

/// A process's kernel stack: an owned block of memory with a precomputed, aligned top.
pub struct KernelStack {
    mem: Vec<u64>,
}

impl KernelStack {
    fn new() -> Result<Self> {
        let words = KERNEL_STACK_SIZE / mem::size_of::<u64>();
        let mut stack_mem = Vec::new();
        stack_mem.try_reserve_exact(words)?;
        stack_mem.resize(words, 0);
        Ok(Self { mem: stack_mem })
    }

    pub fn top(&self) -> VirtAddr {
        let end = self.mem.as_ptr() as usize + self.mem.len() * mem::size_of::<u64>();
        VirtAddr::new(end).align_down(16)
    }
}

/// Cached addresses for entering user mode, recorded when a process image is loaded.
#[derive(Debug, Clone, Copy)]
pub struct UserImage {
    pub entry: VirtAddr,
    pub stack: VirtAddr,
}

/// The kernel's record of one process.
///
/// Identity, the kernel stack and the address-space handle are fixed for the lifetime of one
/// slot occupancy; the scheduling fields are `Cell`s, mutated only from the single kernel
/// context under the interrupts-off discipline.
pub struct Pcb {
    run_queue_link: LinkedListLink,
    pid: Pid,
    name: Name,
    stack: KernelStack,
    space: Option<AddrSpace>,
    user_image: Option<UserImage>,

    state: Cell<State>,
    saved_sp: Cell<VirtAddr>,
    slice_left: Cell<u32>,
    total_ticks: Cell<u64>,
    wake_at: Cell<Option<u64>>,
    exit_code: Cell<Option<i32>>,
}

intrusive_adapter!(pub RunQueueAdapter = Arc<Pcb>: Pcb { run_queue_link: LinkedListLink });

impl Pcb {
    fn new(
        pid: Pid,
        name: Name,
        entry: extern "C" fn(usize),
        arg: usize,
        space: Option<AddrSpace>,
        user_image: Option<UserImage>,
    ) -> Result<Arc<Self>> {
        let stack = KernelStack::new()?;

        // Safety: the stack owns the memory below its top and nothing runs on it yet.
        let saved_sp = unsafe { context::init_stack(stack.top(), entry, arg) };

        Ok(Arc::new(Pcb {
            run_queue_link: LinkedListLink::new(),
            pid,
            name,
            stack,
            space,
            user_image,
            state: Cell::new(State::Unused),
            saved_sp: Cell::new(saved_sp),
            slice_left: Cell::new(0),
            total_ticks: Cell::new(0),
            wake_at: Cell::new(None),
            exit_code: Cell::new(None),
        }))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        self.name.as_ref()
    }

    pub fn state(&self) -> State {
        self.state.get()
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks.get()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get()
    }

    pub fn address_space(&self) -> Option<AddrSpace> {
        self.space
    }

    pub fn user_image(&self) -> Option<UserImage> {
        self.user_image
    }

    pub fn kernel_stack_top(&self) -> VirtAddr {
        self.stack.top()
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.set(state);
    }

    pub(crate) fn saved_sp(&self) -> VirtAddr {
        self.saved_sp.get()
    }

    pub(crate) fn saved_sp_slot(&self) -> *mut VirtAddr {
        self.saved_sp.as_ptr()
    }

    pub(crate) fn slice_left(&self) -> u32 {
        self.slice_left.get()
    }

    pub(crate) fn set_slice_left(&self, ticks: u32) {
        self.slice_left.set(ticks);
    }

    pub(crate) fn add_tick(&self) {
        self.total_ticks.set(self.total_ticks.get() + 1);
    }

    pub(crate) fn wake_at(&self) -> Option<u64> {
        self.wake_at.get()
    }

    pub(crate) fn set_wake_at(&self, deadline: u64) {
        self.wake_at.set(Some(deadline));
    }

    pub(crate) fn clear_wake_at(&self) {
        self.wake_at.set(None);
    }

    pub(crate) fn set_exit_code(&self, code: i32) {
        self.exit_code.set(Some(code));
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.run_queue_link.is_linked()
    }
}

/// The fixed-capacity table owning every PCB.
///
/// Slots are reused: a terminated process's PCB (including its kernel stack, which the process
/// may have been executing on when it marked itself terminated) survives until a later
/// `create` claims the slot.
pub struct ProcessTable {
    slots: Vec<Option<Arc<Pcb>>>,
    next_pid: Pid,
}

impl ProcessTable {
    /// Creates the table with process 0, "idle", already `Running`: it is the bootstrap
    /// current process until the scheduler starts.
    pub fn new(idle_entry: extern "C" fn(usize)) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(MAX_PROCESSES)?;
        slots.resize_with(MAX_PROCESSES, || None);

        let idle = Pcb::new(0, Name::new("idle"), idle_entry, 0, None, None)?;
        idle.set_state(State::Running);
        slots[0] = Some(idle);

        Ok(Self { slots, next_pid: 1 })
    }

    /// Creates a kernel process that will run `entry(arg)`, in the first reusable slot.
    ///
    /// The caller is responsible for handing the new PCB to the scheduler.
    pub fn create(&mut self, name: &str, entry: extern "C" fn(usize), arg: usize) -> Result<Pid> {
        self.create_inner(name, entry, arg, None, None)
    }

    /// Like [`create`](Self::create), but records the address space and user entry/stack
    /// addresses of a user process. `entry` remains a kernel-mode function; entering user
    /// mode through `image` is the trap collaborator's job.
    pub fn create_user(
        &mut self,
        name: &str,
        entry: extern "C" fn(usize),
        arg: usize,
        space: AddrSpace,
        image: UserImage,
    ) -> Result<Pid> {
        self.create_inner(name, entry, arg, Some(space), Some(image))
    }

    fn create_inner(
        &mut self,
        name: &str,
        entry: extern "C" fn(usize),
        arg: usize,
        space: Option<AddrSpace>,
        user_image: Option<UserImage>,
    ) -> Result<Pid> {
        let slot = self
            .slots
            .iter()
            .position(|slot| match slot {
                None => true,
                Some(pcb) => pcb.state() == State::Terminated,
            })
            .ok_or(Error::NoProcessSlots)?;

        // Release the previous occupant first: its kernel stack had to outlive its own exit
        // and is only reclaimed here, when the slot is overwritten.
        if let Some(stale) = self.slots[slot].take() {
            assert!(
                !stale.is_queued(),
                "terminated process still on the ready queue"
            );
            if let Some(stale_space) = stale.address_space() {
                debug!(
                    "process {} left address space {} behind",
                    stale.pid(),
                    stale_space.root()
                );
            }
        }

        let pid = self.next_pid;
        let pcb = Pcb::new(pid, Name::new(name), entry, arg, space, user_image)?;
        pcb.set_state(State::Ready);

        self.next_pid += 1;
        self.slots[slot] = Some(pcb);

        debug!("created process {pid} ({name}) in slot {slot}");
        Ok(pid)
    }

    /// Looks up a live process by pid.
    pub fn get(&self, pid: Pid) -> Option<&Arc<Pcb>> {
        self.slots
            .iter()
            .flatten()
            .find(|pcb| pcb.pid() == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pcb>> {
        self.slots.iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop_entry(_arg: usize) {}

    #[test]
    fn idle_is_bootstrap_current() {
        let table = ProcessTable::new(noop_entry).unwrap();

        let idle = table.get(0).unwrap();
        assert_eq!(idle.pid(), 0);
        assert_eq!(idle.name(), "idle");
        assert_eq!(idle.state(), State::Running);
    }

    #[test]
    fn create_assigns_fresh_pids() {
        let mut table = ProcessTable::new(noop_entry).unwrap();

        let a = table.create("a", noop_entry, 0).unwrap();
        let b = table.create("b", noop_entry, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.get(a).unwrap().state(), State::Ready);
        assert_eq!(table.get(b).unwrap().name(), "b");
    }

    #[test]
    fn slots_are_finite_and_reusable() {
        let mut table = ProcessTable::new(noop_entry).unwrap();

        let mut pids = alloc::vec::Vec::new();
        for i in 0..MAX_PROCESSES - 1 {
            pids.push(table.create("filler", noop_entry, i).unwrap());
        }
        assert_eq!(
            table.create("overflow", noop_entry, 0).unwrap_err(),
            Error::NoProcessSlots
        );

        // A terminated process's slot is reusable, and reuse retires the old pid.
        let victim = pids[3];
        table.get(victim).unwrap().set_state(State::Terminated);

        let replacement = table.create("fresh", noop_entry, 0).unwrap();
        assert_ne!(replacement, victim);
        assert!(table.get(victim).is_none());
        assert_eq!(table.get(replacement).unwrap().name(), "fresh");
    }

    #[test]
    fn terminated_pcb_survives_until_reuse() {
        let mut table = ProcessTable::new(noop_entry).unwrap();

        let pid = table.create("doomed", noop_entry, 0).unwrap();
        let pcb = table.get(pid).unwrap();
        pcb.set_state(State::Terminated);
        pcb.set_exit_code(7);

        // Still present (with its stack) until another create claims the slot.
        let pcb = table.get(pid).unwrap();
        assert_eq!(pcb.exit_code(), Some(7));
        assert!(pcb.kernel_stack_top().as_usize() != 0);
    }

    #[test]
    fn user_process_records_image() {
        use crate::mm::types::PhysFrameNum;

        let mut table = ProcessTable::new(noop_entry).unwrap();

        // A handle is just a root frame; no real tree is needed to record it.
        let space = AddrSpace(PhysFrameNum::new(5));
        let image = UserImage {
            entry: VirtAddr::new(0x40_0000),
            stack: VirtAddr::new(0x7fff_f000),
        };

        let pid = table.create_user("shell", noop_entry, 0, space, image).unwrap();
        let pcb = table.get(pid).unwrap();
        assert_eq!(pcb.address_space(), Some(space));
        assert_eq!(pcb.user_image().unwrap().entry, image.entry);
        assert_eq!(pcb.user_image().unwrap().stack, image.stack);

        let kernel_pid = table.create("plain", noop_entry, 0).unwrap();
        let kernel_pcb = table.get(kernel_pid).unwrap();
        assert!(kernel_pcb.address_space().is_none());
        assert!(kernel_pcb.user_image().is_none());
    }
}
