//! The preemptive FIFO scheduler.
//!
//! One CPU, one run queue: the running process keeps the CPU until it yields, blocks,
//! terminates or its time slice runs out at a timer tick. All state here is mutated from the
//! single kernel context with interrupts disabled, witnessed by the [`IrqDisabled`] parameter
//! on every mutating entry point.

use core::mem;

use alloc::sync::Arc;

use intrusive_collections::LinkedList;
use log::{debug, warn};

use crate::arch::context::SwitchOps;
use crate::proc::process::{Pcb, Pid, ProcessTable, RunQueueAdapter, State};
use crate::sync::irq::IrqDisabled;

pub const DEFAULT_QUANTUM: u32 = 10;

pub struct Scheduler<S> {
    run_queue: LinkedList<RunQueueAdapter>,
    current: Arc<Pcb>,
    idle: Arc<Pcb>,
    started: bool,
    now: u64,
    quantum: u32,
    switch: S,
}

impl<S: SwitchOps> Scheduler<S> {
    /// Creates the scheduler over `table`, which must already hold the idle process as its
    /// bootstrap current.
    ///
    /// # Panics
    ///
    /// Panics if the idle process is missing; nothing can run without it.
    pub fn new(table: &ProcessTable, switch: S, quantum: u32) -> Self {
        assert!(quantum > 0);

        let idle = Arc::clone(table.get(0).expect("idle process missing"));
        assert_eq!(idle.state(), State::Running, "idle process not bootstrapped");

        Self {
            run_queue: LinkedList::new(RunQueueAdapter::new()),
            current: Arc::clone(&idle),
            idle,
            started: false,
            now: 0,
            quantum,
            switch,
        }
    }

    pub fn current(&self) -> &Arc<Pcb> {
        &self.current
    }

    pub fn current_pid(&self) -> Pid {
        self.current.pid()
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn switch_ops(&self) -> &S {
        &self.switch
    }

    /// Enqueues `pcb` at the tail of the ready queue.
    ///
    /// The idle process is never queued, and re-adding an already-queued process is ignored:
    /// both can occur on legitimate overlapping code paths and must not crash the kernel.
    pub fn add(&mut self, pcb: &Arc<Pcb>, _irq: &IrqDisabled) {
        if Arc::ptr_eq(pcb, &self.idle) {
            warn!("refusing to queue the idle process");
            return;
        }

        if pcb.is_queued() {
            debug!("process {} is already queued", pcb.pid());
            return;
        }

        debug_assert_eq!(pcb.state(), State::Ready);
        self.run_queue.push_back(Arc::clone(pcb));
    }

    /// Drives preemption from the periodic timer: wakes expired sleepers, charges the running
    /// process one tick, and reschedules when its slice is exhausted, unless idle is running
    /// with nothing else to run.
    pub fn tick(&mut self, table: &ProcessTable, irq: &IrqDisabled) {
        self.now += 1;
        self.wake_sleepers(table, irq);

        let current = Arc::clone(&self.current);
        current.add_tick();

        let slice = current.slice_left().saturating_sub(1);
        current.set_slice_left(slice);

        if slice == 0 {
            if Arc::ptr_eq(&current, &self.idle) && self.run_queue.is_empty() {
                // Nothing else to run; a switch would be pure overhead.
                current.set_slice_left(self.quantum);
            } else {
                self.schedule(irq);
            }
        }
    }

    /// Moves every blocked process whose wake deadline has passed back to the ready queue.
    pub fn wake_sleepers(&mut self, table: &ProcessTable, irq: &IrqDisabled) {
        for pcb in table.iter() {
            if pcb.state() != State::Blocked {
                continue;
            }
            let Some(deadline) = pcb.wake_at() else {
                continue;
            };
            if deadline <= self.now {
                pcb.clear_wake_at();
                pcb.set_state(State::Ready);
                self.add(pcb, irq);
            }
        }
    }

    /// Picks the next process (FIFO, falling back to idle) and switches to it.
    ///
    /// Does nothing before [`start`](Self::start); choosing the already-running process only
    /// resets its slice.
    pub fn schedule(&mut self, irq: &IrqDisabled) {
        if !self.started {
            return;
        }

        let next = self
            .run_queue
            .pop_front()
            .unwrap_or_else(|| Arc::clone(&self.idle));

        if Arc::ptr_eq(&next, &self.current) {
            // Cheap path: only idle can be picked while it is already current.
            next.set_slice_left(self.quantum);
            return;
        }

        let prev = mem::replace(&mut self.current, Arc::clone(&next));

        if prev.state() == State::Running {
            // Preempted or yielded, not blocked/terminated: back to the tail of the queue.
            prev.set_state(State::Ready);
            prev.set_slice_left(self.quantum);
            if !Arc::ptr_eq(&prev, &self.idle) {
                self.add(&prev, irq);
            }
        }

        next.set_state(State::Running);
        next.set_slice_left(self.quantum);

        // Safety: interrupts are disabled (witnessed by `irq`); the save slot and the saved
        // stack pointer are maintained exclusively by this scheduler, and the incoming frame
        // was built by `init_stack` or saved by a previous switch.
        unsafe {
            self.switch.switch(
                prev.saved_sp_slot(),
                next.saved_sp(),
                next.kernel_stack_top(),
                next.address_space().map(|space| space.root()),
            );
        }
    }

    /// Starts scheduling: picks the first ready process and performs the first context
    /// switch, which has no outgoing context to save.
    ///
    /// On hardware this never returns; the boot context is abandoned.
    ///
    /// # Panics
    ///
    /// Panics if called twice.
    pub fn start(&mut self, _irq: &IrqDisabled) {
        assert!(!self.started, "scheduler already started");
        self.started = true;

        let next = self
            .run_queue
            .pop_front()
            .unwrap_or_else(|| Arc::clone(&self.idle));

        let prev = mem::replace(&mut self.current, Arc::clone(&next));
        if !Arc::ptr_eq(&prev, &next) {
            // The bootstrap current (idle) loses the CPU without a context to save.
            prev.set_state(State::Ready);
        }

        next.set_state(State::Running);
        next.set_slice_left(self.quantum);

        debug!("scheduler started, first process {}", next.pid());

        // Safety: as in `schedule`, minus the save slot.
        unsafe {
            self.switch.switch_initial(
                next.saved_sp(),
                next.kernel_stack_top(),
                next.address_space().map(|space| space.root()),
            );
        }
    }

    /// Gives up the rest of the current slice.
    pub fn yield_now(&mut self, irq: &IrqDisabled) {
        self.current.set_slice_left(self.quantum);
        self.schedule(irq);
    }

    /// Blocks the current process until [`unblock`](Self::unblock) or a wake deadline
    /// releases it. Blocking idle is a no-op.
    pub fn block(&mut self, irq: &IrqDisabled) {
        if Arc::ptr_eq(&self.current, &self.idle) {
            warn!("ignoring attempt to block the idle process");
            return;
        }

        self.current.set_state(State::Blocked);
        self.schedule(irq);
    }

    /// Blocks the current process until `ticks` timer periods have elapsed.
    pub fn sleep(&mut self, ticks: u64, irq: &IrqDisabled) {
        if Arc::ptr_eq(&self.current, &self.idle) {
            warn!("ignoring attempt to put the idle process to sleep");
            return;
        }

        self.current.set_wake_at(self.now + ticks);
        self.current.set_state(State::Blocked);
        self.schedule(irq);
    }

    /// Releases a blocked process back to the ready queue. Unknown pids and non-blocked
    /// processes are ignored with a diagnostic.
    pub fn unblock(&mut self, table: &ProcessTable, pid: Pid, irq: &IrqDisabled) {
        let Some(pcb) = table.get(pid) else {
            warn!("unblock of unknown pid {pid}");
            return;
        };

        if pcb.state() != State::Blocked {
            debug!("unblock of non-blocked process {pid}");
            return;
        }

        pcb.clear_wake_at();
        pcb.set_state(State::Ready);
        self.add(pcb, irq);
    }

    /// Terminates the current process. The PCB and its kernel stack stay in place until the
    /// slot is reused; execution is still on that stack right now.
    ///
    /// On hardware the switch inside never returns to the caller.
    pub fn exit(&mut self, code: i32, irq: &IrqDisabled) {
        assert!(
            !Arc::ptr_eq(&self.current, &self.idle),
            "idle process attempted to exit"
        );

        debug!("process {} exiting with code {code}", self.current.pid());
        self.current.set_exit_code(code);
        self.current.set_state(State::Terminated);
        self.schedule(irq);
    }
}
