//! Per-CPU priority/timeslice scheduler.
//!
//! Ready threads are round-robined within their priority band; a non-empty
//! higher band always preempts a lower one. One timer tick is one unit of
//! timeslice; `timer_tick()` is the sole entry point the IDT calls into.

use crate::kernel::core::types::Priority;
use crate::kernel::process::{ProcessId, PROCESS_TABLE};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

/// Timeslice, in ticks, granted per scheduling turn regardless of priority.
const TIMESLICE_TICKS: u32 = 5;

/// Nesting depth of `sched_lock()` on this CPU. This kernel runs one CPU,
/// so a single global counter (rather than a per-CPU one) is enough.
static LOCK_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// `schedLock()`: disable preemption by masking interrupts. Nestable -
/// pairs with `sched_release()`, and only the outermost pair actually
/// toggles the CPU's interrupt flag.
pub fn sched_lock() {
    x86_64::instructions::interrupts::disable();
    LOCK_DEPTH.fetch_add(1, Ordering::Relaxed);
}

/// `schedRelease()`: undo one `sched_lock()`.
pub fn sched_release() {
    if LOCK_DEPTH.fetch_sub(1, Ordering::Relaxed) == 1 {
        x86_64::instructions::interrupts::enable();
    }
}

pub struct Scheduler {
    current_pid: Option<ProcessId>,
    ticks_remaining: u32,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self { current_pid: None, ticks_remaining: 0 }
    }

    /// Select the next thread to run: highest non-empty priority band,
    /// round-robin within it.
    pub fn schedule(&mut self) -> Option<ProcessId> {
        let table = PROCESS_TABLE.lock();

        let mut best: Option<Priority> = None;
        for process in table.ready_processes() {
            best = Some(match best {
                Some(p) if p >= process.priority() => p,
                _ => process.priority(),
            });
        }
        let band = best?;

        let ready: Vec<ProcessId> = table
            .ready_processes()
            .filter(|p| p.priority() == band)
            .map(|p| p.pid())
            .collect();
        drop(table);

        if ready.is_empty() {
            return None;
        }

        let next_idx = if let Some(current) = self.current_pid {
            ready
                .iter()
                .position(|&pid| pid == current)
                .map(|idx| (idx + 1) % ready.len())
                .unwrap_or(0)
        } else {
            0
        };

        let next_pid = ready[next_idx];
        self.current_pid = Some(next_pid);
        self.ticks_remaining = TIMESLICE_TICKS;
        Some(next_pid)
    }
}

lazy_static! {
    pub static ref SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());
}

/// Called from the timer interrupt handler once per tick. Delivers any
/// pending signal for the running thread, then reschedules once the
/// current thread's timeslice is exhausted.
pub fn timer_tick() {
    crate::kernel::signal::deliver_pending();

    let should_switch = {
        let mut sched = SCHEDULER.lock();
        if sched.ticks_remaining == 0 {
            true
        } else {
            sched.ticks_remaining -= 1;
            false
        }
    };

    if should_switch {
        crate::kernel::process::schedule_next();
    }
}
