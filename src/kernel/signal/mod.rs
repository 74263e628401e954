//! Signal delivery.
//!
//! Signals are raised by the kernel on a thread's behalf (fatal faults,
//! a parent terminating, `kill()` from another process) and delivered the
//! next time that thread crosses a syscall boundary or is ticked by the
//! scheduler. There are no user-installable handlers in this kernel: the
//! default action is the only action, matching the original design's
//! trap-always-falls-through-to-schedule() behavior.

use crate::kernel::process::{Process, ProcessId, PROCESS_TABLE};

pub const SIGHUP: u8 = 1;
pub const SIGINT: u8 = 2;
pub const SIGQUIT: u8 = 3;
pub const SIGILL: u8 = 4;
pub const SIGTRAP: u8 = 5;
pub const SIGABRT: u8 = 6;
pub const SIGBUS: u8 = 7;
pub const SIGFPE: u8 = 8;
pub const SIGKILL: u8 = 9;
pub const SIGUSR1: u8 = 10;
pub const SIGSEGV: u8 = 11;
pub const SIGUSR2: u8 = 12;
pub const SIGPIPE: u8 = 13;
pub const SIGALRM: u8 = 14;
pub const SIGTERM: u8 = 15;
pub const SIGCHLD: u8 = 17;
pub const SIGCONT: u8 = 18;
pub const SIGSTOP: u8 = 19;

/// Default action for every signal in this kernel: terminate the receiver.
/// `SIGCONT` just clears a stopped state and `SIGCHLD` is informational;
/// everything else kills.
const fn terminates(signal: u8) -> bool {
    !matches!(signal, SIGCONT | SIGCHLD)
}

/// Queue `signal` for delivery to `pid`. Returns `false` if the process
/// does not exist.
pub fn raise(pid: ProcessId, signal: u8) -> bool {
    let mut table = PROCESS_TABLE.lock();
    match table.get_process_mut(pid) {
        Some(process) => {
            process.raise_signal(signal);
            true
        }
        None => false,
    }
}

/// Deliver any pending, unmasked signal for the currently running thread.
/// Called at syscall entry/exit and on every scheduler tick.
///
/// Returns `true` if the current thread was terminated as a result.
pub fn deliver_pending() -> bool {
    match PROCESS_TABLE.lock().current_process().map(|p| p.pid()) {
        Some(pid) => deliver_pending_to_current(pid),
        None => false,
    }
}

fn deliver_pending_to_current(pid: ProcessId) -> bool {
    let signal = match PROCESS_TABLE.lock().get_process_mut(pid).and_then(Process::take_pending_signal) {
        Some(signal) => signal,
        None => return false,
    };

    if terminates(signal) {
        crate::debug_println!("[Signal] delivering signal {} to PID={}", signal, pid.as_u64());
        crate::kernel::process::terminate_current(signal);
        true
    } else {
        false
    }
}

/// Deliver any pending, unmasked signal for `pid`, which need not be the
/// currently running thread. Unlike `deliver_pending()`, this never
/// triggers a reschedule: it's the pre-handler signal check the queued
/// syscall dispatcher runs for whichever thread's request it's about to
/// service (§4.4's "signal interleave"), not the scheduler's own tick.
///
/// Returns `true` if `pid` was terminated as a result.
pub fn deliver_pending_to(pid: ProcessId) -> bool {
    let signal = match PROCESS_TABLE.lock().get_process_mut(pid).and_then(Process::take_pending_signal) {
        Some(signal) => signal,
        None => return false,
    };

    if terminates(signal) {
        crate::debug_println!("[Signal] delivering signal {} to PID={}", signal, pid.as_u64());
        crate::kernel::process::terminate_process(pid, 128 + i32::from(signal));
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_on_nonexistent_process_returns_false() {
        assert!(!raise(ProcessId::new(u64::MAX), SIGKILL));
    }

    #[test]
    fn only_sigcont_and_sigchld_are_non_terminating() {
        assert!(!terminates(SIGCONT));
        assert!(!terminates(SIGCHLD));
        assert!(terminates(SIGKILL));
        assert!(terminates(SIGSEGV));
        assert!(terminates(SIGHUP));
    }
}
