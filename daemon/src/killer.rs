use sysinfo::{Pid, ProcessStatus, Signal};

use crate::log_sink::LogSink;
use crate::snapshot::{ProcessTable, SkipReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// A termination request was delivered to `pid`.
    Terminated { pid: u32 },
    /// No process with the requested name could be terminated.
    NoMatch,
}

/// Terminates processes by exact executable name.
///
/// Only the first process that can actually be signalled is terminated. When
/// several processes share the name, which one goes first depends on the
/// platform's enumeration order.
pub struct ProcessKiller {
    table: ProcessTable,
}

impl ProcessKiller {
    pub fn new(table: ProcessTable) -> Self {
        Self { table }
    }

    /// Scans the live process list and terminates the first process named
    /// exactly `target`. Per-process failures (exited, zombie, denied) are
    /// logged and the scan moves on. Never fails.
    pub fn kill_by_name(&mut self, target: &str, sink: &dyn LogSink) -> KillOutcome {
        self.table.refresh();
        let candidates = self.table.pids_named(target);
        scan(target, &candidates, sink, |pid| self.terminate(pid))
    }

    /// Sends SIGTERM (or the platform terminate call where signals are not
    /// supported) after re-checking that the process is still alive.
    fn terminate(&mut self, pid: Pid) -> Result<(), SkipReason> {
        let status = if self.table.refresh_pid(pid) {
            self.table.process(pid).map(|process| process.status())
        } else {
            None
        };
        precheck(status)?;

        let delivered = self
            .table
            .process(pid)
            .map(|process| process.kill_with(Signal::Term).unwrap_or_else(|| process.kill()))
            .unwrap_or(false);
        after_signal(delivered, || self.table.refresh_pid(pid))
    }
}

/// Tries `attempt` on each candidate in order until one succeeds, logging
/// every try and every skip.
fn scan(
    target: &str,
    candidates: &[Pid],
    sink: &dyn LogSink,
    mut attempt: impl FnMut(Pid) -> Result<(), SkipReason>,
) -> KillOutcome {
    for &pid in candidates {
        sink.info(&format!("Found! Killing {target:?} (pid {pid})."));
        match attempt(pid) {
            Ok(()) => return KillOutcome::Terminated { pid: pid.as_u32() },
            Err(reason) => sink.info(reason.describe()),
        }
    }

    sink.info(&format!("No running process named {target:?}."));
    KillOutcome::NoMatch
}

/// Whether a freshly re-read candidate may be signalled. `None` means the pid
/// was no longer listed.
fn precheck(status: Option<ProcessStatus>) -> Result<(), SkipReason> {
    match status {
        None => Err(SkipReason::NotFound),
        Some(ProcessStatus::Zombie) => Err(SkipReason::AlreadyZombie),
        Some(_) => Ok(()),
    }
}

/// A refused termination request on a process that is still listed means
/// insufficient privilege; if it is gone, it exited on its own meanwhile.
fn after_signal(delivered: bool, still_listed: impl FnOnce() -> bool) -> Result<(), SkipReason> {
    if delivered {
        Ok(())
    } else if still_listed() {
        Err(SkipReason::AccessDenied)
    } else {
        Err(SkipReason::NotFound)
    }
}
