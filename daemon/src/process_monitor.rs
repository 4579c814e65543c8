/// Start/stop detection by diffing consecutive process snapshots.
///
/// Each poll cycle takes a fresh snapshot, compares its pid set with the
/// previous one, and writes one activity log line per transition. The fresh
/// snapshot becomes the baseline for the next cycle.
use chrono::Local;

use crate::event::{TransitionEvent, TransitionKind};
use crate::log_sink::LogSink;
use crate::snapshot::{ProcessSnapshot, ProcessTable};

/// Pids that appeared and disappeared between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    /// New pids, named as in the current snapshot.
    pub started: ProcessSnapshot,
    /// Vanished pids, named with the last name seen in the previous snapshot.
    pub ended: ProcessSnapshot,
}

impl Delta {
    pub fn between(previous: &ProcessSnapshot, current: &ProcessSnapshot) -> Self {
        let started = current
            .records()
            .filter(|r| !previous.contains(r.pid))
            .map(|r| (r.pid, r.name))
            .collect();
        let ended = previous
            .records()
            .filter(|r| !current.contains(r.pid))
            .map(|r| (r.pid, r.name))
            .collect();
        Self { started, ended }
    }

    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.ended.is_empty()
    }

    /// Expands the delta into individual events. Started events come first;
    /// order within each group follows map iteration and is unspecified.
    pub fn events(&self) -> Vec<TransitionEvent> {
        let timestamp = Local::now();
        let started = self.started.records().map(|r| (TransitionKind::Started, r));
        let ended = self.ended.records().map(|r| (TransitionKind::Ended, r));
        started
            .chain(ended)
            .map(|(kind, r)| TransitionEvent {
                kind,
                pid: r.pid,
                name: r.name,
                timestamp,
            })
            .collect()
    }
}

/// Writes one line per transition to `sink` and returns the events written.
pub fn log_transitions(delta: &Delta, sink: &dyn LogSink) -> Vec<TransitionEvent> {
    let events = delta.events();
    for event in &events {
        sink.info(&event.message());
    }
    events
}

/// Snapshots the process table and logs what changed since the last call.
pub struct DeltaLogger {
    table: ProcessTable,
}

impl DeltaLogger {
    pub fn new(table: ProcessTable) -> Self {
        Self { table }
    }

    /// Snapshot used as the first baseline, without logging anything.
    pub fn baseline(&mut self) -> ProcessSnapshot {
        self.table.snapshot()
    }

    /// Takes a fresh snapshot, logs every transition relative to `previous`,
    /// and returns the fresh snapshot to serve as the next `previous`.
    pub fn diff_and_log(&mut self, previous: &ProcessSnapshot, sink: &dyn LogSink) -> ProcessSnapshot {
        let current = self.table.snapshot();
        let delta = Delta::between(previous, &current);
        if !delta.is_empty() {
            tracing::debug!(
                "[monitor] {} started, {} ended",
                delta.started.len(),
                delta.ended.len()
            );
            log_transitions(&delta, sink);
        }
        current
    }
}
