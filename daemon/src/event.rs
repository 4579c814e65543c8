use chrono::{DateTime, Local};

const EVENT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// The pid is present in the new snapshot but not the previous one.
    Started,
    /// The pid is present in the previous snapshot but not the new one.
    Ended,
}

/// A process start or end inferred from two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    pub kind: TransitionKind,
    pub pid: u32,
    pub name: String,
    pub timestamp: DateTime<Local>,
}

impl TransitionEvent {
    /// The activity log message for this event, stamped with the time the
    /// transition was detected. Always contains the `Process` marker that the
    /// report filter selects on.
    pub fn message(&self) -> String {
        let verb = match self.kind {
            TransitionKind::Started => "started",
            TransitionKind::Ended => "ended",
        };
        format!(
            "{} - Process {verb}: {} (pid {})",
            self.timestamp.format(EVENT_TIME_FORMAT),
            self.name,
            self.pid
        )
    }
}
