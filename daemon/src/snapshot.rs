use std::collections::HashMap;
use std::path::Path;

use sysinfo::{
    Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, ThreadKind,
    UpdateKind,
};

/// Linux cuts the kernel process name (`comm`) to this many bytes.
const KERNEL_NAME_LEN: usize = 15;

/// One running process as seen by a single enumeration pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
}

/// Why a process was left out of an enumeration or a kill attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The process exited between being listed and being inspected.
    NotFound,
    /// The daemon lacks the privilege to inspect or signal the process.
    AccessDenied,
    /// The process has exited but has not been reaped yet.
    AlreadyZombie,
}

impl SkipReason {
    pub fn describe(self) -> &'static str {
        match self {
            SkipReason::NotFound => "NoSuchProcess: Process does not exist.",
            SkipReason::AccessDenied => "AccessDenied: Insufficient permissions.",
            SkipReason::AlreadyZombie => "ZombieProcess: Process is already terminated.",
        }
    }
}

/// Result of inspecting a single enumerated process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspection {
    Ok(ProcessRecord),
    Skipped(SkipReason),
}

/// Point-in-time mapping from pid to process name.
///
/// Two snapshots are only ever compared by pid membership; a pid recycled by a
/// different executable between two snapshots reads as unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSnapshot {
    processes: HashMap<u32, String>,
}

impl ProcessSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pid: u32, name: impl Into<String>) {
        self.processes.insert(pid, name.into());
    }

    #[cfg(test)]
    pub fn name(&self, pid: u32) -> Option<&str> {
        self.processes.get(&pid).map(String::as_str)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }

    #[cfg(test)]
    pub fn pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.processes.keys().copied()
    }

    pub fn records(&self) -> impl Iterator<Item = ProcessRecord> + '_ {
        self.processes.iter().map(|(&pid, name)| ProcessRecord {
            pid,
            name: name.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

impl<N: Into<String>> FromIterator<(u32, N)> for ProcessSnapshot {
    fn from_iter<I: IntoIterator<Item = (u32, N)>>(iter: I) -> Self {
        Self {
            processes: iter
                .into_iter()
                .map(|(pid, name)| (pid, name.into()))
                .collect(),
        }
    }
}

/// Restores a name the kernel may have cut short. A `short` name of exactly
/// [`KERNEL_NAME_LEN`] bytes is replaced by the first candidate file name that
/// extends it; any other name is returned as is.
pub fn resolve_name<'a>(short: &str, candidates: impl IntoIterator<Item = &'a Path>) -> String {
    if short.len() != KERNEL_NAME_LEN {
        return short.to_string();
    }
    candidates
        .into_iter()
        .filter_map(Path::file_name)
        .map(|name| name.to_string_lossy())
        .find(|name| name.starts_with(short))
        .map(|name| name.into_owned())
        .unwrap_or_else(|| short.to_string())
}

/// Full executable name of `process`, looking past the kernel name limit via
/// the first command line word, then the executable path.
pub fn process_name(process: &Process) -> String {
    let short = process.name().to_string_lossy();
    let argv0 = process.cmd().first().map(Path::new);
    resolve_name(&short, argv0.into_iter().chain(process.exe()))
}

/// Refresh contents needed to resolve full names: status and `comm` always
/// come along, exe and cmd are read once per process.
fn refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::new()
        .with_exe(UpdateKind::OnlyIfNotSet)
        .with_cmd(UpdateKind::OnlyIfNotSet)
}

/// Classifies one sysinfo entry for inclusion in a snapshot.
///
/// Linux userland threads are listed by sysinfo alongside processes; they are
/// reported as `None` so they never show up as process transitions.
pub fn inspect(pid: Pid, process: &Process) -> Option<Inspection> {
    if matches!(process.thread_kind(), Some(ThreadKind::Userland)) {
        return None;
    }
    if matches!(process.status(), ProcessStatus::Zombie) {
        return Some(Inspection::Skipped(SkipReason::AlreadyZombie));
    }
    Some(Inspection::Ok(ProcessRecord {
        pid: pid.as_u32(),
        name: process_name(process),
    }))
}

/// Owns the sysinfo handle used to enumerate processes.
pub struct ProcessTable {
    sys: System,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    /// Re-reads the full process list, dropping processes that have exited.
    pub fn refresh(&mut self) {
        self.sys
            .refresh_processes_specifics(ProcessesToUpdate::All, true, refresh_kind());
    }

    /// Re-reads a single process. Returns `false` when it no longer exists.
    pub fn refresh_pid(&mut self, pid: Pid) -> bool {
        self.sys
            .refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh_kind());
        self.sys.process(pid).is_some()
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.sys.process(pid)
    }

    /// Pids whose process name is exactly `name`, in enumeration order.
    pub fn pids_named(&self, name: &str) -> Vec<Pid> {
        self.sys
            .processes()
            .iter()
            .filter(|(_, process)| !matches!(process.thread_kind(), Some(ThreadKind::Userland)))
            .filter(|(_, process)| process_name(process) == name)
            .map(|(&pid, _)| pid)
            .collect()
    }

    /// Takes a best-effort snapshot of every visible process. Never fails;
    /// processes that cannot be inspected are skipped.
    pub fn snapshot(&mut self) -> ProcessSnapshot {
        self.refresh();

        let mut snapshot = ProcessSnapshot::new();
        let mut skipped = 0usize;
        for (&pid, process) in self.sys.processes() {
            match inspect(pid, process) {
                Some(Inspection::Ok(record)) => snapshot.insert(record.pid, record.name),
                Some(Inspection::Skipped(_)) => skipped += 1,
                None => {}
            }
        }

        tracing::debug!(
            "[snapshot] {} processes, {} skipped",
            snapshot.len(),
            skipped
        );
        snapshot
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
