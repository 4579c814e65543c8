/// Activity log: the append-only, line-oriented record of process transitions
/// and command handling that the daemon serves back to clients.
///
/// Lines follow the layout
///   `[YYYY-MM-DD HH:MM:SS ] LEVEL    message`
/// (timestamp padded to 20 columns, level padded/truncated to 8).
///
/// The file is written through a `tracing-appender` writer owned by a private
/// `Dispatch`, so each sink has its own subscriber and nothing global is
/// installed. Every write is also emitted to the default (diagnostic)
/// subscriber at the same level.
use std::fmt::{self, Write as _};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{Dispatch, Event, Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::{ChronoLocal, FormatTime};
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

use crate::error::DaemonError;

/// Substring that selects the lines served to clients. Any line containing it
/// is included, transition-related or not.
pub const TRANSITION_MARKER: &str = "Process";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Destination for activity log lines.
pub trait LogSink: Send + Sync {
    fn write(&self, level: Level, message: &str);

    /// Returns every stored line containing `marker`, concatenated verbatim,
    /// or `None` when the backing store cannot be read.
    fn read_matching(&self, marker: &str) -> Option<String>;

    /// Location of the backing file, if there is one.
    fn path(&self) -> Option<&Path> {
        None
    }

    fn info(&self, message: &str) {
        self.write(Level::INFO, message);
    }

    fn warn(&self, message: &str) {
        self.write(Level::WARN, message);
    }
}

/// Formats one log line, including the trailing newline.
pub fn format_line(timestamp: &str, level: Level, message: &str) -> String {
    format!("[{timestamp:<20}] {:<8.8} {message}\n", level.as_str())
}

/// Keeps the lines of `content` that contain `marker`, newlines included.
pub fn filter_lines(content: &str, marker: &str) -> String {
    content
        .split_inclusive('\n')
        .filter(|line| line.contains(marker))
        .collect()
}

/// Emits `message` as an `activity` event to whichever subscriber is current.
fn emit(level: Level, message: &str) {
    match level {
        Level::ERROR => tracing::error!(target: "activity", "{message}"),
        Level::WARN => tracing::warn!(target: "activity", "{message}"),
        Level::INFO => tracing::info!(target: "activity", "{message}"),
        Level::DEBUG => tracing::debug!(target: "activity", "{message}"),
        _ => tracing::trace!(target: "activity", "{message}"),
    }
}

/// Renders events in the activity log layout, ignoring spans and targets.
struct ActivityFormat {
    timer: ChronoLocal,
}

impl ActivityFormat {
    fn new() -> Self {
        Self {
            timer: ChronoLocal::new(TIMESTAMP_FORMAT.to_string()),
        }
    }
}

impl<S, N> FormatEvent<S, N> for ActivityFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut timestamp = String::new();
        self.timer.format_time(&mut Writer::new(&mut timestamp))?;
        let mut message = String::new();
        ctx.field_format()
            .format_fields(Writer::new(&mut message), event)?;

        writer.write_str(&format_line(
            &timestamp,
            *event.metadata().level(),
            &message,
        ))
    }
}

/// File-backed sink. The file is created (or reopened for appending) once;
/// reads go through the path so they see every completed write.
pub struct FileLogSink {
    path: PathBuf,
    dispatch: Dispatch,
}

impl FileLogSink {
    /// Opens (creating if needed) the log file at `path`, along with any
    /// missing parent directories.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DaemonError> {
        let path = path.into();
        let to_error = |source| DaemonError::LogSink {
            path: path.clone(),
            source,
        };

        let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        let file_name = path
            .file_name()
            .ok_or_else(|| to_error(io::Error::new(io::ErrorKind::InvalidInput, "not a file path")))?;
        std::fs::create_dir_all(&dir).map_err(to_error)?;

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(file_name.to_string_lossy())
            .build(&dir)
            .map_err(|e| to_error(io::Error::other(e)))?;

        let subscriber = tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .event_format(ActivityFormat::new())
                .with_writer(appender),
        );

        Ok(Self {
            path,
            dispatch: Dispatch::new(subscriber),
        })
    }
}

impl LogSink for FileLogSink {
    fn write(&self, level: Level, message: &str) {
        tracing::dispatcher::with_default(&self.dispatch, || emit(level, message));
        emit(level, message);
    }

    fn read_matching(&self, marker: &str) -> Option<String> {
        let bytes = std::fs::read(&self.path).ok()?;
        Some(filter_lines(&String::from_utf8_lossy(&bytes), marker))
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// In-memory sink for unit tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemorySink {
    lines: std::sync::Mutex<Vec<(Level, String)>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .map(|(_, message)| message.clone())
            .collect()
    }
}

#[cfg(test)]
impl LogSink for MemorySink {
    fn write(&self, level: Level, message: &str) {
        self.lines.lock().unwrap().push((level, message.to_string()));
    }

    fn read_matching(&self, marker: &str) -> Option<String> {
        let content: String = self
            .lines
            .lock()
            .unwrap()
            .iter()
            .map(|(level, message)| format_line("test", *level, message))
            .collect();
        Some(filter_lines(&content, marker))
    }
}
