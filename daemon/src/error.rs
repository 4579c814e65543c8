use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that prevent the daemon from starting.
///
/// Everything that can go wrong once the accept loop is running (client
/// resets, vanished processes, denied signals) is absorbed and logged at the
/// point where it happens; none of it surfaces as a `DaemonError`.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// `host:port` from the configuration does not form a socket address.
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    /// A configuration value is out of its accepted range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The activity log file could not be opened for appending.
    #[error("failed to open activity log {}: {source}", path.display())]
    LogSink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
