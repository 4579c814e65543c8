use crate::error::DaemonError;

/// Start/stop control over a long-running service, independent of whatever
/// hosts it (a foreground CLI, an init system, a service manager adapter).
pub trait Lifecycle {
    /// Marks the service as running so its main loop may proceed.
    fn start(&self) -> Result<(), DaemonError>;

    /// Asks the main loop to exit. Takes effect at the top of its next
    /// iteration, so an in-flight client exchange finishes first.
    fn stop(&self) -> Result<(), DaemonError>;

    fn is_running(&self) -> bool;
}
