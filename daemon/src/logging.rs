/// Diagnostic output on stderr. Separate from the activity log: this is for
/// operators watching the daemon, the activity log is for clients.
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Installs the global subscriber. `RUST_LOG` takes precedence over `level`.
/// Calling it twice is harmless; the second call is ignored.
pub fn init(level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false),
    );
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// `-v` steps the default level from INFO to DEBUG to TRACE.
pub fn level_for_verbosity(verbose: u8) -> Level {
    match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}
