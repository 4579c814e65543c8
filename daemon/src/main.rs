mod client;
mod config;
mod error;
mod event;
mod killer;
mod lifecycle;
mod log_sink;
mod logging;
mod paths;
mod process_monitor;
mod server;
mod snapshot;
#[cfg(all(test, target_os = "linux"))]
mod test_support;

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::{Config, DEFAULT_HOST, DEFAULT_PORT};
use crate::lifecycle::Lifecycle;
use crate::log_sink::{FileLogSink, LogSink};
use crate::server::Daemon;

/// Watches process starts and stops, and terminates processes on request.
#[derive(Debug, Parser)]
#[command(name = "procwatch-daemon", version)]
struct Cli {
    /// Increase diagnostic verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon in the foreground until Ctrl+C.
    Run(RunArgs),
    /// Connect one or more clients, print the activity report, and optionally
    /// ask the daemon to terminate a process.
    Client(ClientArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Config file (defaults to the platform data directory).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_path: Option<PathBuf>,
    #[arg(long)]
    accept_timeout_ms: Option<u64>,
    /// 0 lets a client exchange run without a time limit.
    #[arg(long)]
    client_timeout_ms: Option<u64>,
}

impl RunArgs {
    /// Overlays every flag that was given on top of `config`.
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(log_path) = self.log_path {
            config.log_path = log_path;
        }
        if let Some(ms) = self.accept_timeout_ms {
            config.accept_timeout_ms = ms;
        }
        if let Some(ms) = self.client_timeout_ms {
            config.client_timeout_ms = ms;
        }
    }
}

#[derive(Debug, Args)]
struct ClientArgs {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Number of clients to launch concurrently.
    #[arg(short = 'n', long, default_value_t = 1)]
    num_clients: usize,
    /// Exact name of the process to terminate.
    #[arg(long)]
    kill: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(logging::level_for_verbosity(cli.verbose));

    match cli.command {
        Command::Run(args) => run_daemon(args).await,
        Command::Client(args) => run_client(args).await,
    }
}

async fn run_daemon(args: RunArgs) -> Result<()> {
    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = args.config.clone().unwrap_or_else(paths::config_file_path);
    let mut config = config::load_or_default(&config_path)?;
    args.apply(&mut config);

    // ── Activity log + socket ─────────────────────────────────────────────────
    let sink: Arc<dyn LogSink> = Arc::new(FileLogSink::open(&config.log_path)?);
    let log_path = config.log_path.clone();
    let mut daemon = Daemon::bind(config, sink)
        .await
        .context("Daemon cannot start")?;
    let handle = daemon.handle();

    // Graceful shutdown on Ctrl+C.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = handle.stop();
            }
        });
    }

    handle.start()?;
    println!(
        "procwatch-daemon v{} listening on {} (activity log: {})",
        env!("CARGO_PKG_VERSION"),
        daemon.local_addr()?,
        log_path.display()
    );

    daemon.run().await?;
    println!("Shutting down");
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let addr: SocketAddr = (args.host.as_str(), args.port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}:{}", args.host, args.port))?
        .next()
        .with_context(|| format!("No address for {}:{}", args.host, args.port))?;

    client::run_clients(addr, args.num_clients.max(1), args.kill).await
}
