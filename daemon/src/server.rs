/// Command socket and main poll loop.
///
/// Every iteration refreshes the process snapshot (logging transitions), then
/// waits up to the accept timeout for one client. A connected client gets the
/// filtered activity log, then whatever it writes before closing its side is
/// taken as the name of a process to terminate. One client is served at a
/// time; others wait in the listen backlog.
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::error::DaemonError;
use crate::killer::{KillOutcome, ProcessKiller};
use crate::lifecycle::Lifecycle;
use crate::log_sink::{LogSink, TRANSITION_MARKER};
use crate::process_monitor::DeltaLogger;
use crate::snapshot::{ProcessSnapshot, ProcessTable};

/// Sent instead of the report when the activity log cannot be read.
pub const LOG_UNAVAILABLE: &str = "Log file not found.";
/// Sent when the log is readable but holds no matching lines, so the client
/// never waits on an empty report.
pub const NO_ACTIVITY: &str = "No process activity recorded.";

/// Decoded client payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// The client closed without writing anything.
    Empty,
    /// Name of the process to terminate, used verbatim.
    Kill(String),
    /// The payload was not valid UTF-8.
    Undecodable,
}

impl Request {
    pub fn decode(payload: &[u8]) -> Self {
        if payload.is_empty() {
            return Request::Empty;
        }
        match std::str::from_utf8(payload) {
            Ok(name) => Request::Kill(name.to_string()),
            Err(_) => Request::Undecodable,
        }
    }
}

/// Builds the report sent to every client.
pub fn build_report(sink: &dyn LogSink) -> String {
    match sink.read_matching(TRANSITION_MARKER) {
        Some(lines) if !lines.is_empty() => lines,
        Some(_) => NO_ACTIVITY.to_string(),
        None => {
            let location = sink
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "activity log".to_string());
            sink.info(&format!("Log file {location} not found."));
            LOG_UNAVAILABLE.to_string()
        }
    }
}

/// Sends `report`, then collects everything the peer writes until it closes
/// its write side.
pub async fn exchange<S>(stream: &mut S, report: &[u8]) -> io::Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(report).await?;
    let mut payload = Vec::new();
    stream.read_to_end(&mut payload).await?;
    Ok(payload)
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Cloneable control surface for a [`Daemon`]: flips the running flag that
/// the poll loop reads once per iteration.
#[derive(Clone)]
pub struct DaemonHandle {
    running: Arc<AtomicBool>,
    sink: Arc<dyn LogSink>,
}

impl Lifecycle for DaemonHandle {
    fn start(&self) -> Result<(), DaemonError> {
        self.sink.info("Service start");
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), DaemonError> {
        self.sink.info("Service stop");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

pub struct Daemon {
    listener: TcpListener,
    config: Config,
    sink: Arc<dyn LogSink>,
    monitor: DeltaLogger,
    killer: ProcessKiller,
    previous: ProcessSnapshot,
    handle: DaemonHandle,
}

impl Daemon {
    /// Validates `config`, binds the command socket and takes the baseline
    /// snapshot. These are the only fatal errors; the daemon is created stopped.
    pub async fn bind(config: Config, sink: Arc<dyn LogSink>) -> Result<Self, DaemonError> {
        config.validate()?;
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DaemonError::Bind { addr, source })?;

        let mut monitor = DeltaLogger::new(ProcessTable::new());
        let previous = monitor.baseline();
        tracing::info!("[server] Listening on {}", listener.local_addr().unwrap_or(addr));

        Ok(Self {
            listener,
            config,
            handle: DaemonHandle {
                running: Arc::new(AtomicBool::new(false)),
                sink: Arc::clone(&sink),
            },
            sink,
            monitor,
            killer: ProcessKiller::new(ProcessTable::new()),
            previous,
        })
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs poll cycles until stopped. Returns immediately if never started.
    pub async fn run(&mut self) -> Result<(), DaemonError> {
        self.sink.info("Main...");
        while self.handle.is_running() {
            self.poll_once().await;
        }
        Ok(())
    }

    /// One poll cycle: refresh snapshot, then a bounded wait for one client.
    async fn poll_once(&mut self) {
        self.previous = self.monitor.diff_and_log(&self.previous, self.sink.as_ref());

        let accept_timeout = self.config.accept_timeout();
        let (stream, peer) = match tokio::time::timeout(accept_timeout, self.listener.accept()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                tracing::warn!("[server] Accept failed: {e}");
                return;
            }
            Err(_) => {
                tracing::debug!("[server] No client connected in the last {accept_timeout:?}");
                return;
            }
        };

        tracing::debug!("[server] Client connected from {peer}");
        self.serve(stream, peer).await;
        tracing::debug!("[server] Loop...");
    }

    /// Serves one connection and closes it, whatever the outcome. Failures
    /// are logged before the close so a client never sees the close first.
    async fn serve(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let report = build_report(self.sink.as_ref());
        let received = with_limit(
            self.config.client_timeout(),
            exchange(&mut stream, report.as_bytes()),
        )
        .await;

        match received {
            Ok(payload) => self.handle_request(&payload),
            Err(e) if is_disconnect(&e) => self
                .sink
                .info(&format!("Connection from {peer} was closed by the remote host: {e}")),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => self
                .sink
                .info(&format!("Client {peer} did not finish within the time limit; closing.")),
            Err(e) => self.sink.warn(&format!("Error while serving {peer}: {e}")),
        }
        close(&mut stream, peer).await;
    }

    fn handle_request(&mut self, payload: &[u8]) {
        match Request::decode(payload) {
            Request::Empty => self.sink.info("Client sent an empty message."),
            Request::Undecodable => self.sink.warn(&format!(
                "Client sent {} bytes that are not valid UTF-8; ignoring.",
                payload.len()
            )),
            Request::Kill(target) => {
                self.sink.info(&format!("Try to kill process {target:?}."));
                match self.killer.kill_by_name(&target, self.sink.as_ref()) {
                    KillOutcome::Terminated { pid } => {
                        tracing::debug!("[server] Terminated {target:?} (pid {pid})")
                    }
                    KillOutcome::NoMatch => {
                        tracing::debug!("[server] Nothing terminated for {target:?}")
                    }
                }
            }
        }
    }
}

/// Shuts down the write side of a served connection. Returns `false` if the
/// shutdown failed, which by then only matters for diagnostics.
async fn close<S: AsyncWrite + Unpin>(stream: &mut S, peer: SocketAddr) -> bool {
    match stream.shutdown().await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("[server] Closing connection to {peer} failed: {e}");
            false
        }
    }
}

/// Applies an optional deadline to an I/O future, mapping expiry to `TimedOut`.
async fn with_limit<T>(
    limit: Option<Duration>,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "client exchange timed out"))),
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client;
    use crate::log_sink::{FileLogSink, MemorySink};
    use std::path::{Path, PathBuf};
    use tokio::task::JoinHandle;

    // ── Request::decode ───────────────────────────────────────────────────────

    #[test]
    fn decode_empty_payload() {
        assert_eq!(Request::decode(b""), Request::Empty);
    }

    #[test]
    fn decode_name_verbatim() {
        assert_eq!(
            Request::decode(b"LeagueClientUxRender.exe"),
            Request::Kill("LeagueClientUxRender.exe".to_string())
        );
        // No trimming: the bytes are the name.
        assert_eq!(Request::decode(b" a \n"), Request::Kill(" a \n".to_string()));
    }

    #[test]
    fn decode_invalid_utf8() {
        assert_eq!(Request::decode(&[0xff, 0xfe, 0x00]), Request::Undecodable);
    }

    // ── build_report ──────────────────────────────────────────────────────────

    #[test]
    fn build_report_returns_matching_lines() {
        let sink = MemorySink::new();
        sink.info("Service start");
        sink.info("Process started: a (pid 1)");
        let report = build_report(&sink);
        assert!(report.contains("Process started: a (pid 1)"));
        assert!(!report.contains("Service start"));
    }

    #[test]
    fn build_report_without_activity_is_never_empty() {
        let sink = MemorySink::new();
        sink.info("Service start");
        assert_eq!(build_report(&sink), NO_ACTIVITY);
    }

    #[test]
    fn build_report_unreadable_log_sends_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.log");
        let sink = FileLogSink::open(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(build_report(&sink), LOG_UNAVAILABLE);
    }

    // ── exchange ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn exchange_sends_report_then_reads_until_close() {
        let (mut server, mut peer) = tokio::io::duplex(1024);
        let client = tokio::spawn(async move {
            let mut buf = vec![0u8; 7];
            peer.read_exact(&mut buf).await.unwrap();
            peer.write_all(b"victim").await.unwrap();
            buf
        });

        let payload = exchange(&mut server, b"Process").await.unwrap();

        assert_eq!(payload, b"victim");
        assert_eq!(client.await.unwrap(), b"Process");
    }

    #[tokio::test]
    async fn with_limit_maps_expiry_to_timed_out() {
        let never = std::future::pending::<io::Result<()>>();
        let err = with_limit(Some(Duration::from_millis(20)), never).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    // ── close ─────────────────────────────────────────────────────────────────

    struct RefusesShutdown;

    impl AsyncWrite for RefusesShutdown {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Err(io::ErrorKind::NotConnected.into()))
        }
    }

    #[tokio::test]
    async fn close_reports_a_failed_shutdown() {
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        assert!(!close(&mut RefusesShutdown, peer).await);

        let (mut server, _client) = tokio::io::duplex(64);
        assert!(close(&mut server, peer).await);
    }

    // ── full daemon over TCP ──────────────────────────────────────────────────

    struct Running {
        _dir: tempfile::TempDir,
        addr: SocketAddr,
        log_path: PathBuf,
        handle: DaemonHandle,
        task: JoinHandle<Result<(), DaemonError>>,
    }

    impl Running {
        fn log(&self) -> String {
            std::fs::read_to_string(&self.log_path).unwrap()
        }

        async fn shutdown(self) -> tempfile::TempDir {
            self.handle.stop().unwrap();
            let joined = tokio::time::timeout(Duration::from_secs(5), self.task).await;
            assert!(matches!(joined, Ok(Ok(Ok(())))));
            self._dir
        }
    }

    fn test_config(dir: &Path, client_timeout_ms: u64) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            accept_timeout_ms: 100,
            client_timeout_ms,
            log_path: dir.join("activity.log"),
        }
    }

    async fn spawn_daemon(client_timeout_ms: u64) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), client_timeout_ms);
        let log_path = config.log_path.clone();
        let sink: Arc<dyn LogSink> = Arc::new(FileLogSink::open(&log_path).unwrap());

        let mut daemon = Daemon::bind(config, sink).await.unwrap();
        let addr = daemon.local_addr().unwrap();
        let handle = daemon.handle();
        handle.start().unwrap();
        let task = tokio::spawn(async move { daemon.run().await });

        Running {
            _dir: dir,
            addr,
            log_path,
            handle,
            task,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_without_start_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), 1_000);
        let sink: Arc<dyn LogSink> = Arc::new(FileLogSink::open(&config.log_path).unwrap());
        let mut daemon = Daemon::bind(config, sink).await.unwrap();

        assert!(!daemon.handle().is_running());
        let result = tokio::time::timeout(Duration::from_secs(1), daemon.run()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_to_a_busy_port_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            port: taken.local_addr().unwrap().port(),
            ..test_config(dir.path(), 1_000)
        };
        let sink: Arc<dyn LogSink> = Arc::new(MemorySink::new());

        let result = Daemon::bind(config, sink).await;
        assert!(matches!(result, Err(DaemonError::Bind { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_rejects_zero_accept_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            accept_timeout_ms: 0,
            ..test_config(dir.path(), 1_000)
        };
        let sink: Arc<dyn LogSink> = Arc::new(MemorySink::new());

        let result = Daemon::bind(config, sink).await;
        assert!(matches!(result, Err(DaemonError::InvalidConfig(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_and_stop_are_logged_and_stop_ends_the_loop() {
        let daemon = spawn_daemon(1_000).await;
        assert!(daemon.handle.is_running());
        tokio::time::sleep(Duration::from_millis(250)).await;

        let log_path = daemon.log_path.clone();
        let _dir = daemon.shutdown().await;

        let log = std::fs::read_to_string(log_path).unwrap();
        assert!(log.contains("Service start"));
        assert!(log.contains("Main..."));
        assert!(log.contains("Service stop"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_payload_is_logged_and_next_client_is_served() {
        let daemon = spawn_daemon(5_000).await;

        let first = client::request(daemon.addr, None).await.unwrap();
        let second = client::request(daemon.addr, None).await.unwrap();

        assert!(!first.is_empty());
        assert!(!second.is_empty());
        assert_eq!(daemon.log().matches("Client sent an empty message.").count(), 2);
        daemon.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn report_includes_processes_started_after_startup() {
        let daemon = spawn_daemon(5_000).await;
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let marker = format!("(pid {})", child.id());

        // Let at least one poll cycle observe the child before connecting.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let report = client::request(daemon.addr, None).await.unwrap();

        child.kill().unwrap();
        child.wait().unwrap();
        assert!(report
            .lines()
            .any(|l| l.contains("Process started:") && l.ends_with(&marker)));
        daemon.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_utf8_payload_is_ignored() {
        let daemon = spawn_daemon(5_000).await;

        let mut stream = TcpStream::connect(daemon.addr).await.unwrap();
        let mut first = [0u8; 1];
        stream.read_exact(&mut first).await.unwrap();
        stream.write_all(&[0xff, 0xfe]).await.unwrap();
        stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();

        assert!(daemon.log().contains("not valid UTF-8"));
        assert!(!client::request(daemon.addr, None).await.unwrap().is_empty());
        daemon.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_client_is_cut_off_after_the_time_limit() {
        let daemon = spawn_daemon(300).await;

        let mut stream = TcpStream::connect(daemon.addr).await.unwrap();
        // Never close our side; the daemon must close the connection itself.
        let mut received = Vec::new();
        let closed =
            tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut received)).await;

        assert!(matches!(closed, Ok(Ok(n)) if n > 0));
        assert!(daemon.log().contains("did not finish within the time limit"));
        daemon.shutdown().await;
    }

    #[allow(deprecated)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn connection_reset_is_not_fatal() {
        let daemon = spawn_daemon(5_000).await;

        {
            let mut stream = TcpStream::connect(daemon.addr).await.unwrap();
            let mut first = [0u8; 1];
            stream.read_exact(&mut first).await.unwrap();
            // Zero linger turns the drop into a RST.
            stream.set_linger(Some(Duration::ZERO)).unwrap();
        }

        let report = client::request(daemon.addr, None).await.unwrap();
        assert!(!report.is_empty());
        assert!(daemon.log().contains("was closed by the remote host"));
        daemon.shutdown().await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_request_terminates_the_named_process() {
        use crate::test_support::{cleanup, wait_for_exit, NamedSleeper};

        let daemon = spawn_daemon(5_000).await;
        let target = NamedSleeper::new();
        let bystander = NamedSleeper::new();
        let mut victim = target.spawn();
        let mut other = bystander.spawn();

        let report = client::request(daemon.addr, Some(target.name.as_str())).await.unwrap();

        assert!(!report.is_empty());
        assert!(wait_for_exit(&mut victim, Duration::from_secs(5)));
        assert!(other.try_wait().unwrap().is_none());
        assert!(daemon.log().contains(&format!("Try to kill process {:?}.", target.name)));
        cleanup(&mut other);
        daemon.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_kill_target_is_a_logged_no_op() {
        let daemon = spawn_daemon(5_000).await;

        client::request(daemon.addr, Some("procwatch-no-such-process"))
            .await
            .unwrap();

        assert!(daemon
            .log()
            .contains("No running process named \"procwatch-no-such-process\"."));
        daemon.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_clients_are_served_one_after_another() {
        let daemon = spawn_daemon(5_000).await;

        client::run_clients(daemon.addr, 4, None).await.unwrap();

        assert_eq!(daemon.log().matches("Client sent an empty message.").count(), 4);
        daemon.shutdown().await;
    }
}
