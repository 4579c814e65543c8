/// Reference client for the command socket, plus a launcher that runs many
/// clients at once to exercise the one-at-a-time accept loop.
///
/// A client connects, reads the activity report, optionally writes the name of
/// a process to terminate, half-closes its side, and waits for the daemon to
/// close the connection.
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// The report has no length prefix; once the first chunk arrives, the rest is
/// considered complete after this much silence.
const REPORT_IDLE: Duration = Duration::from_millis(300);
const READ_CHUNK: usize = 8 * 1024;

/// Runs one exchange against the daemon at `addr` and returns the report text.
pub async fn request(addr: SocketAddr, kill: Option<&str>) -> io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    let report = read_report(&mut stream).await?;

    if let Some(name) = kill {
        stream.write_all(name.as_bytes()).await?;
    }
    stream.shutdown().await?;

    // The daemon closes once it has acted on the request.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await?;
    Ok(report)
}

/// Reads the first chunk unconditionally, then drains until the peer goes
/// quiet for [`REPORT_IDLE`] or closes.
async fn read_report<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut report = Vec::new();

    let n = reader.read(&mut buf).await?;
    report.extend_from_slice(&buf[..n]);
    if n > 0 {
        while let Ok(read) = tokio::time::timeout(REPORT_IDLE, reader.read(&mut buf)).await {
            let n = read?;
            if n == 0 {
                break;
            }
            report.extend_from_slice(&buf[..n]);
        }
    }

    Ok(String::from_utf8_lossy(&report).into_owned())
}

/// Prefixes the first line of `message` and aligns the following lines under it.
pub fn format_prefixed(prefix: &str, message: &str) -> String {
    let indent = " ".repeat(prefix.chars().count());
    message
        .split('\n')
        .enumerate()
        .map(|(i, line)| {
            if i == 0 {
                format!("{prefix}{line}")
            } else {
                format!("{indent}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn out(message: &str, client: usize, total: usize) {
    let prefix = format!("Client {client}/{total}, PID: {} > ", std::process::id());
    println!("{}", format_prefixed(&prefix, message));
}

/// Launches `count` concurrent clients and waits for all of them.
/// Fails if any client failed; the others still run to completion.
pub async fn run_clients(addr: SocketAddr, count: usize, kill: Option<String>) -> Result<()> {
    let mut handles = Vec::with_capacity(count);
    for client in 1..=count {
        let kill = kill.clone();
        handles.push(tokio::spawn(async move {
            out("Client started", client, count);
            let result = request(addr, kill.as_deref()).await;
            match &result {
                Ok(report) => out(report, client, count),
                Err(e) => out(&format!("Exchange failed: {e}"), client, count),
            }
            out("Client has terminated", client, count);
            result.is_ok()
        }));
    }

    let mut failures = 0;
    for handle in handles {
        if !handle.await.unwrap_or(false) {
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{failures} of {count} clients failed");
    }
    Ok(())
}
