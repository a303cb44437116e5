//! Hypervisor process supervision.
//!
//! ## Architecture
//!
//! ```text
//! supervise(binary, args)
//!     └─► tokio::process::Command  →  qemu child (stdout + stderr piped)
//!             └─► select! loop
//!                     ├─► stdout segment  → tracing (target "hypervisor")
//!                     ├─► stderr segment  → tracing (target "hypervisor")
//!                     └─► 1 ms tick       → try_wait()
//!             └─► wait()  → ExitStatus
//! ```
//!
//! Each stream is dropped from the loop once it reports end-of-stream. The
//! loop ends when both streams are closed or the process is seen to have
//! exited, and the child is always reaped with a final `wait`.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Split};
use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Interval at which the loop checks whether the child has exited.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// How long to keep reading output that was buffered when the child exited.
const DRAIN_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

type Segments<R> = Split<BufReader<R>>;

/// Spawn `binary` with `args`, forward its output line by line and return
/// its exit status once it has been reaped.
pub async fn supervise(binary: &Path, args: &[String]) -> Result<ExitStatus> {
    supervise_with(binary, args, |stream, line| {
        info!(target: "hypervisor", stream = stream.as_str(), "{line}");
    })
    .await
}

/// Like [`supervise`], handing every output line to `forward`.
pub async fn supervise_with<F>(binary: &Path, args: &[String], mut forward: F) -> Result<ExitStatus>
where
    F: FnMut(OutputStream, &str),
{
    debug!(binary = %binary.display(), args = %args.join(" "), "spawning hypervisor");

    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    info!(binary = %binary.display(), pid = ?child.id(), "hypervisor spawned");

    let mut stdout = child.stdout.take().map(|s| BufReader::new(s).split(b'\n'));
    let mut stderr = child.stderr.take().map(|s| BufReader::new(s).split(b'\n'));

    let mut tick = tokio::time::interval(EXIT_POLL_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            segment = next_segment(&mut stdout) => {
                if !handle_segment(OutputStream::Stdout, segment, &mut forward) {
                    stdout = None;
                }
            }
            segment = next_segment(&mut stderr) => {
                if !handle_segment(OutputStream::Stderr, segment, &mut forward) {
                    stderr = None;
                }
            }
            _ = tick.tick() => {
                if let Some(status) = child.try_wait()? {
                    debug!(?status, "hypervisor exited while streams were open");
                    break;
                }
            }
        }
    }

    // Output written just before exit may still sit in the pipes.
    drain(OutputStream::Stdout, &mut stdout, &mut forward).await;
    drain(OutputStream::Stderr, &mut stderr, &mut forward).await;

    let status = child.wait().await?;
    info!(?status, "hypervisor exited");
    Ok(status)
}

/// Resolves to the next segment, or never if the stream is already closed.
async fn next_segment<R>(segments: &mut Option<Segments<R>>) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    match segments {
        Some(s) => s.next_segment().await,
        None => std::future::pending().await,
    }
}

async fn drain<R, F>(stream: OutputStream, segments: &mut Option<Segments<R>>, forward: &mut F)
where
    R: AsyncRead + Unpin,
    F: FnMut(OutputStream, &str),
{
    while segments.is_some() {
        match tokio::time::timeout(DRAIN_WINDOW, next_segment(segments)).await {
            Ok(segment) => {
                if !handle_segment(stream, segment, forward) {
                    *segments = None;
                }
            }
            Err(_) => break,
        }
    }
}

/// Forward one segment. Returns `false` once the stream is finished.
fn handle_segment<F>(
    stream: OutputStream,
    segment: std::io::Result<Option<Vec<u8>>>,
    forward: &mut F,
) -> bool
where
    F: FnMut(OutputStream, &str),
{
    match segment {
        Ok(Some(bytes)) => {
            let line = String::from_utf8_lossy(&bytes);
            forward(stream, line.trim_end());
            true
        }
        Ok(None) => {
            debug!(stream = stream.as_str(), "hypervisor stream closed");
            false
        }
        Err(e) => {
            warn!(stream = stream.as_str(), error = %e, "reading hypervisor output failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn forwards_both_streams_and_returns_status() {
        let mut seen = Vec::new();
        let status = supervise_with(
            Path::new("sh"),
            &sh("echo out-line; echo err-line >&2; exit 7"),
            |stream, line| seen.push((stream, line.to_string())),
        )
        .await
        .unwrap();

        assert_eq!(status.code(), Some(7));
        assert!(seen.contains(&(OutputStream::Stdout, "out-line".to_string())));
        assert!(seen.contains(&(OutputStream::Stderr, "err-line".to_string())));
    }

    #[tokio::test]
    async fn lines_arrive_in_order_per_stream() {
        let mut seen = Vec::new();
        supervise_with(
            Path::new("sh"),
            &sh("for i in 1 2 3; do echo $i; sleep 0.05; done"),
            |stream, line| {
                if stream == OutputStream::Stdout {
                    seen.push(line.to_string());
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(seen, ["1", "2", "3"]);
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let result = supervise(Path::new("/nonexistent/qemu-system-aarch64"), &[]).await;
        assert!(result.is_err());
    }
}
