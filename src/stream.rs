//! Pipe-mode subprocess streaming.
//!
//! The response lifecycle is a small state machine: nothing is committed
//! until the tool produces its first stdout chunk, so every failure before
//! that point still gets a real status code. Once streaming has begun the
//! only honest way to signal a tool failure is to abort the connection, and
//! that is exactly what the pump does by yielding an `Err` item.
//!
//! Backpressure: chunks travel over a bounded channel, so a slow HTTP client
//! stalls the pump, which stalls the OS pipe, which stalls the tool.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::stream::Stream;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use crate::error::{GatewayError, GatewayResult};
use crate::ytdlp::classify_failure;

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 8;
const STDERR_TAIL_LINES: usize = 200;

/// Rolling tail of the tool's stderr, fed by a background reader task.
/// Only the last [`STDERR_TAIL_LINES`] lines are kept; that is plenty for
/// failure classification and keeps a chatty tool from hoarding memory.
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl StderrTail {
    /// Takes the child's stderr handle and starts draining it.
    pub fn attach(child: &mut Child) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::new()));
        let reader = child.stderr.take().map(|stderr| {
            let sink = Arc::clone(&lines);
            tokio::spawn(async move {
                let mut stderr_lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = stderr_lines.next_line().await {
                    tracing::debug!(target: "mediagate::tool", "{line}");
                    let mut ring = sink.lock();
                    ring.push_back(line);
                    if ring.len() > STDERR_TAIL_LINES {
                        ring.pop_front();
                    }
                }
            })
        });
        Self { lines, reader }
    }

    pub fn snapshot(&self) -> String {
        let ring = self.lines.lock();
        ring.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Waits briefly for the reader to hit EOF, then snapshots. Used after
    /// the child has exited, when the remaining stderr is already in flight.
    pub async fn drained(&mut self) -> String {
        if let Some(handle) = self.reader.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
        }
        self.snapshot()
    }
}

/// Body stream for pipe mode. Yields the buffered first chunk, then whatever
/// the pump task forwards. An `Err` item aborts the HTTP connection.
#[derive(Debug)]
pub struct ByteStream {
    head: Option<Bytes>,
    rx: Option<mpsc::Receiver<io::Result<Bytes>>>,
}

impl ByteStream {
    fn empty() -> Self {
        Self {
            head: None,
            rx: None,
        }
    }
}

impl Stream for ByteStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(head) = self.head.take() {
            return Poll::Ready(Some(Ok(head)));
        }
        match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

/// Spawns `bin` in pipe mode and waits for the first stdout chunk.
///
/// Returns a stream only once bytes exist (or the tool exited cleanly with
/// an empty output); anything that goes wrong earlier comes back as a
/// classified [`GatewayError`] while a status code can still be sent.
pub async fn spawn_streaming(
    bin: &str,
    args: &[String],
    idle_timeout: Duration,
) -> GatewayResult<ByteStream> {
    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| GatewayError::Spawn {
            tool: bin.to_string(),
            message: err.to_string(),
        })?;

    let mut stdout = child.stdout.take().ok_or_else(|| GatewayError::Spawn {
        tool: bin.to_string(),
        message: "stdout pipe unavailable".into(),
    })?;
    let mut tail = StderrTail::attach(&mut child);

    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    let first_read = tokio::time::timeout(idle_timeout, stdout.read_buf(&mut buf)).await;

    match first_read {
        Err(_) => {
            let _ = child.start_kill();
            Err(GatewayError::Timeout {
                tool: bin.to_string(),
                secs: idle_timeout.as_secs(),
            })
        }
        Ok(Err(err)) => {
            let _ = child.start_kill();
            Err(GatewayError::Spawn {
                tool: bin.to_string(),
                message: format!("reading stdout: {err}"),
            })
        }
        Ok(Ok(0)) => {
            // EOF before any output: the verdict is in the exit status.
            let status = tokio::time::timeout(idle_timeout, child.wait())
                .await
                .map_err(|_| GatewayError::Timeout {
                    tool: bin.to_string(),
                    secs: idle_timeout.as_secs(),
                })?
                .map_err(|err| GatewayError::Spawn {
                    tool: bin.to_string(),
                    message: err.to_string(),
                })?;
            if status.success() {
                Ok(ByteStream::empty())
            } else {
                Err(classify_failure(bin, status, tail.drained().await))
            }
        }
        Ok(Ok(_)) => {
            let first = buf.split().freeze();
            let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
            let tool = bin.to_string();
            tokio::spawn(pump(tool, child, stdout, tail, tx, idle_timeout));
            Ok(ByteStream {
                head: Some(first),
                rx: Some(rx),
            })
        }
    }
}

/// Owns the child after streaming has begun: forwards chunks, watches the
/// deadline, and reports the exit status as the final stream item.
async fn pump(
    tool: String,
    mut child: Child,
    mut stdout: ChildStdout,
    mut tail: StderrTail,
    tx: mpsc::Sender<io::Result<Bytes>>,
    idle_timeout: Duration,
) {
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    loop {
        buf.reserve(CHUNK_SIZE);
        let read = match tokio::time::timeout(idle_timeout, stdout.read_buf(&mut buf)).await {
            Err(_) => {
                tracing::warn!("{tool} stalled mid-stream; killing it");
                let _ = child.start_kill();
                let _ = tx
                    .send(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{tool} stalled mid-stream and was killed"),
                    )))
                    .await;
                return;
            }
            Ok(Err(err)) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
            Ok(Ok(n)) => n,
        };
        if read == 0 {
            break;
        }
        if tx.send(Ok(buf.split().freeze())).await.is_err() {
            // Client went away; nobody is reading, stop the tool.
            let _ = child.start_kill();
            return;
        }
    }

    match tokio::time::timeout(idle_timeout, child.wait()).await {
        Ok(Ok(status)) if status.success() => {}
        Ok(Ok(status)) => {
            let stderr = tail.drained().await;
            tracing::warn!("{tool} exited with {status} after streaming began");
            let _ = tx
                .send(Err(io::Error::other(format!(
                    "{tool} exited with {status} after streaming began: {stderr}"
                ))))
                .await;
        }
        Ok(Err(err)) => {
            let _ = tx.send(Err(err)).await;
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = tx
                .send(Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("{tool} did not exit after closing stdout"),
                )))
                .await;
        }
    }
}

/// Streams a file from a per-request scratch directory, keeping the
/// directory alive until the body has been dropped. Dropping the stream
/// deletes the scratch directory and everything in it.
pub struct ScratchStream {
    inner: ReaderStream<tokio::fs::File>,
    _scratch: TempDir,
}

impl ScratchStream {
    pub fn new(file: tokio::fs::File, scratch: TempDir) -> Self {
        Self {
            inner: ReaderStream::new(file),
            _scratch: scratch,
        }
    }
}

impl Stream for ScratchStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn collect(mut stream: ByteStream) -> (Vec<u8>, Option<io::Error>) {
        let mut bytes = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(err) => return (bytes, Some(err)),
            }
        }
        (bytes, None)
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn streams_exactly_the_bytes_written() {
        let stream = spawn_streaming("sh", &sh("printf 'hello media'"), Duration::from_secs(5))
            .await
            .unwrap();
        let (bytes, err) = collect(stream).await;
        assert!(err.is_none());
        assert_eq!(bytes, b"hello media");
    }

    #[tokio::test]
    async fn clean_empty_output_yields_empty_stream() {
        let stream = spawn_streaming("sh", &sh("exit 0"), Duration::from_secs(5))
            .await
            .unwrap();
        let (bytes, err) = collect(stream).await;
        assert!(err.is_none());
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn failure_before_output_is_classified() {
        let err = spawn_streaming(
            "sh",
            &sh("echo 'ERROR: Video unavailable' >&2; exit 1"),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        match err {
            GatewayError::Subprocess { stderr, .. } => {
                assert!(stderr.contains("Video unavailable"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn proxy_failure_before_output_is_upstream_blocked() {
        let err = spawn_streaming(
            "sh",
            &sh("echo 'ERROR: Unable to connect to proxy' >&2; exit 1"),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamBlocked { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let err = spawn_streaming("/nonexistent/tool-binary", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Spawn { .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_after_streaming_aborts_with_err() {
        let stream = spawn_streaming(
            "sh",
            &sh("printf 'partial'; sleep 0.1; echo 'ERROR: mid-stream' >&2; exit 3"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let (bytes, err) = collect(stream).await;
        assert_eq!(bytes, b"partial");
        let err = err.expect("stream must end with an error");
        assert!(err.to_string().contains("after streaming began"));
    }

    #[tokio::test]
    async fn stalled_tool_is_killed_mid_stream() {
        let stream = spawn_streaming(
            "sh",
            &sh("printf 'start'; sleep 30"),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        let (bytes, err) = collect(stream).await;
        assert_eq!(bytes, b"start");
        let err = err.expect("stall must surface as an error");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn scratch_stream_removes_directory_on_drop() {
        let scratch = tempfile::tempdir().unwrap();
        let path = scratch.path().to_path_buf();
        let file_path = path.join("bundle.zip");
        tokio::fs::write(&file_path, b"zip bytes").await.unwrap();

        let file = tokio::fs::File::open(&file_path).await.unwrap();
        let mut stream = ScratchStream::new(file, scratch);
        let mut collected = Vec::new();
        while let Some(item) = stream.next().await {
            collected.extend_from_slice(&item.unwrap());
        }
        assert_eq!(collected, b"zip bytes");
        assert!(path.exists());
        drop(stream);
        assert!(!path.exists());
    }
}
