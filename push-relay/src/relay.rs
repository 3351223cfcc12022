//! Bridges inbound stream chunks to the encoder subprocess.
//!
//! All access to the encoder's stdin goes through one mutex: writes, restarts
//! and teardown are serialized, so a chunk is never written to a sink that
//! `stop` already closed and `stop` never lands in the middle of a chunk.
//! The process handle sits behind its own lock so `stop` can still kill an
//! encoder that stopped reading while a write holds the stdin lock.
//!
//! ```text
//! NotStarted ──start──► Running ──write fails / exit seen──► Dead
//!                          ▲                                  │
//!                          └────────────── restart ◄──────────┘
//!
//!        any state ──stop──► Stopped (terminal)
//! ```

use std::{
    fmt::{Display, Formatter},
    io,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::Serialize;
use tokio::{io::AsyncWriteExt, sync::Mutex, task::JoinHandle};
use tokio_util::{
    codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead},
    sync::CancellationToken,
};

use crate::{
    error::{RelayError, Result},
    process::{EncoderSpawner, InputSink, OutputSource, ProcessControl},
};

/// How long `stop` waits for the output drain to finish before abandoning it.
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const EXIT_PROBES: u32 = 10;
const EXIT_PROBE_INTERVAL: Duration = Duration::from_millis(20);
/// Exit polling once the fast probes are used up.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Longest encoder output line kept; longer lines are skipped.
const MAX_OUTPUT_LINE: usize = 8 * 1024;

/// Restart and teardown timing.
#[derive(Debug, Clone)]
pub struct RelayPolicy {
    /// A second encoder failure within this window of the previous one is fatal.
    pub failure_window: Duration,
    /// Time the encoder gets to finish after stdin is closed before it is killed.
    pub stop_grace: Duration,
}

impl Default for RelayPolicy {
    fn default() -> Self {
        Self {
            failure_window: Duration::from_secs(10),
            stop_grace: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    NotStarted,
    Running,
    Dead,
    Stopped,
}

impl Display for RelayState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running => write!(f, "running"),
            Self::Dead => write!(f, "dead"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Counters kept across encoder restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub forwarded_chunks: u64,
    pub forwarded_bytes: u64,
    pub dropped_chunks: u64,
    pub restarts: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelaySnapshot {
    pub state: RelayState,
    pub pid: Option<u32>,
    /// Milliseconds since a chunk last reached the encoder.
    pub idle_ms: Option<u64>,
    pub stats: RelayStats,
}

/// What happened to a chunk handed to [`SubprocessRelay::forward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Written,
    Dropped,
}

type SharedControl = Arc<Mutex<Box<dyn ProcessControl>>>;

struct EncoderProcess {
    generation: u64,
    pid: Option<u32>,
    stdin: InputSink,
    control: SharedControl,
    drain: JoinHandle<()>,
}

struct RelayInner {
    state: RelayState,
    process: Option<EncoderProcess>,
    /// Bumped on every launch so a drain task can tell whether it still
    /// belongs to the current encoder.
    generation: u64,
    last_failure: Option<Instant>,
    last_activity: Option<Instant>,
    stats: RelayStats,
}

pub struct SubprocessRelay {
    spawner: Arc<dyn EncoderSpawner>,
    policy: RelayPolicy,
    inner: Arc<Mutex<RelayInner>>,
    /// Handle of the current encoder. Never locked while holding it.
    current: Mutex<Option<SharedControl>>,
    stopping: CancellationToken,
}

impl SubprocessRelay {
    pub fn new(spawner: Arc<dyn EncoderSpawner>, policy: RelayPolicy) -> Self {
        Self {
            spawner,
            policy,
            inner: Arc::new(Mutex::new(RelayInner {
                state: RelayState::NotStarted,
                process: None,
                generation: 0,
                last_failure: None,
                last_activity: None,
                stats: RelayStats::default(),
            })),
            current: Mutex::new(None),
            stopping: CancellationToken::new(),
        }
    }

    pub async fn state(&self) -> RelayState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> RelayStats {
        self.inner.lock().await.stats
    }

    pub async fn snapshot(&self) -> RelaySnapshot {
        let inner = self.inner.lock().await;
        RelaySnapshot {
            state: inner.state,
            pid: inner.process.as_ref().and_then(|p| p.pid),
            idle_ms: inner
                .last_activity
                .map(|at| at.elapsed().as_millis() as u64),
            stats: inner.stats,
        }
    }

    /// Whether an encoder is running and its process has not exited.
    pub async fn is_alive(&self) -> bool {
        let inner = self.inner.lock().await;
        if inner.state != RelayState::Running {
            return false;
        }
        match inner.process.as_ref() {
            Some(process) => process.control.lock().await.is_alive(),
            None => false,
        }
    }

    /// Launch the encoder.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            RelayState::Running => {
                log::debug!("Relay: encoder already running");
                return Ok(());
            }
            RelayState::Stopped => return Err(RelayError::Stopped),
            RelayState::NotStarted | RelayState::Dead => {}
        }

        self.launch(&mut inner)
            .await
            .map_err(RelayError::EncoderLaunch)
    }

    /// Write one chunk to the encoder's stdin and flush it.
    ///
    /// A failed write drops the chunk and replaces the encoder once. An error
    /// is returned only when the failure is fatal for the session.
    pub async fn forward(&self, chunk: Bytes) -> Result<Forwarded> {
        let mut inner = self.inner.lock().await;
        if self.stopping.is_cancelled() && inner.state != RelayState::Stopped {
            inner.stats.dropped_chunks += 1;
            log::debug!("Relay: stopping, dropping chunk of {} bytes", chunk.len());
            return Ok(Forwarded::Dropped);
        }
        match inner.state {
            RelayState::NotStarted | RelayState::Stopped => {
                inner.stats.dropped_chunks += 1;
                log::warn!(
                    "Relay: encoder {}, dropping chunk of {} bytes",
                    inner.state,
                    chunk.len()
                );
                return Ok(Forwarded::Dropped);
            }
            RelayState::Dead => {
                // exited while no data was flowing; replace it before writing
                if let Err(e) = self.restart(&mut inner).await {
                    inner.stats.dropped_chunks += 1;
                    return Err(e);
                }
            }
            RelayState::Running => {}
        }

        let written = match inner.process.as_mut() {
            Some(process) => write_chunk(&mut process.stdin, &chunk).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no encoder process",
            )),
        };

        match written {
            Ok(()) => {
                inner.stats.forwarded_chunks += 1;
                inner.stats.forwarded_bytes += chunk.len() as u64;
                inner.last_activity = Some(Instant::now());
                Ok(Forwarded::Written)
            }
            Err(e) if self.stopping.is_cancelled() => {
                // stop killed an encoder that was not reading
                inner.stats.dropped_chunks += 1;
                log::debug!(
                    "Relay: chunk of {} bytes dropped by stop: {}",
                    chunk.len(),
                    e
                );
                Ok(Forwarded::Dropped)
            }
            Err(e) => {
                inner.state = RelayState::Dead;
                inner.stats.dropped_chunks += 1;
                log::warn!(
                    "Relay: {}, dropped chunk of {} bytes ({} dropped so far)",
                    RelayError::EncoderWrite(e),
                    chunk.len(),
                    inner.stats.dropped_chunks
                );
                self.restart(&mut inner).await?;
                Ok(Forwarded::Dropped)
            }
        }
    }

    /// Close the encoder's stdin, terminate it and wait for the output drain.
    /// An encoder that keeps a write blocked for longer than `stop_grace` is
    /// killed first. Calling it again is a no-op.
    pub async fn stop(&self) {
        self.stopping.cancel();
        let mut inner = match tokio::time::timeout(self.policy.stop_grace, self.inner.lock()).await
        {
            Ok(inner) => inner,
            Err(_) => {
                log::warn!(
                    "Relay: encoder not reading its input after {:?}, killing it",
                    self.policy.stop_grace
                );
                self.kill_current().await;
                self.inner.lock().await
            }
        };

        if inner.state == RelayState::Stopped {
            return;
        }
        inner.state = RelayState::Stopped;
        self.current.lock().await.take();

        let Some(process) = inner.process.take() else {
            log::debug!("Relay: stopped with no encoder running");
            return;
        };
        let EncoderProcess {
            generation,
            stdin,
            control,
            drain,
            ..
        } = process;

        // end of stream for the encoder
        drop(stdin);
        if let Err(e) = control.lock().await.terminate(self.policy.stop_grace).await {
            log::warn!("Relay: terminating encoder {} failed: {}", generation, e);
        }
        log::info!(
            "Relay: encoder {} stopped, {} chunks forwarded, {} dropped",
            generation,
            inner.stats.forwarded_chunks,
            inner.stats.dropped_chunks
        );
        drop(inner);

        if tokio::time::timeout(DRAIN_JOIN_TIMEOUT, drain).await.is_err() {
            log::warn!("Relay: output drain still busy, abandoning it");
        }
    }

    /// Kill the current encoder without touching the stdin lock.
    async fn kill_current(&self) {
        let Some(control) = self.current.lock().await.clone() else {
            return;
        };
        if let Err(e) = control.lock().await.terminate(Duration::ZERO).await {
            log::warn!("Relay: killing stalled encoder failed: {}", e);
        }
    }

    async fn launch(&self, inner: &mut RelayInner) -> io::Result<()> {
        let child = self.spawner.spawn().await?;

        inner.generation += 1;
        let generation = inner.generation;
        let pid = child.control.pid();
        let control: SharedControl = Arc::new(Mutex::new(child.control));
        let drain = tokio::spawn(drain_output(
            child.outputs,
            generation,
            Arc::downgrade(&self.inner),
        ));

        *self.current.lock().await = Some(Arc::clone(&control));
        inner.process = Some(EncoderProcess {
            generation,
            pid,
            stdin: child.stdin,
            control,
            drain,
        });
        inner.state = RelayState::Running;
        log::info!("Relay: encoder {} started, pid {:?}", generation, pid);
        Ok(())
    }

    /// Replace a dead encoder. Fails if the previous failure is still inside
    /// the failure window or the new encoder cannot be launched.
    async fn restart(&self, inner: &mut RelayInner) -> Result<()> {
        let now = Instant::now();
        let previous = inner.last_failure.replace(now);
        self.retire(inner).await;

        if let Some(previous) = previous {
            let since = now.duration_since(previous);
            if since < self.policy.failure_window {
                log::error!("Relay: encoder failed again {:?} after the last failure", since);
                return Err(RelayError::EncoderRepeatedFailure {
                    reason: format!(
                        "second failure {:?} after the previous one (window {:?})",
                        since, self.policy.failure_window
                    ),
                });
            }
        }

        inner.stats.restarts += 1;
        log::warn!("Relay: restarting encoder (restart #{})", inner.stats.restarts);
        self.launch(inner)
            .await
            .map_err(|e| RelayError::EncoderRepeatedFailure {
                reason: format!("restart failed: {}", e),
            })
    }

    /// Tear down the current encoder without waiting on it; its drain task
    /// ends by itself once the pipes close.
    async fn retire(&self, inner: &mut RelayInner) {
        let Some(process) = inner.process.take() else {
            return;
        };
        self.current.lock().await.take();
        let EncoderProcess {
            generation,
            stdin,
            control,
            ..
        } = process;
        drop(stdin);
        if let Err(e) = control.lock().await.terminate(Duration::ZERO).await {
            log::warn!("Relay: killing encoder {} failed: {}", generation, e);
        }
    }
}

async fn write_chunk(stdin: &mut InputSink, chunk: &[u8]) -> io::Result<()> {
    stdin.write_all(chunk).await?;
    stdin.flush().await
}

type DecodeFn = fn(
    &mut AnyDelimiterCodec,
    &mut BytesMut,
) -> std::result::Result<Option<Bytes>, AnyDelimiterCodecError>;

/// Splits encoder output on `\n` and on a bare `\r`, which ffmpeg uses to end
/// its progress updates. Lines over [`MAX_OUTPUT_LINE`] are skipped.
struct OutputLines {
    codec: AnyDelimiterCodec,
}

impl OutputLines {
    fn new() -> Self {
        Self {
            codec: AnyDelimiterCodec::new_with_max_length(
                b"\r\n".to_vec(),
                Vec::new(),
                MAX_OUTPUT_LINE,
            ),
        }
    }

    fn next_line(&mut self, buf: &mut BytesMut, decode: DecodeFn) -> io::Result<Option<Bytes>> {
        loop {
            match decode(&mut self.codec, buf) {
                Ok(line) => return Ok(line),
                Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                    log::debug!(
                        "Relay: skipped encoder output line over {} bytes",
                        MAX_OUTPUT_LINE
                    );
                }
                Err(AnyDelimiterCodecError::Io(e)) => return Err(e),
            }
        }
    }
}

impl Decoder for OutputLines {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
        self.next_line(buf, AnyDelimiterCodec::decode)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
        self.next_line(buf, AnyDelimiterCodec::decode_eof)
    }
}

/// Forward the encoder's combined output to the log until both pipes close,
/// then mark the relay dead once this encoder, if still current, has exited.
async fn drain_output(
    outputs: Vec<OutputSource>,
    generation: u64,
    relay: Weak<Mutex<RelayInner>>,
) {
    let mut lines = futures::stream::select_all(
        outputs
            .into_iter()
            .map(|output| FramedRead::new(output, OutputLines::new())),
    );

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end();
                if !line.is_empty() {
                    log::log!(target: "encoder", classify_line(line), "{}", line);
                }
            }
            Err(e) => {
                log::debug!("Relay: reading encoder {} output failed: {}", generation, e);
                break;
            }
        }
    }

    // the pipes usually close just before the exit status becomes visible
    let mut probes = 0;
    loop {
        let Some(shared) = relay.upgrade() else {
            return;
        };
        let mut inner = shared.lock().await;
        if inner.generation != generation || inner.state != RelayState::Running {
            return;
        }
        let alive = match inner.process.as_ref() {
            Some(process) => process.control.lock().await.is_alive(),
            None => false,
        };
        if !alive {
            log::warn!("Relay: encoder {} exited unexpectedly", generation);
            inner.state = RelayState::Dead;
            return;
        }
        drop(inner);
        drop(shared);

        probes += 1;
        let interval = if probes < EXIT_PROBES {
            EXIT_PROBE_INTERVAL
        } else {
            if probes == EXIT_PROBES {
                log::warn!(
                    "Relay: encoder {} closed its output but is still running",
                    generation
                );
            }
            EXIT_POLL_INTERVAL
        };
        tokio::time::sleep(interval).await;
    }
}

/// Pick a log level for a line of encoder output.
pub fn classify_line(line: &str) -> log::Level {
    let lower = line.to_ascii_lowercase();
    if lower.contains("error") || lower.contains("fatal") {
        log::Level::Error
    } else if lower.contains("warning") {
        log::Level::Warn
    } else {
        log::Level::Debug
    }
}

#[cfg(test)]
#[path = "relay_test.rs"]
mod relay_test;
