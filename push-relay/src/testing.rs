//! In-memory encoder doubles for relay and gate tests.

use std::{
    io,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    task::{Context, Poll, Waker},
    time::Duration,
};

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};

use crate::process::{EncoderChild, EncoderSpawner, ProcessControl};

/// One fake encoder instance: records what reached its stdin.
#[derive(Default)]
pub(crate) struct FakeEncoder {
    received: Mutex<Vec<u8>>,
    chunks: AtomicUsize,
    broken: AtomicBool,
    exited: AtomicBool,
    terminated: AtomicBool,
    stdin_closed: AtomicBool,
    stalled: AtomicBool,
    blocked_writer: Mutex<Option<Waker>>,
    output: tokio::sync::Mutex<Option<DuplexStream>>,
}

impl FakeEncoder {
    pub(crate) fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    pub(crate) fn chunks(&self) -> usize {
        self.chunks.load(Ordering::SeqCst)
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst) && !self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn stdin_closed(&self) -> bool {
        self.stdin_closed.load(Ordering::SeqCst)
    }

    /// Every following write fails with a broken pipe; output stays open.
    pub(crate) fn break_pipe(&self) {
        self.broken.store(true, Ordering::SeqCst);
        self.exited.store(true, Ordering::SeqCst);
    }

    /// Stop reading stdin without exiting: writes stay pending until the
    /// encoder is terminated.
    pub(crate) fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn has_blocked_writer(&self) -> bool {
        self.blocked_writer.lock().unwrap().is_some()
    }

    /// Close stdout/stderr while the process keeps running.
    pub(crate) async fn close_output(&self) {
        self.output.lock().await.take();
    }

    /// Mark the process exited without touching its output.
    pub(crate) fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }

    /// Emit raw bytes on the output stream.
    pub(crate) async fn emit_raw(&self, bytes: &[u8]) {
        if let Some(output) = self.output.lock().await.as_mut() {
            output.write_all(bytes).await.unwrap();
        }
    }

    /// The process exits on its own: output closes, writes fail.
    pub(crate) async fn exit(&self) {
        self.break_pipe();
        self.output.lock().await.take();
    }

    pub(crate) async fn emit(&self, line: &str) {
        if let Some(output) = self.output.lock().await.as_mut() {
            output.write_all(line.as_bytes()).await.unwrap();
            output.write_all(b"\n").await.unwrap();
        }
    }
}

struct FakeStdin {
    encoder: Arc<FakeEncoder>,
}

impl AsyncWrite for FakeStdin {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let stalled = self.encoder.stalled.load(Ordering::SeqCst);
        if stalled {
            *self.encoder.blocked_writer.lock().unwrap() = Some(cx.waker().clone());
        }
        if self.encoder.broken.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "fake encoder pipe broken",
            )));
        }
        if stalled {
            return Poll::Pending;
        }
        self.encoder.received.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.encoder.broken.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "fake encoder pipe broken",
            )));
        }
        self.encoder.chunks.fetch_add(1, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.encoder.stdin_closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

impl Drop for FakeStdin {
    fn drop(&mut self) {
        self.encoder.stdin_closed.store(true, Ordering::SeqCst);
    }
}

struct FakeControl {
    encoder: Arc<FakeEncoder>,
}

#[async_trait]
impl ProcessControl for FakeControl {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_alive(&mut self) -> bool {
        self.encoder.is_alive()
    }

    async fn terminate(&mut self, _grace: Duration) -> io::Result<()> {
        self.encoder.terminated.store(true, Ordering::SeqCst);
        // a dead process breaks the pipe for any pending write
        self.encoder.broken.store(true, Ordering::SeqCst);
        if let Some(waker) = self.encoder.blocked_writer.lock().unwrap().take() {
            waker.wake();
        }
        self.encoder.output.lock().await.take();
        Ok(())
    }
}

/// Hands out [`FakeEncoder`]s and keeps them for inspection.
#[derive(Default)]
pub(crate) struct FakeSpawner {
    encoders: Mutex<Vec<Arc<FakeEncoder>>>,
    failing_spawns: AtomicUsize,
}

impl FakeSpawner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `count` launches fail.
    pub(crate) fn fail_spawns(&self, count: usize) {
        self.failing_spawns.store(count, Ordering::SeqCst);
    }

    pub(crate) fn spawned(&self) -> usize {
        self.encoders.lock().unwrap().len()
    }

    pub(crate) fn encoder(&self, index: usize) -> Arc<FakeEncoder> {
        Arc::clone(&self.encoders.lock().unwrap()[index])
    }

    pub(crate) fn alive(&self) -> usize {
        self.encoders
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.is_alive())
            .count()
    }
}

#[async_trait]
impl EncoderSpawner for FakeSpawner {
    async fn spawn(&self) -> io::Result<EncoderChild> {
        let failing = self.failing_spawns.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_spawns.store(failing - 1, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "fake encoder binary missing",
            ));
        }

        let (writer, reader) = tokio::io::duplex(4096);
        let encoder = Arc::new(FakeEncoder {
            output: tokio::sync::Mutex::new(Some(writer)),
            ..FakeEncoder::default()
        });
        self.encoders.lock().unwrap().push(Arc::clone(&encoder));

        Ok(EncoderChild {
            stdin: Box::new(FakeStdin {
                encoder: Arc::clone(&encoder),
            }),
            outputs: vec![Box::new(reader)],
            control: Box::new(FakeControl { encoder }),
        })
    }
}

/// Poll `check` until it holds or a second passes.
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
