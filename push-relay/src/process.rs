//! Encoder subprocess capability.
//!
//! The relay only needs three things from an encoder: a stdin sink to write
//! chunks into, its output streams to drain into the log, and a handle to
//! query liveness and terminate it. [`EncoderSpawner`] hands those out for
//! each launch; [`CommandSpawner`] backs it with a real OS process.

use std::{io, process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, Command},
};

use crate::profile::EncoderProfile;

pub type InputSink = Box<dyn AsyncWrite + Send + Unpin>;
pub type OutputSource = Box<dyn AsyncRead + Send + Unpin>;

/// A freshly launched encoder.
pub struct EncoderChild {
    /// Write end of the encoder's stdin.
    pub stdin: InputSink,
    /// stdout and stderr, drained together as one log stream.
    pub outputs: Vec<OutputSource>,
    pub control: Box<dyn ProcessControl>,
}

#[async_trait]
pub trait ProcessControl: Send {
    fn pid(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Waits up to `grace` for the process to exit on its own, then kills it.
    async fn terminate(&mut self, grace: Duration) -> io::Result<()>;
}

#[async_trait]
pub trait EncoderSpawner: Send + Sync {
    async fn spawn(&self) -> io::Result<EncoderChild>;
}

/// Spawns the encoder described by an [`EncoderProfile`].
pub struct CommandSpawner {
    profile: EncoderProfile,
}

impl CommandSpawner {
    pub fn new(profile: EncoderProfile) -> Self {
        Self { profile }
    }
}

#[async_trait]
impl EncoderSpawner for CommandSpawner {
    async fn spawn(&self) -> io::Result<EncoderChild> {
        log::debug!(
            "Encoder: spawning {} {}",
            self.profile.program.display(),
            self.profile.args.join(" ")
        );

        let mut child = Command::new(&self.profile.program)
            .args(&self.profile.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "encoder stdin was not captured")
        })?;

        let mut outputs: Vec<OutputSource> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            outputs.push(Box::new(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            outputs.push(Box::new(stderr));
        }

        Ok(EncoderChild {
            stdin: Box::new(stdin),
            outputs,
            control: Box::new(ChildControl { child }),
        })
    }
}

struct ChildControl {
    child: Child,
}

#[async_trait]
impl ProcessControl for ChildControl {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self, grace: Duration) -> io::Result<()> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                log::info!("Encoder: exited with {}", status?);
                Ok(())
            }
            Err(_) => {
                log::warn!("Encoder: still running after {:?}, killing", grace);
                self.child.kill().await
            }
        }
    }
}
