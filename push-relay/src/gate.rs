//! Single-session admission gate.
//!
//! The gate owns the one session slot. Admission checks and mutates the slot
//! under a single lock, so two concurrent opens can never both be accepted,
//! and chunks from any connection other than the admitted one are dropped
//! before they reach the relay.

use std::{fmt::Display, sync::Arc};

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::{
    error::{RelayError, Result},
    process::EncoderSpawner,
    relay::{RelayPolicy, SubprocessRelay},
    session::{ConnectionId, Session, SessionSnapshot},
};

pub struct SessionGate {
    spawner: Arc<dyn EncoderSpawner>,
    policy: RelayPolicy,
    slot: Mutex<Option<Session>>,
}

impl SessionGate {
    pub fn new(spawner: Arc<dyn EncoderSpawner>, policy: RelayPolicy) -> Self {
        Self {
            spawner,
            policy,
            slot: Mutex::new(None),
        }
    }

    /// Admit `id` and start its encoder.
    ///
    /// Returns [`RelayError::AdmissionConflict`] when another session is open;
    /// that session is left untouched. A launch failure closes the new session
    /// and is returned as-is.
    pub async fn on_open(&self, id: ConnectionId) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if let Some(active) = slot.as_ref().filter(|s| s.is_open()) {
            log::warn!(
                "Gate: rejecting {}, only one client is allowed ({} is streaming)",
                id,
                active.id()
            );
            return Err(RelayError::AdmissionConflict { active: active.id() });
        }

        let relay = Arc::new(SubprocessRelay::new(
            Arc::clone(&self.spawner),
            self.policy.clone(),
        ));
        let mut session = Session::new(id, relay);
        log::info!("Gate: {} admitted, starting encoder", id);

        if let Err(e) = session.relay().start().await {
            log::error!("Gate: {} closed, {}", id, e);
            session.close();
            session.relay().stop().await;
            return Err(e);
        }

        session.activate();
        *slot = Some(session);
        Ok(())
    }

    /// Forward a chunk from `id` to the encoder.
    ///
    /// Chunks from connections that do not hold the active session are
    /// ignored. An error means the relay gave up and the session has already
    /// been terminated; the caller should close the connection.
    pub async fn on_data(&self, id: ConnectionId, chunk: Bytes) -> Result<()> {
        let relay = {
            let slot = self.slot.lock().await;
            match slot.as_ref() {
                Some(session) if session.id() == id && session.is_active() => {
                    Arc::clone(session.relay())
                }
                _ => {
                    log::warn!(
                        "Gate: ignoring {} bytes from {}, it holds no active session",
                        chunk.len(),
                        id
                    );
                    return Ok(());
                }
            }
        };

        if let Err(e) = relay.forward(chunk).await {
            log::error!("Gate: terminating {}: {}", id, e);
            self.release(id, "encoder failure").await;
            return Err(e);
        }
        Ok(())
    }

    /// Graceful close of `id`. No-op for connections that were never admitted.
    pub async fn on_close(&self, id: ConnectionId, reason: impl Display) {
        self.release(id, reason).await;
    }

    /// Forced close of `id` after a transport failure.
    pub async fn on_transport_error(&self, id: ConnectionId, cause: impl Display) {
        let err = RelayError::Transport(cause.to_string());
        log::error!("Gate: {} failed: {}", id, err);
        self.release(id, err).await;
    }

    /// Force-close whichever session is open.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(mut session) = slot.take() {
            session.close();
            session.relay().stop().await;
            log::info!("Gate: {} closed on shutdown", session.id());
        }
    }

    pub async fn active_connection(&self) -> Option<ConnectionId> {
        self.slot
            .lock()
            .await
            .as_ref()
            .filter(|s| s.is_open())
            .map(Session::id)
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        // read the relay without holding the slot
        let session = self.slot.lock().await.clone()?;
        Some(session.snapshot().await)
    }

    /// Close the session if `id` still owns it. The slot stays locked until
    /// the encoder has stopped, so a new admission can never overlap it.
    async fn release(&self, id: ConnectionId, reason: impl Display) {
        let mut slot = self.slot.lock().await;
        let Some(mut session) = slot.take_if(|s| s.id() == id) else {
            log::debug!("Gate: close of {} ignored, not the active session", id);
            return;
        };
        session.close();
        session.relay().stop().await;
        log::info!("Gate: {} closed ({})", id, reason);
    }
}

#[cfg(test)]
#[path = "gate_test.rs"]
mod gate_test;
