use std::{
    fmt::{Display, Formatter},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::relay::{RelaySnapshot, SubprocessRelay};

/// Identity of one transport connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Admitted,
    Active,
    Closed,
}

/// How long a snapshot waits for a relay that is busy writing.
const RELAY_SNAPSHOT_WAIT: Duration = Duration::from_millis(500);

/// An admitted connection together with the relay feeding its encoder.
#[derive(Clone)]
pub struct Session {
    id: ConnectionId,
    state: SessionState,
    relay: Arc<SubprocessRelay>,
    opened_at: Instant,
}

impl Session {
    pub fn new(id: ConnectionId, relay: Arc<SubprocessRelay>) -> Self {
        Self {
            id,
            state: SessionState::Admitted,
            relay,
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn relay(&self) -> &Arc<SubprocessRelay> {
        &self.relay
    }

    pub fn is_open(&self) -> bool {
        self.state != SessionState::Closed
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn activate(&mut self) {
        if self.state == SessionState::Admitted {
            self.state = SessionState::Active;
        }
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            state: self.state,
            age_ms: self.opened_at.elapsed().as_millis() as u64,
            relay: tokio::time::timeout(RELAY_SNAPSHOT_WAIT, self.relay.snapshot())
                .await
                .ok(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: ConnectionId,
    pub state: SessionState,
    pub age_ms: u64,
    /// `None` while a write to an encoder that stopped reading holds the relay.
    pub relay: Option<RelaySnapshot>,
}
