//! Error types for the push relay.

use crate::session::ConnectionId;

/// Failures surfaced by the session gate and the encoder relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// A second connection tried to stream while another session holds the gate.
    #[error("connection {active} is already streaming")]
    AdmissionConflict { active: ConnectionId },

    /// The encoder subprocess could not be spawned.
    #[error("failed to launch encoder: {0}")]
    EncoderLaunch(#[source] std::io::Error),

    /// A chunk could not be written to the encoder's stdin.
    #[error("encoder write failed: {0}")]
    EncoderWrite(#[source] std::io::Error),

    /// The encoder failed again right after a restart, or the restart itself failed.
    #[error("encoder failed repeatedly: {reason}")]
    EncoderRepeatedFailure { reason: String },

    /// The transport reported an error for the connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// The relay was stopped and cannot be started again.
    #[error("relay is stopped")]
    Stopped,
}

impl RelayError {
    /// Whether the error is a rejected admission rather than a server-side failure.
    pub fn is_admission_conflict(&self) -> bool {
        matches!(self, Self::AdmissionConflict { .. })
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
