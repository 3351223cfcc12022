//! Single-client ingest core.
//!
//! A [`SessionGate`] admits one connection at a time and hands its chunks to a
//! [`SubprocessRelay`], which writes them to the stdin of an external encoder
//! (ffmpeg by default) and replaces the encoder once if it dies mid-stream.
//!
//! ```text
//! transport ──► SessionGate ──► SubprocessRelay ──► encoder stdin
//!                                     ▲
//!                    encoder stdout/stderr ──► log
//! ```

pub mod error;
pub mod gate;
pub mod process;
pub mod profile;
pub mod relay;
pub mod session;

#[cfg(test)]
mod testing;

pub use error::{RelayError, Result};
pub use gate::SessionGate;
pub use process::{CommandSpawner, EncoderChild, EncoderSpawner, ProcessControl};
pub use profile::{EncoderProfile, EncoderSettings, RtmpTarget};
pub use relay::{Forwarded, RelayPolicy, RelaySnapshot, RelayState, RelayStats, SubprocessRelay};
pub use session::{ConnectionId, Session, SessionSnapshot, SessionState};
