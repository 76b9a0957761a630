//! Hub wire format.
//!
//! Every frame is a JSON text message. Outbound frames are [`Envelope`]s;
//! inbound job frames are decoded into [`JobMessage`]s.

mod envelope;
mod job;

pub use envelope::Envelope;
pub use job::{CommandId, DecodeError, JobMessage};

/// Largest frame accepted or sent over a hub session (32 MiB).
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;
