//! Hub session management: transport, supervisor and the live session handle.

mod handle;
mod startup;
mod supervisor;
mod transport;
mod types;

pub use handle::{CurrentSession, Outbound, Outbox, SessionSender, WriteAck};
pub use startup::startup_sequence;
pub use supervisor::{ConnectionSupervisor, OUTBOUND_CAPACITY, RECONNECT_DELAY};
pub use transport::{Connection, Endpoint, FrameSink, FrameStream, TlsSettings, Transport, WsTransport};
pub use types::{CloseReason, Frame, Recovery, SessionError, SessionState, SupervisorOutcome};
