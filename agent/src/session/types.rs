use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Close reason substring the hub uses when another worker holds our identity.
const IDENTITY_CONFLICT_MARKER: &str = "already registered";

/// Transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close(Option<CloseReason>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Lifecycle of the hub connection, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Faulted,
    Reconnecting,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Connected => "connected",
            SessionState::Faulted => "faulted",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// How the supervisor reacts to a session fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Reconnect right away
    Immediate,
    /// Wait the reconnect delay first
    Delayed,
    /// Stop the worker
    Fatal,
}

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Connection dropped without a clean close handshake
    #[error("connection truncated: {0}")]
    Truncated(String),

    #[error("connection closed by hub (code {code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("hub rejected worker identity: {0}")]
    IdentityConflict(String),

    #[error("no frame from hub within {0:?}")]
    LivenessTimeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to encode frame: {0}")]
    Encode(String),

    /// Send attempted on a session that has already ended
    #[error("session {0} is no longer live")]
    Gone(u64),
}

impl SessionError {
    /// Classify a close frame from the hub.
    pub fn from_close(code: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        if reason.contains(IDENTITY_CONFLICT_MARKER) {
            SessionError::IdentityConflict(reason)
        } else {
            SessionError::Closed { code, reason }
        }
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            SessionError::Truncated(_) | SessionError::Closed { .. } => Recovery::Immediate,
            SessionError::IdentityConflict(_) => Recovery::Fatal,
            _ => Recovery::Delayed,
        }
    }
}

/// Why the supervisor stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The hub reported another worker with our identity
    IdentityConflict(String),
    /// Shutdown was requested locally
    Shutdown,
}

impl SupervisorOutcome {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorOutcome::IdentityConflict(_) => 1,
            SupervisorOutcome::Shutdown => 0,
        }
    }
}
