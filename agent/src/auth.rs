//! Bearer token providers for the hub handshake.
//!
//! The supervisor asks for a token on every connection attempt, so a ticket
//! refreshed on disk by another process is picked up on the next reconnect.

use crate::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source of the bearer token presented to the hub.
pub trait AuthProvider: Send + Sync {
    /// Return the token to use for the next handshake.
    fn current_token(&self) -> Result<String>;
}

/// OAuth-style ticket stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthTicket {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, counted from `issued_at`
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Seconds since the Unix epoch
    #[serde(default)]
    pub issued_at: Option<f64>,
}

impl AuthTicket {
    /// Whether the ticket is past its lifetime at `now` (seconds since epoch).
    ///
    /// Tickets without lifetime information never expire.
    pub fn is_expired_at(&self, now: f64) -> bool {
        match (self.issued_at, self.expires_in) {
            (Some(issued_at), Some(expires_in)) => now >= issued_at + expires_in as f64,
            _ => false,
        }
    }
}

/// Reads the ticket file on every call.
#[derive(Debug, Clone)]
pub struct TicketAuth {
    path: PathBuf,
}

impl TicketAuth {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load and parse the ticket.
    pub fn load_ticket(&self) -> Result<AuthTicket> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            AgentError::Auth(format!(
                "Cannot read auth ticket {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let ticket: AuthTicket = serde_json::from_str(&content)?;
        if ticket.access_token.is_empty() {
            return Err(AgentError::Auth(format!(
                "Auth ticket {} has an empty access_token",
                self.path.display()
            )));
        }

        Ok(ticket)
    }
}

impl AuthProvider for TicketAuth {
    fn current_token(&self) -> Result<String> {
        let ticket = self.load_ticket()?;

        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        if ticket.is_expired_at(now) {
            // The hub decides whether to accept it
            warn!(
                path = %self.path.display(),
                has_refresh_token = ticket.refresh_token.is_some(),
                "Auth ticket appears expired"
            );
        } else {
            debug!(path = %self.path.display(), "Loaded auth ticket");
        }

        Ok(ticket.access_token)
    }
}

/// Fixed token, for tests and one-off tooling.
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl AuthProvider for StaticToken {
    fn current_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
