//! Connection supervisor.
//!
//! Owns the hub connection for the life of the process:
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Connected
//!       ↑                                          │ fault
//!  Reconnecting ←──────────── Faulted ←────────────┘
//!                                │ identity conflict / shutdown
//!                                ↓
//!                           Terminated
//! ```
//!
//! Each session runs one receive loop that reads inbound frames, hands them to
//! the dispatcher without waiting on the jobs, writes queued outbound frames,
//! pings the hub and enforces the liveness deadline.

use super::handle::{Outbox, SessionSender};
use super::startup::startup_sequence;
use super::transport::{Connection, Endpoint, Transport};
use super::types::{CloseReason, Frame, Recovery, SessionError, SessionState, SupervisorOutcome};
use crate::context::AgentContext;
use crate::executor::Dispatcher;
use crate::protocol::Envelope;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// Wait before retrying after a connect, auth or liveness failure.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Outbound frames queued per session before senders wait.
pub const OUTBOUND_CAPACITY: usize = 64;

const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the hub closes without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

pub struct ConnectionSupervisor {
    context: Arc<AgentContext>,
    transport: Arc<dyn Transport>,
    endpoint: Endpoint,
    shutdown: CancellationToken,
    retry_delay: Duration,
    state: watch::Sender<SessionState>,
    generation: u64,
}

impl ConnectionSupervisor {
    pub fn new(
        context: Arc<AgentContext>,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Self {
        let endpoint = Endpoint::from_config(&context.config);
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            context,
            transport,
            endpoint,
            shutdown,
            retry_delay: RECONNECT_DELAY,
            state,
            generation: 0,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Observe state changes.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Session state changed");
        }
    }

    /// Run with the standard startup sequence.
    pub async fn run_default(self) -> SupervisorOutcome {
        let startup = startup_sequence(&self.context);
        self.run(startup).await
    }

    /// Connect, serve and reconnect until shutdown or an identity conflict.
    ///
    /// `startup` is sent in order on every new session.
    pub async fn run(mut self, startup: Vec<Envelope>) -> SupervisorOutcome {
        if startup.is_empty() {
            error!("Startup sequence is empty; the hub will not learn about this worker");
        }

        info!(
            url = %self.endpoint.url,
            worker_id = %self.context.worker_id,
            "Starting connection supervisor"
        );

        let mut dispatcher = Dispatcher::new(Arc::clone(&self.context));
        let mut attempt: u64 = 0;

        let outcome = loop {
            if self.shutdown.is_cancelled() {
                break SupervisorOutcome::Shutdown;
            }
            attempt += 1;

            let err = match self.run_session(&startup, &mut dispatcher).await {
                Ok(()) => break SupervisorOutcome::Shutdown,
                Err(e) => e,
            };
            self.set_state(SessionState::Faulted);

            match err.recovery() {
                Recovery::Fatal => {
                    error!(attempt, error = %err, "Another worker holds this identity, giving up");
                    let reason = match err {
                        SessionError::IdentityConflict(reason) => reason,
                        other => other.to_string(),
                    };
                    break SupervisorOutcome::IdentityConflict(reason);
                }
                Recovery::Immediate => {
                    warn!(attempt, error = %err, "Hub connection lost, reconnecting");
                }
                Recovery::Delayed => {
                    error!(
                        attempt,
                        url = %self.endpoint.url,
                        retry_in = ?self.retry_delay,
                        error = %err,
                        "Hub session failed"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break SupervisorOutcome::Shutdown,
                        _ = sleep(self.retry_delay) => {}
                    }
                }
            }

            self.set_state(SessionState::Reconnecting);
        };

        self.set_state(SessionState::Terminated);
        dispatcher.log_outstanding();
        dispatcher.abort_all();
        while dispatcher.join_next().await.is_some() {}
        self.context.stats.log_summary();
        info!(outcome = ?outcome, "Connection supervisor stopped");
        outcome
    }

    /// One connection attempt and, if it succeeds, its receive loop.
    ///
    /// Returns `Ok(())` only when shutdown was requested.
    async fn run_session(
        &mut self,
        startup: &[Envelope],
        dispatcher: &mut Dispatcher,
    ) -> Result<(), SessionError> {
        self.set_state(SessionState::Connecting);
        let token = self
            .context
            .auth
            .current_token()
            .map_err(|e| SessionError::Auth(e.to_string()))?;

        self.set_state(SessionState::Authenticating);
        let limit = self.endpoint.connect_timeout;
        let connection = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            connection = timeout(limit, self.transport.connect(&self.endpoint, &token)) => {
                connection.map_err(|_| {
                    SessionError::Handshake(format!("hub did not complete the handshake within {:?}", limit))
                })??
            }
        };

        self.generation += 1;
        let generation = self.generation;
        let (sender, outbound) = SessionSender::channel(generation, OUTBOUND_CAPACITY);
        self.context.session.replace(sender.clone()).await;
        self.set_state(SessionState::Connected);
        info!(generation, url = %self.endpoint.url, "Connected to hub");

        let result = self
            .receive_loop(connection, sender, outbound, startup, dispatcher)
            .await;

        self.context.session.clear(generation).await;
        result
    }

    #[instrument(skip_all, fields(generation = sender.generation()))]
    async fn receive_loop(
        &self,
        connection: Connection,
        sender: SessionSender,
        mut outbound: Outbox,
        startup: &[Envelope],
        dispatcher: &mut Dispatcher,
    ) -> Result<(), SessionError> {
        let Connection {
            mut sink,
            mut stream,
        } = connection;

        for envelope in startup {
            let text = envelope
                .to_json()
                .map_err(|e| SessionError::Encode(e.to_string()))?;
            sink.send(Frame::Text(text)).await?;
            debug!(message_type = %envelope.message_type, "Sent startup frame");
        }

        let hub = &self.context.config.hub;
        let ping_every = Duration::from_secs(hub.ping_interval_secs);
        let liveness = Duration::from_secs(hub.ping_timeout_secs);
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut deadline = Instant::now() + liveness;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, closing hub session");
                    outbound.close();
                    while let Some(pending) = outbound.recv().await {
                        let (frame, ack) = pending.into_parts();
                        if let Err(e) = sink.send(frame).await {
                            debug!(error = %e, "Could not flush queued frame");
                            break;
                        }
                        ack.written();
                    }
                    let close = Frame::Close(Some(CloseReason::new(NORMAL_CLOSURE, "worker shutting down")));
                    if let Err(e) = sink.send(close).await {
                        debug!(error = %e, "Could not send close frame");
                    }
                    return Ok(());
                }

                inbound = stream.next() => {
                    deadline = Instant::now() + liveness;
                    match inbound {
                        None => {
                            return Err(SessionError::Truncated(
                                "stream ended without a close frame".to_string(),
                            ))
                        }
                        Some(Err(e)) => return Err(e),
                        Some(Ok(Frame::Text(text))) => {
                            dispatcher.dispatch_frame(&text, &sender);
                        }
                        Some(Ok(Frame::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => {
                                dispatcher.dispatch_frame(&text, &sender);
                            }
                            Err(e) => warn!(error = %e, "Ignoring non UTF-8 binary frame"),
                        },
                        Some(Ok(Frame::Ping(_))) | Some(Ok(Frame::Pong(_))) => {
                            trace!("Keepalive frame");
                        }
                        Some(Ok(Frame::Close(reason))) => {
                            let reason = reason.unwrap_or_else(|| {
                                CloseReason::new(NO_STATUS_RECEIVED, "no reason given")
                            });
                            return Err(SessionError::from_close(reason.code, reason.reason));
                        }
                    }
                }

                Some(pending) = outbound.recv() => {
                    let (frame, ack) = pending.into_parts();
                    sink.send(frame).await?;
                    ack.written();
                }

                _ = ping.tick() => {
                    sink.send(Frame::Ping(Vec::new())).await?;
                }

                _ = sleep_until(deadline) => {
                    return Err(SessionError::LivenessTimeout(liveness));
                }

                Some(outcome) = dispatcher.join_next(), if dispatcher.has_outstanding() => {
                    trace!(job_id = %outcome.job_id, succeeded = outcome.succeeded, "Job task reaped");
                }
            }
        }
    }
}
