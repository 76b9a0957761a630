//! Shared fakes for the integration tests: an in-memory hub transport, a fixed
//! hardware probe and a model builder whose pipelines echo their input.

#![allow(dead_code)]

use agent::auth::StaticToken;
use agent::config::AgentConfig;
use agent::context::{AgentContext, AgentContextBuilder};
use agent::hardware::{HardwareCapacityReport, HardwareProbe};
use agent::model::{ArtifactError, BuildRecipe, ModelArtifact, ModelBuilder, Placement, SchedulerChoice};
use agent::protocol::Envelope;
use agent::session::{
    CloseReason, Connection, Endpoint, Frame, Outbox, SessionError, Transport,
};
use async_trait::async_trait;
use futures::channel::mpsc as hub_mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const TEST_TOKEN: &str = "test-token";
pub const TEST_WORKER: &str = "test-worker-0";

/// What the next connect call does.
pub enum Attempt {
    Fail(SessionError),
    /// Accept TCP but never finish the handshake
    Stall,
    Accept,
}

/// Hub side of an accepted connection.
pub struct HubEnd {
    pub to_worker: hub_mpsc::UnboundedSender<Result<Frame, SessionError>>,
    pub from_worker: hub_mpsc::UnboundedReceiver<Frame>,
}

impl HubEnd {
    pub fn send_json(&self, value: Value) {
        self.to_worker
            .unbounded_send(Ok(Frame::Text(value.to_string())))
            .expect("worker dropped its stream");
    }

    pub fn send_text(&self, text: &str) {
        self.to_worker
            .unbounded_send(Ok(Frame::Text(text.to_string())))
            .expect("worker dropped its stream");
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.to_worker
            .unbounded_send(Ok(Frame::Close(Some(CloseReason::new(code, reason)))))
            .expect("worker dropped its stream");
    }

    /// Next text frame from the worker, skipping keepalives.
    pub async fn next_envelope(&mut self) -> Envelope {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), self.from_worker.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("worker closed the connection");
            if let Frame::Text(text) = frame {
                return Envelope::from_json(&text).expect("worker sent an invalid envelope");
            }
        }
    }
}

/// Transport that follows a script of connect outcomes.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Attempt>>,
    attempts: Mutex<Vec<(Instant, String)>>,
    peers: mpsc::UnboundedSender<HubEnd>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Attempt>) -> (Arc<Self>, mpsc::UnboundedReceiver<HubEnd>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            script: Mutex::new(script.into()),
            attempts: Mutex::new(Vec::new()),
            peers,
        });
        (transport, accepted)
    }

    /// When each connect was attempted and with which token.
    pub fn attempts(&self) -> Vec<(Instant, String)> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, _endpoint: &Endpoint, token: &str) -> Result<Connection, SessionError> {
        self.attempts
            .lock()
            .unwrap()
            .push((Instant::now(), token.to_string()));
        let next = self.script.lock().unwrap().pop_front();

        match next {
            Some(Attempt::Fail(err)) => Err(err),
            Some(Attempt::Stall) => std::future::pending().await,
            None => Err(SessionError::Transport("script exhausted".to_string())),
            Some(Attempt::Accept) => {
                let (to_worker, worker_stream) = hub_mpsc::unbounded();
                let (worker_sink, from_worker) = hub_mpsc::unbounded();
                let _ = self.peers.send(HubEnd {
                    to_worker,
                    from_worker,
                });

                let sink = worker_sink.sink_map_err(|e| SessionError::Truncated(e.to_string()));
                Ok(Connection {
                    sink: Box::pin(sink),
                    stream: Box::pin(worker_stream),
                })
            }
        }
    }
}

pub struct FixedProbe(pub HardwareCapacityReport);

impl FixedProbe {
    pub fn with_accelerator(gib: f64) -> Self {
        Self(HardwareCapacityReport {
            accelerator_memory_gib: Some(gib),
            system_memory_gib: 64,
            cpu_cores: 8,
        })
    }
}

impl HardwareProbe for FixedProbe {
    fn capacity_snapshot(&self) -> HardwareCapacityReport {
        self.0
    }
}

/// Pipeline that answers with one fake image naming its model.
pub struct EchoArtifact {
    model_id: String,
}

impl ModelArtifact for EchoArtifact {
    fn apply_scheduler(&mut self, _choice: &SchedulerChoice) -> Result<(), ArtifactError> {
        Ok(())
    }

    fn place(&mut self, _placement: Placement) -> Result<(), ArtifactError> {
        Ok(())
    }

    fn set_tiling(&self, _enabled: bool) {}

    fn execute(&self, request: &Value) -> Result<Value, ArtifactError> {
        let prompt = request
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Ok(json!({ "images": [format!("{}:{}", self.model_id, prompt)] }))
    }

    fn release(&self) -> Result<(), ArtifactError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct EchoBuilder {
    pub builds: AtomicUsize,
}

impl EchoBuilder {
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ModelBuilder for EchoBuilder {
    fn build(
        &self,
        model_id: &str,
        _recipe: &BuildRecipe,
    ) -> Result<Box<dyn ModelArtifact>, ArtifactError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(EchoArtifact {
            model_id: model_id.to_string(),
        }))
    }
}

/// Acknowledge every frame queued on `outbox` as written and hand it over.
pub fn accept_frames(mut outbox: Outbox) -> mpsc::UnboundedReceiver<Frame> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(pending) = outbox.recv().await {
            if tx.send(pending.accept()).is_err() {
                break;
            }
        }
    });
    rx
}

/// Take frames off `outbox` without ever writing them, as a receive loop
/// that dies mid-flush would.
pub fn lose_frames(mut outbox: Outbox) {
    tokio::spawn(async move {
        while let Some(pending) = outbox.recv().await {
            drop(pending);
        }
    });
}

/// Context wired to the fakes above.
pub fn test_context(config: AgentConfig, builder: Arc<EchoBuilder>) -> Arc<AgentContext> {
    AgentContextBuilder::new(config)
        .with_worker_id(TEST_WORKER)
        .with_auth(Arc::new(StaticToken(TEST_TOKEN.to_string())))
        .with_probe(Arc::new(FixedProbe::with_accelerator(24.0)))
        .with_model_builder(builder)
        .build()
        .expect("test context")
}
