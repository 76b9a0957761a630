use super::types::{Frame, SessionError};
use crate::protocol::Envelope;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::debug;

/// A frame waiting in a session's outbound queue.
///
/// The sender is told the frame went out only when the consumer calls
/// [`WriteAck::written`]. Dropping an `Outbound` or its ack unwritten makes
/// the waiting send fail with [`SessionError::Gone`].
#[derive(Debug)]
pub struct Outbound {
    frame: Frame,
    ack: WriteAck,
}

impl Outbound {
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Take the frame; acknowledge it once it has been written.
    pub fn into_parts(self) -> (Frame, WriteAck) {
        (self.frame, self.ack)
    }

    /// Take the frame and acknowledge it at once.
    pub fn accept(self) -> Frame {
        self.ack.written();
        self.frame
    }
}

#[derive(Debug)]
pub struct WriteAck(oneshot::Sender<()>);

impl WriteAck {
    pub fn written(self) {
        // The sender may have been cancelled
        let _ = self.0.send(());
    }
}

/// Receiving half of a session's outbound queue, owned by its receive loop.
pub type Outbox = mpsc::Receiver<Outbound>;

/// Outbound half of one session.
///
/// The receive loop owns the matching [`Outbox`]. Sends complete when the
/// frame has been written to the transport; once the loop exits every clone
/// of this sender fails with [`SessionError::Gone`], including sends whose
/// frames were queued but never written.
#[derive(Debug, Clone)]
pub struct SessionSender {
    generation: u64,
    tx: mpsc::Sender<Outbound>,
}

impl SessionSender {
    /// Create the sender for session `generation` with a bounded queue.
    pub fn channel(generation: u64, capacity: usize) -> (Self, Outbox) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { generation, tx }, rx)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a frame and wait until the receive loop has written it.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), SessionError> {
        let (ack, written) = oneshot::channel();
        let gone = || SessionError::Gone(self.generation);

        self.tx
            .send(Outbound {
                frame,
                ack: WriteAck(ack),
            })
            .await
            .map_err(|_| gone())?;
        written.await.map_err(|_| gone())
    }

    /// Encode an envelope and send it.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        let text = envelope
            .to_json()
            .map_err(|e| SessionError::Encode(e.to_string()))?;
        self.send_frame(Frame::Text(text)).await
    }
}

/// Process-wide pointer to the live session, replaced on every reconnect.
#[derive(Debug, Clone, Default)]
pub struct CurrentSession {
    inner: Arc<RwLock<Option<SessionSender>>>,
}

impl CurrentSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn replace(&self, sender: SessionSender) {
        let generation = sender.generation();
        *self.inner.write().await = Some(sender);
        debug!(generation, "Current session replaced");
    }

    /// Clear the pointer if it still refers to `generation`.
    pub async fn clear(&self, generation: u64) {
        let mut current = self.inner.write().await;
        if current.as_ref().map(SessionSender::generation) == Some(generation) {
            *current = None;
            debug!(generation, "Current session cleared");
        }
    }

    pub async fn get(&self) -> Option<SessionSender> {
        self.inner.read().await.clone()
    }

    /// Send through whichever session is live now.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        match self.get().await {
            Some(sender) => sender.send(envelope).await,
            None => Err(SessionError::Gone(0)),
        }
    }
}
