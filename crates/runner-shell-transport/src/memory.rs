//! In-memory transport for tests and embedding.
//!
//! [`MemoryTransport::pair`] returns the session side and a [`MemoryPeer`]
//! standing in for the remote control peer. Frames travel as JSON text over
//! unbounded queues, so the peer can inject anything, including envelopes
//! the validator will reject.

use std::sync::{
    Arc, Mutex as StdMutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use runner_shell_core::{Channel, Envelope, Transport, TransportError};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, mpsc};

use crate::protocol::{decode, encode};

/// Session side of an in-memory connection. Connects exactly once.
pub struct MemoryTransport {
    channel: StdMutex<Option<MemoryChannel>>,
}

impl MemoryTransport {
    /// Create a connected transport/peer pair.
    #[must_use]
    pub fn pair() -> (Self, MemoryPeer) {
        let (to_session, from_peer) = mpsc::unbounded_channel();
        let (to_peer, from_session) = mpsc::unbounded_channel();
        let closed = Arc::new(ClosedFlag::default());

        let channel = MemoryChannel {
            outgoing: StdMutex::new(Some(to_peer)),
            incoming: Mutex::new(from_peer),
            closed: Arc::clone(&closed),
        };

        let transport = Self {
            channel: StdMutex::new(Some(channel)),
        };

        let peer = MemoryPeer {
            to_session: Some(to_session),
            from_session,
            closed,
        };

        (transport, peer)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Channel = MemoryChannel;

    async fn connect(&self) -> Result<MemoryChannel, TransportError> {
        self.channel
            .lock()
            .map_err(|e| TransportError::Connection(e.to_string()))?
            .take()
            .ok_or_else(|| TransportError::Connection("memory transport already connected".into()))
    }
}

#[derive(Default)]
struct ClosedFlag {
    closed: AtomicBool,
    notify: Notify,
}

/// Session end of an in-memory connection.
pub struct MemoryChannel {
    outgoing: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    incoming: Mutex<mpsc::UnboundedReceiver<String>>,
    closed: Arc<ClosedFlag>,
}

impl MemoryChannel {
    fn is_closed(&self) -> bool {
        self.closed.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let frame = encode(envelope)?;
        let outgoing = self
            .outgoing
            .lock()
            .map_err(|e| TransportError::Send(e.to_string()))?;
        let sender = outgoing
            .as_ref()
            .ok_or_else(|| TransportError::Send("channel closed".into()))?;
        sender
            .send(frame)
            .map_err(|_| TransportError::Send("peer disconnected".into()))
    }

    async fn receive(&self) -> Result<Envelope, TransportError> {
        let notified = self.closed.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_closed() {
            return Err(TransportError::ChannelClosed);
        }

        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            () = &mut notified => Err(TransportError::ChannelClosed),
            frame = incoming.recv() => match frame {
                Some(frame) => decode(&frame),
                None => Err(TransportError::ChannelClosed),
            },
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.take();
        }
        self.closed.notify.notify_waiters();
        tracing::debug!("Memory channel closed");
        Ok(())
    }
}

/// Remote end of an in-memory connection.
pub struct MemoryPeer {
    to_session: Option<mpsc::UnboundedSender<String>>,
    from_session: mpsc::UnboundedReceiver<String>,
    closed: Arc<ClosedFlag>,
}

impl MemoryPeer {
    /// Send a JSON value to the session as one frame.
    ///
    /// # Errors
    /// Returns error if the session side is gone or the peer hung up.
    pub fn send(&self, value: &Value) -> Result<(), TransportError> {
        self.send_raw(value.to_string())
    }

    /// Send a raw text frame to the session.
    ///
    /// # Errors
    /// Returns error if the session side is gone or the peer hung up.
    pub fn send_raw(&self, frame: impl Into<String>) -> Result<(), TransportError> {
        self.to_session
            .as_ref()
            .ok_or(TransportError::ChannelClosed)?
            .send(frame.into())
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Wait for the next frame the session sent; `None` once the session
    /// closed its side and the queue is drained.
    pub async fn recv(&mut self) -> Option<Value> {
        let frame = self.from_session.recv().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Drain every frame the session has sent so far.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_session.try_recv() {
            if let Ok(value) = serde_json::from_str(&frame) {
                frames.push(value);
            }
        }
        frames
    }

    /// Stop sending; the session's pending receive fails with
    /// [`TransportError::ChannelClosed`] once queued frames are consumed.
    pub fn hang_up(&mut self) {
        self.to_session.take();
    }

    /// Whether the session closed its channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.closed.load(Ordering::SeqCst)
    }
}
