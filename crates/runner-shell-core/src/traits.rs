//! Collaborator traits consumed by the session orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::{Envelope, RunnerContext};

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Undecodable frame: {0}")]
    Decode(String),
}

/// Factory for the duplex channel to the control peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Channel produced by a successful connect.
    type Channel: Channel;

    /// Establish the channel.
    async fn connect(&self) -> Result<Self::Channel, TransportError>;
}

/// Ordered, bidirectional envelope channel.
///
/// Sending and receiving take `&self` so the inbound and outbound loops can
/// use the channel at the same time.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send one envelope.
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Wait for the next envelope from the peer.
    ///
    /// Returns [`TransportError::ChannelClosed`] once the channel is closed
    /// or broken.
    async fn receive(&self) -> Result<Envelope, TransportError>;

    /// Close the channel. Calling this more than once is a no-op.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Sink error.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Archive read failed for {key}: {message}")]
    Read { key: String, message: String },
    #[error("Archive write failed for {key}: {message}")]
    Write { key: String, message: String },
}

/// Append-only archive of a session's envelope lines.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Append serialized envelopes, in order, to the session's archive.
    async fn append(&self, session_id: &str, lines: &[String]) -> Result<(), SinkError>;
}

#[async_trait]
impl<T: Sink + ?Sized> Sink for Arc<T> {
    async fn append(&self, session_id: &str, lines: &[String]) -> Result<(), SinkError> {
        (**self).append(session_id, lines).await
    }
}

/// Adapter error.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Unknown adapter: {0}")]
    Unknown(String),
    #[error("Adapter {hook} failed: {message}")]
    Hook { hook: &'static str, message: String },
}

/// Pluggable unit of work driven by a session.
///
/// Every hook has a no-op default; adapters override what they need.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Called once after the `init` envelope is sent, before the loops start.
    async fn on_init(&self, _ctx: &RunnerContext) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Called for inbound envelopes that are not protocol bookkeeping.
    async fn on_input(&self, _ctx: &RunnerContext, _envelope: &Envelope) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Periodic hook.
    async fn on_tick(&self, _ctx: &RunnerContext) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Called at most once when the session is cancelled.
    async fn on_cancel(&self, _ctx: &RunnerContext, _reason: &str) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Called exactly once during teardown, before the final flush.
    async fn on_shutdown(&self, _ctx: &RunnerContext) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Lazy, non-restartable stream of envelopes to send to the peer.
    fn outbound_stream(&self, ctx: &RunnerContext) -> BoxStream<'static, Envelope>;
}
