//! Heartbeat adapter registered as `claude`.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use runner_shell_core::{Adapter, AdapterError, Envelope, EventType, RunnerContext};
use serde_json::json;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

/// Registry name.
pub const NAME: &str = "claude";

/// Reports a running status, then heartbeats until the session ends.
#[derive(Debug)]
pub struct ClaudeAdapter {
    heartbeat_interval: Duration,
    cancelled: AtomicBool,
}

impl ClaudeAdapter {
    #[must_use]
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            heartbeat_interval: heartbeat_interval.max(Duration::from_millis(1)),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Adapter using the context's heartbeat interval.
    #[must_use]
    pub fn from_context(ctx: &RunnerContext) -> Self {
        Self::new(ctx.heartbeat_interval)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Whether the session cancelled this adapter.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Adapter for ClaudeAdapter {
    fn name(&self) -> &str {
        NAME
    }

    async fn on_init(&self, ctx: &RunnerContext) -> Result<(), AdapterError> {
        tracing::info!(
            session_id = %ctx.session_id,
            repo = ctx.input_repo.as_deref().unwrap_or("-"),
            interval_ms = u64::try_from(self.heartbeat_interval.as_millis()).unwrap_or(u64::MAX),
            "Claude adapter ready"
        );
        Ok(())
    }

    async fn on_input(&self, ctx: &RunnerContext, envelope: &Envelope) -> Result<(), AdapterError> {
        tracing::debug!(
            session_id = %ctx.session_id,
            kind = ?envelope.event_type(),
            seq = ?envelope.seq(),
            "Claude adapter received input"
        );
        Ok(())
    }

    async fn on_cancel(&self, ctx: &RunnerContext, reason: &str) -> Result<(), AdapterError> {
        self.cancelled.store(true, Ordering::SeqCst);
        tracing::info!(session_id = %ctx.session_id, reason, "Claude adapter cancelled");
        Ok(())
    }

    async fn on_shutdown(&self, ctx: &RunnerContext) -> Result<(), AdapterError> {
        tracing::info!(session_id = %ctx.session_id, "Claude adapter shut down");
        Ok(())
    }

    /// Must be called from within a Tokio runtime.
    fn outbound_stream(&self, ctx: &RunnerContext) -> BoxStream<'static, Envelope> {
        let session_id = ctx.session_id.clone();
        let status = Envelope::builder(&session_id, EventType::Status, 1)
            .payload(json!({"phase": "running", "progress": 0}))
            .build();

        let period = self.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let heartbeats = IntervalStream::new(ticker)
            .zip(stream::iter(2_u64..))
            .map(move |(_, seq)| {
                Envelope::builder(&session_id, EventType::Heartbeat, seq)
                    .payload(json!({}))
                    .build()
            });

        stream::once(async move { status }).chain(heartbeats).boxed()
    }
}
