//! Session orchestrator.
//!
//! One [`Session`] drives one run: it connects the transport, announces the
//! session with an `init` envelope, then multiplexes the inbound receive loop
//! and the adapter's outbound forward loop on the current task until either
//! fails or the session is cancelled. Teardown always closes the channel,
//! shuts the adapter down and flushes the archive, each step independent of
//! the others.
//!
//! ```text
//!  INIT ──► RUNNING ──► DRAINING ──► CLOSED
//!             │  inbound:  receive ─► validate ─► record ─► on_input
//!             │  outbound: adapter ─► validate ─► send ─► record
//!             │  ticks:    on_tick (optional)
//!             └─ cancel(reason) ─► on_cancel
//! ```

use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt, stream::BoxStream};
use runner_shell_core::{
    Adapter, AdapterError, Channel, ConfigError, Envelope, EventType, RunnerContext, Sink,
    SinkError, Transport, TransportError, ValidationError, validate,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::buffer::ArchiveBuffer;

/// Version reported in the `init` envelope.
pub const RUNNER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Buffered lines that trigger an automatic flush.
    pub flush_threshold: usize,
    /// Capacity of the queue between the adapter's stream and the forward loop.
    pub outbound_capacity: usize,
    /// Cadence of `on_tick`; no ticks when `None`.
    pub tick_interval: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 10,
            outbound_capacity: 64,
            tick_interval: None,
        }
    }
}

impl SessionConfig {
    /// Defaults with the flush threshold taken from the runner context.
    #[must_use]
    pub fn from_context(ctx: &RunnerContext) -> Self {
        Self {
            flush_threshold: ctx.flush_threshold,
            ..Self::default()
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connecting and announcing the session.
    Init,
    /// Inbound and outbound loops are running.
    Running,
    /// Closing the channel, shutting the adapter down and flushing.
    Draining,
    /// Finished; nothing else will happen.
    Closed,
}

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Serialization error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Session cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("{cause}; teardown also failed: {}", join_errors(.failures))]
    Teardown {
        cause: Box<SessionError>,
        failures: Vec<SessionError>,
    },
}

impl SessionError {
    /// The error that ended the session, looking through teardown failures.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Teardown { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Whether the session ended because it was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::Cancelled { .. })
    }
}

fn join_errors(errors: &[SessionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Cancels a running session with a diagnostic reason.
///
/// Cloneable; the first reason given wins.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<StdMutex<Option<String>>>,
}

impl CancelHandle {
    /// Request cancellation.
    pub fn cancel(&self, reason: impl Into<String>) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert_with(|| reason.into());
        }
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason given to the first [`cancel`](Self::cancel) call.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    async fn cancelled(&self) -> String {
        self.token.cancelled().await;
        self.reason().unwrap_or_default()
    }
}

/// Aborts the outbound pump when the forward loop goes away.
struct PumpGuard(JoinHandle<()>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drain the adapter's stream into the forward loop's queue.
fn spawn_pump(mut stream: BoxStream<'static, Envelope>, tx: mpsc::Sender<Envelope>) -> PumpGuard {
    PumpGuard(tokio::spawn(async move {
        while let Some(envelope) = stream.next().await {
            if tx.send(envelope).await.is_err() {
                break;
            }
        }
    }))
}

/// One orchestrated session.
pub struct Session<T, K>
where
    T: Transport,
    K: Sink,
{
    ctx: RunnerContext,
    config: SessionConfig,
    transport: T,
    adapter: Arc<dyn Adapter>,
    archive: ArchiveBuffer<K>,
    cancel: CancelHandle,
    state: watch::Sender<SessionState>,
    cancel_notified: AtomicBool,
    shut_down: AtomicBool,
}

impl<T, K> Session<T, K>
where
    T: Transport,
    K: Sink,
{
    /// Create a session; nothing happens until [`run`](Self::run).
    #[must_use]
    pub fn new(
        ctx: RunnerContext,
        config: SessionConfig,
        transport: T,
        sink: K,
        adapter: Arc<dyn Adapter>,
    ) -> Self {
        let archive = ArchiveBuffer::new(ctx.session_id.clone(), sink, config.flush_threshold);
        let (state, _) = watch::channel(SessionState::Init);
        Self {
            ctx,
            config,
            transport,
            adapter,
            archive,
            cancel: CancelHandle::default(),
            state,
            cancel_notified: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Handle for cancelling this session from elsewhere.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Observe state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run the session to completion.
    ///
    /// The loops only end on an error, a closed channel or cancellation, so
    /// this returns the error that ended the session once teardown is done.
    /// Teardown failures are reported alongside that cause.
    ///
    /// Cancellation interrupts the loops only while they wait for the next
    /// inbound frame, the next adapter envelope or the next tick. Work already
    /// in progress, including an archive flush, runs to completion first.
    ///
    /// # Errors
    /// Returns the cause of the session ending.
    pub async fn run(self) -> Result<(), SessionError> {
        info!(
            session_id = %self.ctx.session_id,
            adapter = self.adapter.name(),
            "Session starting"
        );

        let connected = tokio::select! {
            connected = self.transport.connect() => connected.map_err(SessionError::from),
            reason = self.cancel.cancelled() => Err(SessionError::Cancelled { reason }),
        };
        let channel = match connected {
            Ok(channel) => channel,
            Err(e) => {
                warn!(session_id = %self.ctx.session_id, "Session not started: {e}");
                self.transition(SessionState::Closed);
                return Err(e);
            }
        };

        let outcome = self.drive(&channel).await;

        if let Err(e) = &outcome {
            info!(session_id = %self.ctx.session_id, "Session ending: {e}");
        }
        self.transition(SessionState::Draining);
        let failures = self.drain(&channel).await;
        self.transition(SessionState::Closed);

        conclude(outcome, failures)
    }

    async fn drive(&self, channel: &T::Channel) -> Result<(), SessionError> {
        let init = Envelope::builder(&self.ctx.session_id, EventType::Init, 1)
            .payload(self.ctx.init_payload(RUNNER_VERSION))
            .build();
        self.send(channel, &init).await?;
        self.adapter.on_init(&self.ctx).await?;

        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let _pump = spawn_pump(self.adapter.outbound_stream(&self.ctx), tx);
        self.transition(SessionState::Running);

        // Stops every loop: cancelled with the session, or by the first loop to fail.
        let stop = self.cancel.token.child_token();
        let (inbound, outbound, ticks) = tokio::join!(
            self.until_failure(&stop, "inbound", self.inbound_loop(channel, &stop)),
            self.until_failure(&stop, "outbound", self.outbound_loop(channel, rx, &stop)),
            self.until_failure(&stop, "tick", self.tick_loop(&stop)),
        );

        if let Some(cause) = [inbound, outbound, ticks].into_iter().flatten().next() {
            return Err(cause);
        }

        let reason = self.cancel.reason().unwrap_or_default();
        self.notify_cancel(&reason).await;
        Err(SessionError::Cancelled { reason })
    }

    /// Run one loop; the first loop to fail stops the others and owns the cause.
    ///
    /// Failures after the loops were told to stop are logged and dropped.
    async fn until_failure(
        &self,
        stop: &CancellationToken,
        name: &'static str,
        work: impl Future<Output = Result<(), SessionError>>,
    ) -> Option<SessionError> {
        let error = work.await.err()?;
        if stop.is_cancelled() {
            warn!(session_id = %self.ctx.session_id, task = name, "Failed while stopping: {error}");
            return None;
        }
        stop.cancel();
        debug!(session_id = %self.ctx.session_id, task = name, "Loop failed: {error}");
        Some(error)
    }

    async fn inbound_loop(
        &self,
        channel: &T::Channel,
        stop: &CancellationToken,
    ) -> Result<(), SessionError> {
        loop {
            let envelope = tokio::select! {
                biased;
                () = stop.cancelled() => return Ok(()),
                received = channel.receive() => received?,
            };
            validate(&envelope)?;
            trace!(seq = ?envelope.seq(), kind = ?envelope.event_type(), "Inbound envelope");
            self.archive.record(envelope.to_line()?).await?;

            if envelope.event_type().is_some_and(|t| !t.is_bookkeeping()) {
                self.adapter.on_input(&self.ctx, &envelope).await?;
            }
        }
    }

    async fn outbound_loop(
        &self,
        channel: &T::Channel,
        mut rx: mpsc::Receiver<Envelope>,
        stop: &CancellationToken,
    ) -> Result<(), SessionError> {
        loop {
            let envelope = tokio::select! {
                biased;
                () = stop.cancelled() => return Ok(()),
                next = rx.recv() => next,
            };
            let Some(envelope) = envelope else {
                break;
            };
            self.send(channel, &envelope).await?;
        }
        debug!(session_id = %self.ctx.session_id, "Adapter stream finished");
        // Nothing left to forward; the inbound loop decides when the session ends.
        stop.cancelled().await;
        Ok(())
    }

    async fn tick_loop(&self, stop: &CancellationToken) -> Result<(), SessionError> {
        let Some(period) = self.config.tick_interval else {
            stop.cancelled().await;
            return Ok(());
        };

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                () = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }
            self.adapter.on_tick(&self.ctx).await?;
        }
    }

    /// Validate, send and record one outbound envelope.
    async fn send(&self, channel: &T::Channel, envelope: &Envelope) -> Result<(), SessionError> {
        validate(envelope)?;
        channel.send(envelope).await?;
        trace!(seq = ?envelope.seq(), kind = ?envelope.event_type(), "Outbound envelope");
        self.archive.record(envelope.to_line()?).await?;
        Ok(())
    }

    async fn notify_cancel(&self, reason: &str) {
        if self.cancel_notified.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(session_id = %self.ctx.session_id, reason, "Session cancelled");
        if let Err(e) = self.adapter.on_cancel(&self.ctx, reason).await {
            warn!(session_id = %self.ctx.session_id, "Adapter cancel hook failed: {e}");
        }
    }

    async fn shutdown_adapter(&self) -> Result<(), AdapterError> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.adapter.on_shutdown(&self.ctx).await
    }

    /// Best-effort teardown; every step runs regardless of the others.
    async fn drain(&self, channel: &T::Channel) -> Vec<SessionError> {
        let mut failures = Vec::new();

        if let Err(e) = channel.close().await {
            warn!(session_id = %self.ctx.session_id, "Channel close failed: {e}");
            failures.push(e.into());
        }

        if let Err(e) = self.shutdown_adapter().await {
            warn!(session_id = %self.ctx.session_id, "Adapter shutdown failed: {e}");
            failures.push(e.into());
        }

        let pending = self.archive.pending().await;
        match self.archive.flush_all().await {
            Ok(()) => info!(
                session_id = %self.ctx.session_id,
                lines = pending,
                "Session drained"
            ),
            Err(e) => {
                tracing::error!(
                    session_id = %self.ctx.session_id,
                    lines = pending,
                    "Final flush failed: {e}"
                );
                failures.push(e.into());
            }
        }

        failures
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        debug!(session_id = %self.ctx.session_id, ?previous, ?next, "Session state");
    }
}

fn conclude(
    outcome: Result<(), SessionError>,
    mut failures: Vec<SessionError>,
) -> Result<(), SessionError> {
    let cause = match outcome {
        Err(cause) => cause,
        Ok(()) if failures.is_empty() => return Ok(()),
        Ok(()) => failures.remove(0),
    };
    if failures.is_empty() {
        Err(cause)
    } else {
        Err(SessionError::Teardown {
            cause: Box::new(cause),
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use runner_shell_transport::{MemoryPeer, MemoryTransport};
    use serde_json::{Value, json};

    use super::*;
    use crate::sink::{MemoryStore, ObjectSink};

    const SESSION: &str = "sess-test";

    #[derive(Default)]
    struct Hooks {
        init: AtomicUsize,
        input: StdMutex<Vec<Envelope>>,
        tick: AtomicUsize,
        cancel: StdMutex<Vec<String>>,
        shutdown: AtomicUsize,
    }

    /// Adapter that emits a fixed script, then either ends its stream or
    /// stays silent forever.
    struct ScriptedAdapter {
        script: Vec<Envelope>,
        hold_open: bool,
        fail_init: bool,
        fail_shutdown: bool,
        hooks: Arc<Hooks>,
    }

    impl ScriptedAdapter {
        fn new(script: Vec<Envelope>) -> (Arc<Self>, Arc<Hooks>) {
            let hooks = Arc::new(Hooks::default());
            let adapter = Self {
                script,
                hold_open: false,
                fail_init: false,
                fail_shutdown: false,
                hooks: Arc::clone(&hooks),
            };
            (Arc::new(adapter), hooks)
        }
    }

    #[async_trait]
    impl Adapter for ScriptedAdapter {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn on_init(&self, _ctx: &RunnerContext) -> Result<(), AdapterError> {
            self.hooks.init.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(AdapterError::Hook {
                    hook: "on_init",
                    message: "boom".into(),
                });
            }
            Ok(())
        }

        async fn on_input(&self, _ctx: &RunnerContext, envelope: &Envelope) -> Result<(), AdapterError> {
            self.hooks.input.lock().unwrap().push(envelope.clone());
            Ok(())
        }

        async fn on_tick(&self, _ctx: &RunnerContext) -> Result<(), AdapterError> {
            self.hooks.tick.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_cancel(&self, _ctx: &RunnerContext, reason: &str) -> Result<(), AdapterError> {
            self.hooks.cancel.lock().unwrap().push(reason.to_string());
            Ok(())
        }

        async fn on_shutdown(&self, _ctx: &RunnerContext) -> Result<(), AdapterError> {
            self.hooks.shutdown.fetch_add(1, Ordering::SeqCst);
            if self.fail_shutdown {
                return Err(AdapterError::Hook {
                    hook: "on_shutdown",
                    message: "stuck".into(),
                });
            }
            Ok(())
        }

        fn outbound_stream(&self, _ctx: &RunnerContext) -> BoxStream<'static, Envelope> {
            let script = futures::stream::iter(self.script.clone());
            if self.hold_open {
                script.chain(futures::stream::pending()).boxed()
            } else {
                script.boxed()
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: StdMutex<Vec<Vec<String>>>,
        fail: AtomicBool,
    }

    impl RecordingSink {
        fn batches(&self) -> Vec<Vec<Value>> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .map(|b| b.iter().map(|l| serde_json::from_str(l).unwrap()).collect())
                .collect()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn append(&self, session_id: &str, lines: &[String]) -> Result<(), SinkError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SinkError::Write {
                    key: session_id.to_string(),
                    message: "disk full".into(),
                });
            }
            self.batches.lock().unwrap().push(lines.to_vec());
            Ok(())
        }
    }

    fn ctx() -> RunnerContext {
        let mut ctx = RunnerContext::new(SESSION, "memory://");
        ctx.input_repo = Some("org/repo".into());
        ctx
    }

    fn outbound(seq: u64) -> Envelope {
        Envelope::builder(SESSION, EventType::Log, seq)
            .payload(json!({"line": format!("out-{seq}")}))
            .build()
    }

    fn inbound(n: u64) -> Value {
        json!({
            "id": format!("in-{n}"),
            "sessionId": SESSION,
            "ts": "2025-03-01T12:00:00Z",
            "type": "command_start",
            "level": "info",
            "seq": n,
            "payload": {"cmd": "ls"},
        })
    }

    fn session<K: Sink>(
        adapter: Arc<ScriptedAdapter>,
        sink: K,
    ) -> (Session<MemoryTransport, K>, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let session = Session::new(ctx(), SessionConfig::default(), transport, sink, adapter);
        (session, peer)
    }

    #[tokio::test]
    async fn test_eleven_envelopes_make_two_writes() {
        let script: Vec<Envelope> = (1..=5).map(outbound).collect();
        let (adapter, hooks) = ScriptedAdapter::new(script);
        let sink = Arc::new(RecordingSink::default());
        let (session, mut peer) = session(adapter, Arc::clone(&sink));
        let state = session.subscribe_state();

        let peer_task = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..6 {
                seen.push(peer.recv().await.unwrap());
            }
            for n in 1..=5 {
                peer.send(&inbound(n)).unwrap();
            }
            peer.hang_up();
            (peer, seen)
        });

        let result = session.run().await;
        let (peer, seen) = peer_task.await.unwrap();

        assert!(matches!(
            result,
            Err(SessionError::Transport(TransportError::ChannelClosed))
        ));
        assert_eq!(*state.borrow(), SessionState::Closed);
        assert!(peer.is_closed());

        assert_eq!(seen[0]["type"], "init");
        assert_eq!(seen[0]["seq"], 1);
        assert_eq!(seen[0]["payload"]["repo"], "org/repo");
        assert_eq!(seen[0]["payload"]["adapter"], "claude");

        let batches = sink.batches();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![10, 1]);

        let all: Vec<&Value> = batches.iter().flatten().collect();
        assert_eq!(all[0]["type"], "init");
        let out_seqs: Vec<u64> = all
            .iter()
            .filter(|v| v["type"] == "log")
            .map(|v| v["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(out_seqs, vec![1, 2, 3, 4, 5]);
        let in_ids: Vec<&str> = all
            .iter()
            .filter(|v| v["type"] == "command_start")
            .map(|v| v["id"].as_str().unwrap())
            .collect();
        assert_eq!(in_ids, vec!["in-1", "in-2", "in-3", "in-4", "in-5"]);

        assert_eq!(hooks.init.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.input.lock().unwrap().len(), 5);
        assert_eq!(hooks.shutdown.load(Ordering::SeqCst), 1);
        assert!(hooks.cancel.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_archive_holds_every_line() {
        let script: Vec<Envelope> = (1..=4).map(outbound).collect();
        let (adapter, _hooks) = ScriptedAdapter::new(script);
        let store = Arc::new(MemoryStore::new());
        let (session, mut peer) = session(adapter, ObjectSink::new(Arc::clone(&store), "runs"));

        let peer_task = tokio::spawn(async move {
            for _ in 0..5 {
                peer.recv().await.unwrap();
            }
            for n in 1..=6 {
                peer.send(&inbound(n)).unwrap();
            }
            peer.hang_up();
        });

        let result = session.run().await;
        peer_task.await.unwrap();
        assert!(result.is_err());

        let body = store
            .object(&format!("runs/sessions/{SESSION}/messages.json"))
            .unwrap();
        let body = String::from_utf8(body).unwrap();
        assert_eq!(body.lines().count(), 11);
        assert!(body.ends_with('\n'));
        assert_eq!(store.put_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_inbound_still_flushes_buffered_lines() {
        let (adapter, hooks) = ScriptedAdapter::new(Vec::new());
        let sink = Arc::new(RecordingSink::default());
        let (session, peer) = session(adapter, Arc::clone(&sink));

        peer.send(&inbound(1)).unwrap();
        peer.send(&inbound(2)).unwrap();
        let mut bad = inbound(3);
        bad["level"] = json!("fatal");
        peer.send(&bad).unwrap();

        let result = session.run().await;
        assert!(matches!(
            result,
            Err(SessionError::Validation(ValidationError::InvalidLevel(_)))
        ));

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[0][0]["type"], "init");
        assert_eq!(batches[0][1]["id"], "in-1");
        assert_eq!(batches[0][2]["id"], "in-2");
        assert_eq!(hooks.shutdown.load(Ordering::SeqCst), 1);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_bookkeeping_is_not_forwarded_to_adapter() {
        let (adapter, hooks) = ScriptedAdapter::new(Vec::new());
        let (session, mut peer) = session(adapter, Arc::new(RecordingSink::default()));

        let mut heartbeat = inbound(1);
        heartbeat["type"] = json!("heartbeat");
        peer.send(&heartbeat).unwrap();
        peer.send(&inbound(2)).unwrap();
        peer.hang_up();

        let _ = session.run().await;
        let forwarded = hooks.input.lock().unwrap();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].id(), Some("in-2"));
    }

    #[tokio::test]
    async fn test_invalid_outbound_is_never_sent() {
        let mut bad = outbound(1).as_map().clone();
        bad.insert("type".into(), json!("telemetry"));
        let (adapter, hooks) = ScriptedAdapter::new(vec![Envelope::from_map(bad), outbound(2)]);
        let sink = Arc::new(RecordingSink::default());
        let (session, mut peer) = session(adapter, Arc::clone(&sink));

        let result = session.run().await;
        assert!(matches!(
            result,
            Err(SessionError::Validation(ValidationError::InvalidType(_)))
        ));

        let sent = peer.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "init");
        assert_eq!(sink.batches(), vec![vec![sent[0].clone()]]);
        assert_eq!(hooks.shutdown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_runs_hooks_once_and_drains() {
        let status = Envelope::builder(SESSION, EventType::Status, 1)
            .payload(json!({"phase": "running"}))
            .build();
        let hooks = Arc::new(Hooks::default());
        let adapter = Arc::new(ScriptedAdapter {
            script: vec![status],
            hold_open: true,
            fail_init: false,
            fail_shutdown: false,
            hooks: Arc::clone(&hooks),
        });
        let sink = Arc::new(RecordingSink::default());
        let (session, mut peer) = session(adapter, Arc::clone(&sink));
        let cancel = session.cancel_handle();

        let run = tokio::spawn(session.run());
        peer.recv().await.unwrap();
        peer.recv().await.unwrap();
        cancel.cancel("operator abort");
        cancel.cancel("second request");

        let err = run.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(matches!(&err, SessionError::Cancelled { reason } if reason == "operator abort"));

        assert_eq!(*hooks.cancel.lock().unwrap(), vec!["operator abort".to_string()]);
        assert_eq!(hooks.shutdown.load(Ordering::SeqCst), 1);
        assert!(peer.is_closed());

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0]["type"], "init");
        assert_eq!(batches[0][1]["type"], "status");
    }

    #[tokio::test]
    async fn test_teardown_failures_are_reported_with_cause() {
        let hooks = Arc::new(Hooks::default());
        let adapter = Arc::new(ScriptedAdapter {
            script: Vec::new(),
            hold_open: false,
            fail_init: false,
            fail_shutdown: true,
            hooks: Arc::clone(&hooks),
        });
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);

        let (transport, mut peer) = MemoryTransport::pair();
        let config = SessionConfig {
            flush_threshold: 1,
            ..SessionConfig::default()
        };
        let session = Session::new(ctx(), config, transport, Arc::clone(&sink), adapter);

        let err = session.run().await.unwrap_err();
        match &err {
            SessionError::Teardown { cause, failures } => {
                assert!(matches!(**cause, SessionError::Sink(_)));
                assert_eq!(failures.len(), 2);
                assert!(matches!(failures[0], SessionError::Adapter(_)));
                assert!(matches!(failures[1], SessionError::Sink(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(err.root_cause(), SessionError::Sink(_)));
        assert!(err.to_string().contains("teardown also failed"));

        // The init envelope went out before the flush failed.
        assert_eq!(peer.drain().len(), 1);
        assert!(peer.is_closed());
        assert_eq!(hooks.shutdown.load(Ordering::SeqCst), 1);
        assert_eq!(hooks.init.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_init_hook_failure_still_tears_down() {
        let hooks = Arc::new(Hooks::default());
        let adapter = Arc::new(ScriptedAdapter {
            script: vec![outbound(1)],
            hold_open: false,
            fail_init: true,
            fail_shutdown: false,
            hooks: Arc::clone(&hooks),
        });
        let sink = Arc::new(RecordingSink::default());
        let (session, peer) = session(adapter, Arc::clone(&sink));

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, SessionError::Adapter(AdapterError::Hook { hook: "on_init", .. })));
        assert_eq!(hooks.shutdown.load(Ordering::SeqCst), 1);
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(sink.batches()[0].len(), 1);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_connect_failure_skips_teardown() {
        let (adapter, hooks) = ScriptedAdapter::new(Vec::new());
        let (transport, _peer) = MemoryTransport::pair();
        transport.connect().await.unwrap();
        let session = Session::new(
            ctx(),
            SessionConfig::default(),
            transport,
            Arc::new(RecordingSink::default()),
            adapter,
        );
        let state = session.subscribe_state();

        let err = session.run().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::Connection(_))
        ));
        assert_eq!(*state.borrow(), SessionState::Closed);
        assert_eq!(hooks.init.load(Ordering::SeqCst), 0);
        assert_eq!(hooks.shutdown.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_hook_follows_interval() {
        let hooks = Arc::new(Hooks::default());
        let adapter = Arc::new(ScriptedAdapter {
            script: Vec::new(),
            hold_open: true,
            fail_init: false,
            fail_shutdown: false,
            hooks: Arc::clone(&hooks),
        });
        let (transport, _peer) = MemoryTransport::pair();
        let config = SessionConfig {
            tick_interval: Some(Duration::from_secs(1)),
            ..SessionConfig::default()
        };
        let session = Session::new(
            ctx(),
            config,
            transport,
            Arc::new(RecordingSink::default()),
            adapter,
        );
        let cancel = session.cancel_handle();

        let run = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel("done");

        assert!(run.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(hooks.tick.load(Ordering::SeqCst), 3);
    }

    /// Records each batch, then holds the append open for a while.
    #[derive(Default)]
    struct SlowSink {
        lines: StdMutex<Vec<String>>,
        appends: AtomicUsize,
    }

    #[async_trait]
    impl Sink for SlowSink {
        async fn append(&self, _session_id: &str, lines: &[String]) -> Result<(), SinkError> {
            self.lines.lock().unwrap().extend_from_slice(lines);
            self.appends.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_waits_for_in_flight_flush() {
        let hooks = Arc::new(Hooks::default());
        let adapter = Arc::new(ScriptedAdapter {
            script: (1..=9).map(outbound).collect(),
            hold_open: true,
            fail_init: false,
            fail_shutdown: false,
            hooks: Arc::clone(&hooks),
        });
        let sink = Arc::new(SlowSink::default());
        let (session, _peer) = session(adapter, Arc::clone(&sink));
        let cancel = session.cancel_handle();

        let run = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.appends.load(Ordering::SeqCst), 1);
        cancel.cancel("stop");

        let err = run.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());

        // The threshold flush completed and cleared the buffer, so the final
        // flush had nothing left to write.
        assert_eq!(sink.appends.load(Ordering::SeqCst), 1);
        assert_eq!(sink.lines.lock().unwrap().len(), 10);
        assert_eq!(*hooks.cancel.lock().unwrap(), vec!["stop".to_string()]);
        assert_eq!(hooks.shutdown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_failure_waits_for_outbound_flush() {
        let hooks = Arc::new(Hooks::default());
        let adapter = Arc::new(ScriptedAdapter {
            script: (1..=9).map(outbound).collect(),
            hold_open: true,
            fail_init: false,
            fail_shutdown: false,
            hooks: Arc::clone(&hooks),
        });
        let sink = Arc::new(SlowSink::default());
        let (session, peer) = session(adapter, Arc::clone(&sink));

        let run = tokio::spawn(session.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.send_raw("not json").unwrap();

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transport(TransportError::Decode(_))
        ));
        assert_eq!(sink.appends.load(Ordering::SeqCst), 1);
        assert_eq!(sink.lines.lock().unwrap().len(), 10);
        assert!(hooks.cancel.lock().unwrap().is_empty());
    }

    /// Transport whose dial never completes.
    struct HangingTransport;

    #[async_trait]
    impl Transport for HangingTransport {
        type Channel = runner_shell_transport::MemoryChannel;

        async fn connect(&self) -> Result<Self::Channel, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_connect() {
        let (adapter, hooks) = ScriptedAdapter::new(Vec::new());
        let sink = Arc::new(RecordingSink::default());
        let session = Session::new(
            ctx(),
            SessionConfig::default(),
            HangingTransport,
            Arc::clone(&sink),
            adapter,
        );
        let state = session.subscribe_state();
        let cancel = session.cancel_handle();

        let run = tokio::spawn(session.run());
        tokio::task::yield_now().await;
        cancel.cancel("interrupted");

        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(&err, SessionError::Cancelled { reason } if reason == "interrupted"));
        assert_eq!(*state.borrow(), SessionState::Closed);
        assert_eq!(hooks.init.load(Ordering::SeqCst), 0);
        assert!(hooks.cancel.lock().unwrap().is_empty());
        assert_eq!(hooks.shutdown.load(Ordering::SeqCst), 0);
        assert!(sink.batches().is_empty());
    }
}
