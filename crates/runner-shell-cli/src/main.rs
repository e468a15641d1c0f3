//! Runner shell: drives one session against the control channel.
//!
//! Run with: `SESSION_ID=... WS_URL=wss://... runner-shell`
//!
//! Set `S3_BUCKET` and `S3_PREFIX` to archive the session to S3, or
//! `ARCHIVE_DIR` to keep it on disk. `RUST_LOG` adjusts log verbosity.

use std::sync::Arc;

use anyhow::Context;
use runner_shell_adapters::AdapterRegistry;
use runner_shell_core::{RunnerContext, Sink};
use runner_shell_session::{
    CancelHandle, Session, SessionConfig,
    sink::{DiscardSink, FsStore, ObjectSink, S3Settings, S3Store},
};
use runner_shell_transport::WebSocketTransport;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let ctx = RunnerContext::from_env().context("loading runner configuration")?;
    let adapter = AdapterRegistry::default()
        .select(&ctx.runner_adapter, &ctx)
        .context("selecting adapter")?;
    let transport = WebSocketTransport::new(&ctx.ws_url, &ctx.auth_token);
    let sink = build_sink(&ctx).context("configuring session archive")?;
    let config = SessionConfig::from_context(&ctx);

    tracing::info!(
        session_id = %ctx.session_id,
        adapter = %ctx.runner_adapter,
        s3_bucket = ?ctx.s3_bucket,
        archive_dir = ?ctx.archive_dir,
        "Starting runner shell"
    );

    let session = Session::new(ctx, config, transport, sink, adapter);
    tokio::spawn(forward_signals(session.cancel_handle()));

    match session.run().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => {
            tracing::info!("Session cancelled: {e}");
            Ok(())
        }
        Err(e) => Err(e).context("session failed"),
    }
}

/// Archive sink for the context: S3 when bucket and prefix are set, else
/// files under `ARCHIVE_DIR`, else nothing.
fn build_sink(ctx: &RunnerContext) -> std::io::Result<Arc<dyn Sink>> {
    if let Some((settings, prefix)) = S3Settings::from_context(ctx) {
        return Ok(Arc::new(ObjectSink::new(S3Store::new(settings)?, prefix)));
    }
    if let Some(dir) = &ctx.archive_dir {
        return Ok(Arc::new(ObjectSink::new(FsStore::new(dir), &ctx.archive_prefix)));
    }
    tracing::warn!("No archive configured, session will not be archived");
    Ok(Arc::new(DiscardSink))
}

/// Cancel the session on Ctrl-C or, on Unix, SIGTERM.
async fn forward_signals(cancel: CancelHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => cancel.cancel("interrupted"),
                    _ = term.recv() => cancel.cancel("terminated"),
                }
                return;
            }
            Err(e) => tracing::warn!("Cannot listen for SIGTERM: {e}"),
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        cancel.cancel("interrupted");
    }
}
