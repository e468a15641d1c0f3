//! Archive sinks.

#[cfg(feature = "fs")]
pub mod fs;
pub mod memory;
pub mod object;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use runner_shell_core::{Sink, SinkError};

#[cfg(feature = "fs")]
pub use fs::FsStore;
pub use memory::MemoryStore;
pub use object::{ObjectSink, ObjectStore, object_key};
#[cfg(feature = "s3")]
pub use s3::{S3Settings, S3Store};

/// Sink used when no archive is configured; lines are dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl Sink for DiscardSink {
    async fn append(&self, session_id: &str, lines: &[String]) -> Result<(), SinkError> {
        tracing::trace!(session_id, lines = lines.len(), "Archive disabled, dropping lines");
        Ok(())
    }
}
