//! Read-then-overwrite archive over a key/value object store.
//!
//! Each append fetches the whole archive object, concatenates the new lines
//! and writes the result back. Two writers appending to the same session key
//! at the same time can lose a batch; a session must have a single writer.

use std::{io, sync::Arc};

use async_trait::async_trait;
use runner_shell_core::{Sink, SinkError};

/// Minimal object storage used by [`ObjectSink`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, `None` if it does not exist.
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Create or replace an object.
    async fn put(&self, key: &str, body: Vec<u8>) -> io::Result<()>;
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> io::Result<()> {
        (**self).put(key, body).await
    }
}

/// Archive object key for a session.
#[must_use]
pub fn object_key(prefix: &str, session_id: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        format!("sessions/{session_id}/messages.json")
    } else {
        format!("{prefix}/sessions/{session_id}/messages.json")
    }
}

/// [`Sink`] storing each session's lines as one newline-delimited object.
pub struct ObjectSink<S> {
    store: S,
    prefix: String,
}

impl<S: ObjectStore> ObjectSink<S> {
    #[must_use]
    pub fn new(store: S, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Key this sink writes for `session_id`.
    #[must_use]
    pub fn key_for(&self, session_id: &str) -> String {
        object_key(&self.prefix, session_id)
    }
}

#[async_trait]
impl<S: ObjectStore> Sink for ObjectSink<S> {
    async fn append(&self, session_id: &str, lines: &[String]) -> Result<(), SinkError> {
        let key = self.key_for(session_id);

        let mut body = self
            .store
            .get(&key)
            .await
            .map_err(|e| SinkError::Read {
                key: key.clone(),
                message: e.to_string(),
            })?
            .unwrap_or_default();

        for line in lines {
            body.extend_from_slice(line.as_bytes());
            if !line.ends_with('\n') {
                body.push(b'\n');
            }
        }

        let size = body.len();
        self.store.put(&key, body).await.map_err(|e| SinkError::Write {
            key: key.clone(),
            message: e.to_string(),
        })?;
        tracing::trace!(%key, lines = lines.len(), bytes = size, "Archive object written");
        Ok(())
    }
}
