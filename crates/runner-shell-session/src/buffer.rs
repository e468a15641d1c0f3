//! Buffered archival of serialized envelope lines.

use runner_shell_core::{Sink, SinkError};
use tokio::sync::Mutex;

/// Pending lines awaiting archival.
#[derive(Debug)]
pub struct LineBuffer {
    lines: Vec<String>,
    threshold: usize,
}

impl LineBuffer {
    /// Create a buffer that reports a flush is due at `threshold` lines.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            lines: Vec::with_capacity(threshold),
            threshold: threshold.max(1),
        }
    }

    /// Append a line; returns `true` when the buffer has reached its threshold.
    pub fn push(&mut self, line: String) -> bool {
        self.lines.push(line);
        self.is_due()
    }

    /// Whether the buffer holds at least `threshold` lines.
    #[must_use]
    pub fn is_due(&self) -> bool {
        self.lines.len() >= self.threshold
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// A [`LineBuffer`] bound to a sink and a session.
///
/// Every mutation happens under one async mutex, so appending a line, the
/// threshold check and the resulting flush are atomic with respect to each
/// other even when the inbound and outbound loops record concurrently.
pub struct ArchiveBuffer<K> {
    session_id: String,
    sink: K,
    buffer: Mutex<LineBuffer>,
}

impl<K: Sink> ArchiveBuffer<K> {
    /// Create an archive buffer for `session_id`.
    #[must_use]
    pub fn new(session_id: impl Into<String>, sink: K, threshold: usize) -> Self {
        Self {
            session_id: session_id.into(),
            sink,
            buffer: Mutex::new(LineBuffer::new(threshold)),
        }
    }

    /// Buffer one line, flushing synchronously if the threshold is reached.
    ///
    /// # Errors
    /// Returns error if the triggered flush fails; the lines stay buffered.
    pub async fn record(&self, line: String) -> Result<(), SinkError> {
        let mut buffer = self.buffer.lock().await;
        if buffer.push(line) {
            self.flush_locked(&mut buffer).await?;
        }
        Ok(())
    }

    /// Write every buffered line regardless of the threshold.
    ///
    /// # Errors
    /// Returns error if the sink append fails; the lines stay buffered.
    pub async fn flush_all(&self) -> Result<(), SinkError> {
        let mut buffer = self.buffer.lock().await;
        self.flush_locked(&mut buffer).await
    }

    /// Number of lines currently buffered.
    pub async fn pending(&self) -> usize {
        self.buffer.lock().await.len()
    }

    async fn flush_locked(&self, buffer: &mut LineBuffer) -> Result<(), SinkError> {
        if buffer.is_empty() {
            return Ok(());
        }
        self.sink.append(&self.session_id, buffer.lines()).await?;
        tracing::debug!(
            session_id = %self.session_id,
            lines = buffer.len(),
            "Flushed archive buffer"
        );
        buffer.clear();
        Ok(())
    }
}
