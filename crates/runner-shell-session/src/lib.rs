//! Session orchestration and archival for the runner shell.
//!
//! Provides:
//! - `Session` - Drive one session over a transport, adapter and sink
//! - `ArchiveBuffer` - Threshold-triggered archival of envelope lines
//! - Sink implementations (object store over S3, filesystem or memory; discard)

pub mod buffer;
pub mod orchestrator;
pub mod sink;

pub use buffer::{ArchiveBuffer, LineBuffer};
pub use orchestrator::{
    CancelHandle, RUNNER_VERSION, Session, SessionConfig, SessionError, SessionState,
};
