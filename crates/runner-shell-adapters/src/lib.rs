//! Adapters for the runner shell.
//!
//! Provides:
//! - `ClaudeAdapter` - Status and heartbeat adapter registered as `claude`
//! - `AdapterRegistry` - Select an adapter by name at startup

pub mod claude;
pub mod registry;

pub use claude::ClaudeAdapter;
pub use registry::{AdapterFactory, AdapterRegistry};
