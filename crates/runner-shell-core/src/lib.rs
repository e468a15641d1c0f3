//! Core abstractions for the runner shell.
//!
//! This crate provides the fundamental building blocks:
//! - `Envelope` - Event envelope and its structural validator
//! - `RunnerContext` - Session configuration from the environment
//! - `Transport`, `Channel`, `Sink` and `Adapter` traits

pub mod context;
pub mod envelope;
pub mod traits;

pub use context::{ConfigError, RunnerContext};
pub use envelope::{Envelope, EnvelopeBuilder, EventType, Level, Partial, ValidationError, validate};
pub use traits::{Adapter, AdapterError, Channel, Sink, SinkError, Transport, TransportError};
