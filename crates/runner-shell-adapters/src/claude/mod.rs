//! Claude adapter.

pub mod adapter;

pub use adapter::{ClaudeAdapter, NAME};
