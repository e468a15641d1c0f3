//! Envelope transports for the runner shell.
//!
//! Provides:
//! - Wire framing (one JSON object per text frame)
//! - WebSocket client transport (feature: websocket)
//! - In-memory transport pair for tests and embedding

pub mod memory;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{MemoryChannel, MemoryPeer, MemoryTransport};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketChannel, WebSocketTransport};
