//! Protocol transports: the WebSocket sidecar bridge and a test double.

pub mod bridge;
#[cfg(test)]
pub mod mock;

pub use bridge::{BridgeConfig, BridgeTransport};
