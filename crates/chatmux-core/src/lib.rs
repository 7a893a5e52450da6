//! chatmux-core: shared types for the chatmux session connection manager.
//!
//! Provides connection status shapes, the error type, and the capability
//! traits the manager consumes: protocol transport, credential store and
//! status mirror.

pub mod credentials;
pub mod error;
pub mod mirror;
pub mod status;
pub mod transport;

// Re-export commonly used items at crate root.
pub use credentials::{CredentialMaterial, CredentialStore};
pub use error::{SessionError, SessionResult};
pub use mirror::StatusMirror;
pub use status::{
    AccountInfo, ConnectionCounts, ConnectionStatus, SessionSummary, StatusChange, StatusSnapshot,
};
pub use transport::{CloseCause, EventSink, ProtocolTransport, TransportEvent, TransportHandle};
