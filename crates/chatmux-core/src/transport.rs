//! Protocol transport capability.
//!
//! The chat protocol itself lives behind [`ProtocolTransport`]: given credential
//! material it opens a connection, reports lifecycle events through an
//! [`EventSink`] and hands back a [`TransportHandle`] for outbound sends.

use crate::credentials::CredentialMaterial;
use crate::error::SessionResult;
use crate::status::AccountInfo;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Well-known disconnect status codes reported by the protocol library.
pub mod disconnect_code {
    pub const LOGGED_OUT: u16 = 401;
    pub const CONNECTION_LOST: u16 = 408;
}

/// Why a connection closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseCause {
    pub code: Option<u16>,
    #[serde(default)]
    pub reason: String,
    /// Set when the transport itself knows whether credentials were revoked.
    #[serde(default)]
    pub logged_out: Option<bool>,
}

impl CloseCause {
    pub fn new(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            logged_out: None,
        }
    }

    pub fn logged_out(reason: impl Into<String>) -> Self {
        Self {
            code: Some(disconnect_code::LOGGED_OUT),
            reason: reason.into(),
            logged_out: Some(true),
        }
    }

    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::new(Some(disconnect_code::CONNECTION_LOST), reason)
    }
}

/// Lifecycle events emitted by a live connection, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A login code to be approved out of band.
    Qr(String),
    /// The transport is (re)running its handshake.
    Connecting,
    Open(AccountInfo),
    Close(CloseCause),
    /// New credential material that must be persisted.
    CredentialsUpdated(CredentialMaterial),
}

/// Sending half handed to the transport on open.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Deliver an event. Returns `false` once nobody is listening anymore.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// A live connection returned by [`ProtocolTransport::open`].
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Send an outbound payload and return the transport's outcome.
    async fn send(&self, payload: serde_json::Value) -> SessionResult<serde_json::Value>;

    /// End the connection. Ending an already-closed connection is not an error.
    async fn end(&self) -> SessionResult<()>;
}

/// Factory for protocol connections.
#[async_trait]
pub trait ProtocolTransport: Send + Sync {
    /// Open a connection for `session_id` using `credentials`; events go to `events`.
    async fn open(
        &self,
        session_id: &str,
        credentials: CredentialMaterial,
        events: EventSink,
    ) -> SessionResult<Arc<dyn TransportHandle>>;

    /// Whether a close cause means the credentials were revoked and the
    /// session must not be retried.
    fn is_permanent_cause(&self, cause: &CloseCause) -> bool {
        cause
            .logged_out
            .unwrap_or(cause.code == Some(disconnect_code::LOGGED_OUT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTransport;

    #[async_trait]
    impl ProtocolTransport for NullTransport {
        async fn open(
            &self,
            _session_id: &str,
            _credentials: CredentialMaterial,
            _events: EventSink,
        ) -> SessionResult<Arc<dyn TransportHandle>> {
            Err(crate::SessionError::TransportInit("null".into()))
        }
    }

    #[test]
    fn default_classification() {
        let t = NullTransport;
        assert!(t.is_permanent_cause(&CloseCause::logged_out("revoked")));
        assert!(t.is_permanent_cause(&CloseCause::new(Some(401), "")));
        assert!(!t.is_permanent_cause(&CloseCause::connection_lost("blip")));
        assert!(!t.is_permanent_cause(&CloseCause::new(None, "eof")));
    }

    #[test]
    fn explicit_hint_overrides_code() {
        let t = NullTransport;
        let cause = CloseCause {
            code: Some(401),
            reason: "stream error".into(),
            logged_out: Some(false),
        };
        assert!(!t.is_permanent_cause(&cause));
    }

    #[tokio::test]
    async fn sink_reports_dropped_receiver() {
        let (sink, mut rx) = EventSink::channel();
        assert!(sink.emit(TransportEvent::Connecting));
        assert_eq!(rx.recv().await, Some(TransportEvent::Connecting));
        drop(rx);
        assert!(!sink.emit(TransportEvent::Qr("x".into())));
    }
}
