//! In-memory state for one session's connection.

use chatmux_core::{AccountInfo, ConnectionStatus, SessionSummary, StatusSnapshot, TransportHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Callback invoked with each new login code.
pub type QrCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// What the record currently holds on the transport side.
pub enum Link {
    /// `ProtocolTransport::open` is in flight.
    Opening,
    Live(Arc<dyn TransportHandle>),
    /// Waiting for a scheduled reconnect.
    Backoff,
}

/// One registry entry. Owned exclusively by the manager's registry.
pub struct ConnectionRecord {
    pub session_id: String,
    pub status: ConnectionStatus,
    pub link: Link,
    /// Last unconsumed login code; only set while `QrReady`.
    pub pending_qr: Option<String>,
    pub account: Option<AccountInfo>,
    /// Start of the current connecting attempt.
    pub created_at: Instant,
    /// Reconnects scheduled since the last successful connect.
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    /// Identifies the current connection attempt. Events, timers and sweeps
    /// carrying an older epoch are ignored.
    pub epoch: u64,
    pub on_qr: Option<QrCallback>,
}

impl ConnectionRecord {
    pub fn new(
        session_id: impl Into<String>,
        epoch: u64,
        max_reconnect_attempts: u32,
        on_qr: Option<QrCallback>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            status: ConnectionStatus::Connecting,
            link: Link::Opening,
            pending_qr: None,
            account: None,
            created_at: Instant::now(),
            reconnect_attempts: 0,
            max_reconnect_attempts,
            epoch,
            on_qr,
        }
    }

    /// Reset per-attempt state for a new open. The retry counter carries forward.
    pub fn begin_attempt(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.status = ConnectionStatus::Connecting;
        self.link = Link::Opening;
        self.pending_qr = None;
        self.account = None;
        self.created_at = Instant::now();
    }

    pub fn handle(&self) -> Option<Arc<dyn TransportHandle>> {
        match &self.link {
            Link::Live(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// An open is running or a live connection has not finished its login.
    pub fn is_in_flight(&self) -> bool {
        match self.link {
            Link::Opening => true,
            Link::Live(_) => self.status != ConnectionStatus::Connected,
            Link::Backoff => false,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn mark_qr(&mut self, code: String) {
        self.status = ConnectionStatus::QrReady;
        self.pending_qr = Some(code);
        self.reconnect_attempts = 0;
    }

    pub fn mark_connected(&mut self, account: AccountInfo) {
        self.status = ConnectionStatus::Connected;
        self.pending_qr = None;
        self.account = Some(account);
        self.reconnect_attempts = 0;
    }

    /// The live transport is re-running its handshake. Starts a new
    /// connecting period without touching the retry counter.
    pub fn mark_connecting(&mut self) {
        self.status = ConnectionStatus::Connecting;
        self.pending_qr = None;
        self.created_at = Instant::now();
    }

    /// Drop the transport and wait for a scheduled reconnect.
    pub fn enter_backoff(&mut self, status: ConnectionStatus) {
        self.status = status;
        self.link = Link::Backoff;
        self.pending_qr = None;
        self.created_at = Instant::now();
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let account = self.account.clone().unwrap_or_default();
        StatusSnapshot {
            status: self.status,
            pending_qr: self.pending_qr.clone(),
            jid: account.jid,
            name: account.name,
            is_ready: self.status == ConnectionStatus::Connected,
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            status: self.status,
            has_qr: self.pending_qr.is_some(),
            is_ready: self.status == ConnectionStatus::Connected,
            age_secs: self.age().as_secs(),
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_opening() {
        let rec = ConnectionRecord::new("s1", 1, 3, None);
        assert_eq!(rec.status, ConnectionStatus::Connecting);
        assert!(rec.is_in_flight());
        assert!(rec.handle().is_none());
        assert_eq!(rec.reconnect_attempts, 0);
    }

    #[test]
    fn qr_then_connected_clears_code() {
        let mut rec = ConnectionRecord::new("s1", 1, 3, None);
        rec.reconnect_attempts = 2;
        rec.mark_qr("code-1".into());
        assert_eq!(rec.status, ConnectionStatus::QrReady);
        assert_eq!(rec.reconnect_attempts, 0);
        assert_eq!(rec.snapshot().pending_qr.as_deref(), Some("code-1"));

        rec.reconnect_attempts = 1;
        rec.mark_connected(AccountInfo {
            jid: Some("123@s.whatsapp.net".into()),
            name: Some("Desk".into()),
        });
        let snap = rec.snapshot();
        assert!(snap.is_ready);
        assert!(snap.pending_qr.is_none());
        assert_eq!(snap.jid.as_deref(), Some("123@s.whatsapp.net"));
        assert_eq!(rec.reconnect_attempts, 0);
    }

    #[test]
    fn backoff_is_not_in_flight() {
        let mut rec = ConnectionRecord::new("s1", 1, 3, None);
        rec.mark_qr("c".into());
        rec.enter_backoff(ConnectionStatus::Connecting);
        assert!(!rec.is_in_flight());
        assert!(rec.pending_qr.is_none());
        assert!(!rec.summary().has_qr);
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_connected_restarts_the_attempt_clock() {
        let mut rec = ConnectionRecord::new("s1", 1, 3, None);
        rec.mark_connected(AccountInfo::default());
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(rec.age() >= Duration::from_secs(3600));

        rec.mark_connecting();
        assert_eq!(rec.age(), Duration::ZERO);
        assert_eq!(rec.status, ConnectionStatus::Connecting);

        rec.mark_connected(AccountInfo::default());
        tokio::time::advance(Duration::from_secs(3600)).await;
        rec.reconnect_attempts = 1;
        rec.enter_backoff(ConnectionStatus::Connecting);
        assert_eq!(rec.age(), Duration::ZERO);
        assert_eq!(rec.reconnect_attempts, 1);
    }

    #[test]
    fn begin_attempt_keeps_counter() {
        let mut rec = ConnectionRecord::new("s1", 1, 3, None);
        rec.reconnect_attempts = 2;
        rec.enter_backoff(ConnectionStatus::Error);
        rec.begin_attempt(7);
        assert_eq!(rec.epoch, 7);
        assert_eq!(rec.reconnect_attempts, 2);
        assert_eq!(rec.status, ConnectionStatus::Connecting);
        assert!(rec.is_in_flight());
    }
}
