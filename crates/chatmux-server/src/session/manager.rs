//! Session connection manager.
//!
//! Tracks every active connection record, drives each session's state machine
//! from transport events, applies the reconnect policy, and exposes the
//! status/query surface used by the API layer and the operator console.

use super::backoff::ReconnectPolicy;
use super::record::{ConnectionRecord, Link, QrCallback};
use super::scheduler::{ReconnectDue, ReconnectScheduler};
use crate::mirror;
use chatmux_core::{
    CloseCause, ConnectionCounts, ConnectionStatus, CredentialStore, EventSink, ProtocolTransport,
    SessionError, SessionResult, SessionSummary, StatusChange, StatusMirror, StatusSnapshot,
    TransportEvent, TransportHandle,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

/// Capacity of the status-change broadcast used by login waiters.
const CHANGE_BUFFER: usize = 256;

/// Default time `close` waits for the transport to end gracefully.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Tunables for a [`ConnectionManager`].
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub policy: ReconnectPolicy,
    pub close_grace: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

/// Result of [`ConnectionManager::start`].
pub enum StartOutcome {
    /// The session was already connected; no transport was opened.
    Existing(Arc<dyn TransportHandle>),
    /// A new transport connection was opened.
    Opened(Arc<dyn TransportHandle>),
    /// Another attempt for this session is already underway.
    InFlight,
}

impl StartOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StartOutcome::Existing(_) => "existing",
            StartOutcome::Opened(_) => "opened",
            StartOutcome::InFlight => "inFlight",
        }
    }
}

impl fmt::Debug for StartOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StartOutcome").field(&self.label()).finish()
    }
}

/// How a close event was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    /// Network-level loss; worth retrying.
    Transient,
    /// Credentials revoked; never retried.
    Permanent,
}

impl Disconnect {
    fn as_str(&self) -> &'static str {
        match self {
            Disconnect::Transient => "transient",
            Disconnect::Permanent => "permanent",
        }
    }
}

/// What to do after a close event or a failed background open.
enum AfterFailure {
    Retry { attempt: u32, delay: Duration },
    Remove { attempts: u32 },
}

/// Point-in-time liveness view of one record, read by the sweeper.
#[derive(Debug, Clone)]
pub struct LivenessProbe {
    pub session_id: String,
    pub epoch: u64,
    pub status: ConnectionStatus,
    pub age: Duration,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
}

type Registry = HashMap<String, ConnectionRecord>;

/// Owns the registry of connection records.
pub struct ConnectionManager {
    registry: RwLock<Registry>,
    transport: Arc<dyn ProtocolTransport>,
    credentials: Arc<dyn CredentialStore>,
    mirror_tx: mpsc::UnboundedSender<StatusChange>,
    changes: broadcast::Sender<StatusChange>,
    scheduler: ReconnectScheduler,
    policy: ReconnectPolicy,
    close_grace: Duration,
    next_epoch: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager and spawn its mirror worker and reconnect driver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn ProtocolTransport>,
        credentials: Arc<dyn CredentialStore>,
        status_mirror: Arc<dyn StatusMirror>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        let (scheduler, due_rx) = ReconnectScheduler::channel();
        let mirror_tx = mirror::spawn_worker(status_mirror);
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);

        let manager = Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            transport,
            credentials,
            mirror_tx,
            changes,
            scheduler,
            policy: options.policy,
            close_grace: options.close_grace,
            next_epoch: AtomicU64::new(0),
        });

        tokio::spawn(drive_reconnects(Arc::downgrade(&manager), due_rx));
        manager
    }

    /// Start (or join) a session's connection.
    ///
    /// A connected session returns its existing handle and an in-flight one is
    /// left alone; otherwise a transport is opened. A record waiting out a
    /// reconnect backoff is reopened immediately and keeps its retry counter.
    pub async fn start(
        self: &Arc<Self>,
        session_id: &str,
        on_qr: Option<QrCallback>,
    ) -> SessionResult<StartOutcome> {
        if session_id.is_empty() {
            return Err(SessionError::InvalidSessionId(session_id.to_string()));
        }

        let epoch = {
            let mut registry = self.registry.write().await;
            let epoch = match registry.get_mut(session_id) {
                Some(record) => {
                    if record.status == ConnectionStatus::Connected {
                        if let Some(handle) = record.handle() {
                            debug!(session_id, "session already connected");
                            return Ok(StartOutcome::Existing(handle));
                        }
                    }
                    if on_qr.is_some() {
                        record.on_qr = on_qr;
                    }
                    if record.is_in_flight() {
                        debug!(session_id, status = %record.status, "start already in flight");
                        return Ok(StartOutcome::InFlight);
                    }
                    let epoch = self.bump_epoch();
                    record.begin_attempt(epoch);
                    epoch
                }
                None => {
                    let epoch = self.bump_epoch();
                    registry.insert(
                        session_id.to_string(),
                        ConnectionRecord::new(session_id, epoch, self.policy.max_attempts, on_qr),
                    );
                    epoch
                }
            };
            self.scheduler.cancel(session_id);
            self.notify(session_id, ConnectionStatus::Connecting);
            epoch
        };
        info!(session_id, epoch, "starting session");

        match self.open_attempt(session_id, epoch).await {
            Ok(handle) => Ok(StartOutcome::Opened(handle)),
            Err(e) => {
                let _ = self
                    .remove_if_epoch(session_id, epoch, ConnectionStatus::Error)
                    .await;
                warn!(session_id, error = %e, "session start failed");
                Err(e)
            }
        }
    }

    /// Current status of a session. Unknown sessions report `disconnected`.
    pub async fn status(&self, session_id: &str) -> StatusSnapshot {
        let registry = self.registry.read().await;
        registry
            .get(session_id)
            .map(ConnectionRecord::snapshot)
            .unwrap_or_else(StatusSnapshot::unknown)
    }

    /// Send through a connected session. Does not retry.
    pub async fn send(
        &self,
        session_id: &str,
        payload: serde_json::Value,
    ) -> SessionResult<serde_json::Value> {
        let handle = {
            let registry = self.registry.read().await;
            let status = registry
                .get(session_id)
                .map(|r| r.status)
                .unwrap_or(ConnectionStatus::Disconnected);
            let handle = registry
                .get(session_id)
                .filter(|r| r.status == ConnectionStatus::Connected)
                .and_then(ConnectionRecord::handle);
            handle.ok_or_else(|| SessionError::NotReady {
                session_id: session_id.to_string(),
                status,
            })?
        };
        handle.send(payload).await
    }

    /// Gracefully end the session's transport and remove its record.
    ///
    /// Returns `false` if there was no record.
    pub async fn close(&self, session_id: &str) -> bool {
        let Some(record) = self.take(session_id).await else {
            return false;
        };
        if let Some(handle) = record.handle() {
            match tokio::time::timeout(self.close_grace, handle.end()).await {
                Ok(Ok(())) => debug!(session_id, "transport ended"),
                Ok(Err(e)) => debug!(session_id, error = %e, "transport already gone"),
                Err(_) => warn!(
                    session_id,
                    grace_ms = self.close_grace.as_millis() as u64,
                    "transport did not end within grace period"
                ),
            }
        }
        info!(session_id, "session closed");
        true
    }

    /// Unconditionally end the transport and remove the record.
    ///
    /// Returns `false` if there was no record.
    pub async fn force_cleanup(&self, session_id: &str) -> bool {
        let Some(record) = self.take(session_id).await else {
            debug!(session_id, "force cleanup: no such session");
            return false;
        };
        self.finish_removed(record).await;
        info!(session_id, "session force-cleaned");
        true
    }

    /// Force-clean only if the record still belongs to connection attempt `epoch`.
    pub async fn force_cleanup_if(&self, session_id: &str, epoch: u64) -> bool {
        let Some(record) = self
            .remove_if_epoch(session_id, epoch, ConnectionStatus::Disconnected)
            .await
        else {
            return false;
        };
        self.finish_removed(record).await;
        true
    }

    /// Force-close every session. Returns how many were closed.
    pub async fn force_close_all(&self) -> usize {
        let records: Vec<ConnectionRecord> = {
            let mut registry = self.registry.write().await;
            self.scheduler.cancel_all();
            registry
                .drain()
                .map(|(_, r)| {
                    self.notify(&r.session_id, ConnectionStatus::Disconnected);
                    r
                })
                .collect()
        };

        let count = records.len();
        futures_util::future::join_all(records.into_iter().map(|r| self.finish_removed(r))).await;
        info!(count, "force closed all sessions");
        count
    }

    /// Zero the retry counter without touching connection state.
    pub async fn reset_reconnect_attempts(&self, session_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        match registry.get_mut(session_id) {
            Some(record) => {
                record.reconnect_attempts = 0;
                info!(session_id, "reconnect attempts reset");
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of every record's public shape, ordered by id.
    pub async fn list_active(&self) -> Vec<SessionSummary> {
        let registry = self.registry.read().await;
        let mut list: Vec<SessionSummary> = registry.values().map(ConnectionRecord::summary).collect();
        list.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        list
    }

    pub async fn counts(&self) -> ConnectionCounts {
        let registry = self.registry.read().await;
        let mut counts = ConnectionCounts {
            total: registry.len(),
            ..Default::default()
        };
        for record in registry.values() {
            match record.status {
                ConnectionStatus::Connected => counts.connected += 1,
                ConnectionStatus::Connecting => counts.connecting += 1,
                ConnectionStatus::QrReady => counts.qr_ready += 1,
                _ => {}
            }
        }
        counts
    }

    /// Close the session and clear its stored credentials so the next start
    /// performs a fresh login.
    pub async fn restart(&self, session_id: &str) -> SessionResult<()> {
        self.close(session_id).await;
        self.credentials.clear(session_id).await?;
        info!(session_id, "session restarted, credentials cleared");
        Ok(())
    }

    /// Close the session and remove everything stored for it.
    pub async fn delete(&self, session_id: &str) -> SessionResult<()> {
        self.close(session_id).await;
        self.credentials.remove(session_id).await?;
        info!(session_id, "session deleted");
        Ok(())
    }

    /// Stream of committed status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes.subscribe()
    }

    /// Number of reconnect timers that have not fired yet.
    pub fn pending_reconnects(&self) -> usize {
        self.scheduler.pending()
    }

    pub async fn liveness(&self) -> Vec<LivenessProbe> {
        let registry = self.registry.read().await;
        registry
            .values()
            .map(|r| LivenessProbe {
                session_id: r.session_id.clone(),
                epoch: r.epoch,
                status: r.status,
                age: r.age(),
                reconnect_attempts: r.reconnect_attempts,
                max_reconnect_attempts: r.max_reconnect_attempts,
            })
            .collect()
    }

    // ── internals ──────────────────────────────────────────────────────

    fn bump_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Emit a committed transition to the status mirror and to subscribers.
    ///
    /// Called with the registry write lock held so that emission order is
    /// commit order.
    fn notify(&self, session_id: &str, status: ConnectionStatus) {
        let change = StatusChange::new(session_id, status);
        if self.mirror_tx.send(change.clone()).is_err() {
            debug!(session_id, "status mirror worker gone");
        }
        let _ = self.changes.send(change);
    }

    async fn take(&self, session_id: &str) -> Option<ConnectionRecord> {
        let mut registry = self.registry.write().await;
        let record = registry.remove(session_id)?;
        self.scheduler.cancel(session_id);
        self.notify(session_id, ConnectionStatus::Disconnected);
        Some(record)
    }

    /// Remove the record only if it still belongs to attempt `epoch`, reporting
    /// `final_status` for it.
    async fn remove_if_epoch(
        &self,
        session_id: &str,
        epoch: u64,
        final_status: ConnectionStatus,
    ) -> Option<ConnectionRecord> {
        let mut registry = self.registry.write().await;
        current(&mut registry, session_id, epoch)?;
        let record = registry.remove(session_id)?;
        self.scheduler.cancel(session_id);
        self.notify(session_id, final_status);
        Some(record)
    }

    /// End a removed record's transport.
    async fn finish_removed(&self, record: ConnectionRecord) {
        if let Some(handle) = record.handle() {
            if let Err(e) = handle.end().await {
                warn!(session_id = %record.session_id, error = %e, "error ending transport");
            }
        }
    }

    /// Load credentials, open the transport, install the handle and start
    /// pumping its events. The lock is never held across the open.
    async fn open_attempt(
        self: &Arc<Self>,
        session_id: &str,
        epoch: u64,
    ) -> SessionResult<Arc<dyn TransportHandle>> {
        let credentials = self
            .credentials
            .load_or_init(session_id)
            .await
            .map_err(|e| SessionError::TransportInit(format!("loading credentials: {e}")))?;
        let fresh = credentials.is_fresh();

        let (sink, events) = EventSink::channel();
        let handle = self
            .transport
            .open(session_id, credentials, sink)
            .await
            .map_err(|e| match e {
                SessionError::TransportInit(_) => e,
                other => SessionError::TransportInit(other.to_string()),
            })?;

        let installed = {
            let mut registry = self.registry.write().await;
            match registry.get_mut(session_id) {
                Some(record) if record.epoch == epoch => {
                    record.link = Link::Live(handle.clone());
                    true
                }
                _ => false,
            }
        };
        if !installed {
            debug!(session_id, epoch, "connection attempt superseded, ending transport");
            if let Err(e) = handle.end().await {
                debug!(session_id, error = %e, "error ending superseded transport");
            }
            return Err(SessionError::Superseded(session_id.to_string()));
        }

        debug!(session_id, epoch, fresh_login = fresh, "transport opened");
        tokio::spawn(pump_events(
            Arc::downgrade(self),
            session_id.to_string(),
            epoch,
            events,
        ));
        Ok(handle)
    }

    /// Apply one transport event. Returns `false` when this attempt's event
    /// stream should stop being read.
    async fn apply_event(&self, session_id: &str, epoch: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Qr(code) => {
                let callback = {
                    let mut registry = self.registry.write().await;
                    let Some(record) = current(&mut registry, session_id, epoch) else {
                        return false;
                    };
                    record.mark_qr(code.clone());
                    self.notify(session_id, ConnectionStatus::QrReady);
                    record.on_qr.clone()
                };
                info!(session_id, "login code ready");
                if let Some(callback) = callback {
                    callback(&code);
                }
                true
            }
            TransportEvent::Connecting => {
                {
                    let mut registry = self.registry.write().await;
                    let Some(record) = current(&mut registry, session_id, epoch) else {
                        return false;
                    };
                    if record.status == ConnectionStatus::Connecting {
                        return true;
                    }
                    record.mark_connecting();
                    self.notify(session_id, ConnectionStatus::Connecting);
                }
                debug!(session_id, "transport re-handshaking");
                true
            }
            TransportEvent::Open(account) => {
                {
                    let mut registry = self.registry.write().await;
                    let Some(record) = current(&mut registry, session_id, epoch) else {
                        return false;
                    };
                    record.mark_connected(account.clone());
                    self.notify(session_id, ConnectionStatus::Connected);
                }
                info!(session_id, jid = ?account.jid, "session connected");
                true
            }
            TransportEvent::CredentialsUpdated(material) => {
                let live = {
                    let registry = self.registry.read().await;
                    registry.get(session_id).is_some_and(|r| r.epoch == epoch)
                };
                if !live {
                    return false;
                }
                match self.credentials.save(session_id, &material).await {
                    Ok(()) => debug!(session_id, "credentials saved"),
                    Err(e) => warn!(session_id, error = %e, "failed to save credentials"),
                }
                true
            }
            TransportEvent::Close(cause) => {
                self.handle_close(session_id, epoch, cause).await;
                false
            }
        }
    }

    async fn handle_close(&self, session_id: &str, epoch: u64, cause: CloseCause) {
        let kind = if self.transport.is_permanent_cause(&cause) {
            Disconnect::Permanent
        } else {
            Disconnect::Transient
        };

        let next = {
            let mut registry = self.registry.write().await;
            let Some(record) = current(&mut registry, session_id, epoch) else {
                debug!(session_id, epoch, "close for superseded attempt ignored");
                return;
            };
            let next = match kind {
                Disconnect::Permanent => AfterFailure::Remove {
                    attempts: record.reconnect_attempts,
                },
                Disconnect::Transient => self.plan_retry(record, ConnectionStatus::Connecting),
            };
            self.commit_failure(&mut registry, session_id, epoch, &next, ConnectionStatus::Connecting);
            next
        };

        match next {
            AfterFailure::Retry { attempt, delay } => {
                info!(
                    session_id,
                    disconnect = kind.as_str(),
                    code = ?cause.code,
                    reason = %cause.reason,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "connection closed, reconnecting"
                );
            }
            AfterFailure::Remove { attempts } => {
                if kind == Disconnect::Permanent {
                    info!(session_id, code = ?cause.code, reason = %cause.reason, "session logged out, not reconnecting");
                } else {
                    warn!(session_id, attempts, reason = %cause.reason, "reconnect attempts exhausted, removing session");
                }
            }
        }
    }

    /// Apply a retry decision to the registry: arm the reconnect timer or drop
    /// the record, then report the resulting status.
    fn commit_failure(
        &self,
        registry: &mut Registry,
        session_id: &str,
        epoch: u64,
        next: &AfterFailure,
        retry_status: ConnectionStatus,
    ) {
        match next {
            AfterFailure::Retry { delay, .. } => {
                self.scheduler.schedule(session_id, epoch, *delay);
                self.notify(session_id, retry_status);
            }
            AfterFailure::Remove { .. } => {
                registry.remove(session_id);
                self.scheduler.cancel(session_id);
                self.notify(session_id, ConnectionStatus::Disconnected);
            }
        }
    }

    /// Consume one retry if the policy allows it, moving the record into backoff.
    fn plan_retry(&self, record: &mut ConnectionRecord, status: ConnectionStatus) -> AfterFailure {
        if self.policy.allows_retry(record.reconnect_attempts) {
            record.reconnect_attempts += 1;
            record.enter_backoff(status);
            let attempt = record.reconnect_attempts;
            AfterFailure::Retry {
                attempt,
                delay: self.policy.delay_for(attempt),
            }
        } else {
            AfterFailure::Remove {
                attempts: record.reconnect_attempts,
            }
        }
    }

    /// Run a reconnect whose backoff elapsed. Skips records that were removed
    /// or restarted since the reconnect was scheduled.
    async fn reconnect(self: Arc<Self>, due: ReconnectDue) {
        let ReconnectDue { session_id, epoch } = due;
        let (new_epoch, was_error) = {
            let mut registry = self.registry.write().await;
            match current(&mut registry, &session_id, epoch) {
                Some(record) if matches!(record.link, Link::Backoff) => {
                    let was_error = record.status == ConnectionStatus::Error;
                    let new_epoch = self.bump_epoch();
                    record.begin_attempt(new_epoch);
                    if was_error {
                        self.notify(&session_id, ConnectionStatus::Connecting);
                    }
                    (new_epoch, was_error)
                }
                _ => {
                    debug!(session_id = %session_id, epoch, "reconnect skipped, session gone or restarted");
                    return;
                }
            }
        };

        info!(session_id = %session_id, epoch = new_epoch, after_error = was_error, "reconnecting session");

        match self.open_attempt(&session_id, new_epoch).await {
            Ok(_) => {}
            Err(SessionError::Superseded(_)) => {}
            Err(e) => self.handle_open_failure(&session_id, new_epoch, e).await,
        }
    }

    /// A background open failed: park the record in `error` and retry, or
    /// drop it once the ceiling is reached. Never surfaced to callers.
    async fn handle_open_failure(&self, session_id: &str, epoch: u64, error: SessionError) {
        let next = {
            let mut registry = self.registry.write().await;
            let Some(record) = current(&mut registry, session_id, epoch) else {
                return;
            };
            let next = self.plan_retry(record, ConnectionStatus::Error);
            self.commit_failure(&mut registry, session_id, epoch, &next, ConnectionStatus::Error);
            next
        };

        match next {
            AfterFailure::Retry { attempt, delay } => {
                warn!(
                    session_id,
                    error = %error,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect failed, retrying"
                );
            }
            AfterFailure::Remove { attempts } => {
                warn!(session_id, error = %error, attempts, "reconnect failed, attempts exhausted");
            }
        }
    }
}

/// The record for `session_id` if it still belongs to attempt `epoch`.
fn current<'a>(
    registry: &'a mut Registry,
    session_id: &str,
    epoch: u64,
) -> Option<&'a mut ConnectionRecord> {
    registry.get_mut(session_id).filter(|r| r.epoch == epoch)
}

/// Read one connection attempt's events in order and apply them.
async fn pump_events(
    manager: Weak<ConnectionManager>,
    session_id: String,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if !manager.apply_event(&session_id, epoch, event).await {
            break;
        }
    }
    debug!(session_id = %session_id, epoch, "event pump finished");
}

/// Turn due reconnects into reconnect tasks for as long as the manager lives.
async fn drive_reconnects(
    manager: Weak<ConnectionManager>,
    mut due_rx: mpsc::UnboundedReceiver<ReconnectDue>,
) {
    while let Some(due) = due_rx.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        tokio::spawn(manager.reconnect(due));
    }
}
