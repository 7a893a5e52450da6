//! Periodic reclamation of stuck connection records.

use super::manager::{ConnectionManager, LivenessProbe};
use chatmux_core::{ConnectionStatus, SessionError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CONNECTING_STALL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_QR_FRESHNESS: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPolicy {
    pub interval: Duration,
    /// A `connecting` record older than this is considered stalled.
    pub connecting_stall: Duration,
    /// A login code older than this is considered abandoned.
    pub qr_freshness: Duration,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            connecting_stall: DEFAULT_CONNECTING_STALL,
            qr_freshness: DEFAULT_QR_FRESHNESS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EvictionReason {
    StalledConnecting,
    RetriesExhausted,
    AbandonedQr,
}

impl EvictionReason {
    pub fn describe(&self) -> &'static str {
        match self {
            EvictionReason::StalledConnecting => "stuck in connecting",
            EvictionReason::RetriesExhausted => "reconnect attempts exhausted",
            EvictionReason::AbandonedQr => "login code never scanned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Eviction {
    pub session_id: String,
    pub reason: EvictionReason,
    pub age_secs: u64,
}

impl SweepPolicy {
    /// Why a record should be evicted, if at all.
    pub fn verdict(&self, probe: &LivenessProbe) -> Option<EvictionReason> {
        match probe.status {
            ConnectionStatus::Connected => None,
            ConnectionStatus::Connecting if probe.age > self.connecting_stall => {
                Some(EvictionReason::StalledConnecting)
            }
            ConnectionStatus::QrReady if probe.age > self.qr_freshness => {
                Some(EvictionReason::AbandonedQr)
            }
            _ if probe.reconnect_attempts >= probe.max_reconnect_attempts => {
                Some(EvictionReason::RetriesExhausted)
            }
            _ => None,
        }
    }
}

impl ConnectionManager {
    /// Run one reclamation pass and return what was evicted.
    ///
    /// Decisions are made on a snapshot; a record restarted after the snapshot
    /// was taken carries a new epoch and is left alone.
    pub async fn sweep(&self, policy: &SweepPolicy) -> Vec<Eviction> {
        let mut evicted = Vec::new();
        for probe in self.liveness().await {
            let Some(reason) = policy.verdict(&probe) else {
                continue;
            };
            if !self.force_cleanup_if(&probe.session_id, probe.epoch).await {
                debug!(session_id = %probe.session_id, "record changed since snapshot, skipped");
                continue;
            }
            let stale = SessionError::Stale {
                session_id: probe.session_id.clone(),
                reason: reason.describe().to_string(),
            };
            warn!(error = %stale, age_secs = probe.age.as_secs(), "evicted stale session");
            evicted.push(Eviction {
                session_id: probe.session_id,
                reason,
                age_secs: probe.age.as_secs(),
            });
        }
        evicted
    }
}

/// Background task running [`ConnectionManager::sweep`] on a fixed interval.
pub struct Sweeper {
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the loop. The first pass runs one interval after spawning.
    pub fn spawn(manager: Arc<ConnectionManager>, policy: SweepPolicy) -> Self {
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + policy.interval;
            let mut ticker = tokio::time::interval_at(start, policy.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = manager.sweep(&policy).await;
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "sweep evicted sessions");
                }
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::mirror::RecordingMirror;
    use crate::session::manager::ManagerOptions;
    use crate::transport::mock::MockTransport;
    use chatmux_core::{AccountInfo, CloseCause, TransportEvent};

    fn setup() -> (Arc<ConnectionManager>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(
            transport.clone(),
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(RecordingMirror::new()),
            ManagerOptions::default(),
        );
        (manager, transport)
    }

    fn probe(status: ConnectionStatus, age_secs: u64, attempts: u32) -> LivenessProbe {
        LivenessProbe {
            session_id: "s".into(),
            epoch: 1,
            status,
            age: Duration::from_secs(age_secs),
            reconnect_attempts: attempts,
            max_reconnect_attempts: 3,
        }
    }

    #[test]
    fn verdicts() {
        let p = SweepPolicy::default();
        assert_eq!(p.verdict(&probe(ConnectionStatus::Connecting, 60, 0)), None);
        assert_eq!(
            p.verdict(&probe(ConnectionStatus::Connecting, 601, 0)),
            Some(EvictionReason::StalledConnecting)
        );
        assert_eq!(p.verdict(&probe(ConnectionStatus::QrReady, 299, 0)), None);
        assert_eq!(
            p.verdict(&probe(ConnectionStatus::QrReady, 301, 0)),
            Some(EvictionReason::AbandonedQr)
        );
        assert_eq!(
            p.verdict(&probe(ConnectionStatus::Error, 5, 3)),
            Some(EvictionReason::RetriesExhausted)
        );
        assert_eq!(p.verdict(&probe(ConnectionStatus::Connected, 10_000, 0)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_connecting_is_evicted() {
        let (manager, transport) = setup();
        manager.start("S3", None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(11 * 60)).await;
        let evicted = manager.sweep(&SweepPolicy::default()).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].session_id, "S3");
        assert_eq!(evicted[0].reason, EvictionReason::StalledConnecting);
        assert!(transport.latest("S3").unwrap().is_ended());
        assert!(manager.list_active().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn long_lived_session_in_backoff_is_not_stalled() {
        let (manager, transport) = setup();
        manager.start("S1", None).await.unwrap();
        transport.emit("S1", TransportEvent::Open(AccountInfo::default()));
        tokio::time::sleep(Duration::from_secs(3600)).await;

        transport.emit("S1", TransportEvent::Close(CloseCause::connection_lost("blip")));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let summary = &manager.list_active().await[0];
        assert_eq!(summary.status, ConnectionStatus::Connecting);
        assert_eq!(summary.reconnect_attempts, 1);

        assert!(manager.sweep(&SweepPolicy::default()).await.is_empty());
        assert_eq!(manager.list_active().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rehandshake_of_long_lived_session_is_not_stalled() {
        let (manager, transport) = setup();
        manager.start("S1", None).await.unwrap();
        transport.emit("S1", TransportEvent::Open(AccountInfo::default()));
        tokio::time::sleep(Duration::from_secs(3600)).await;

        transport.emit("S1", TransportEvent::Connecting);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.status("S1").await.status, ConnectionStatus::Connecting);
        assert!(manager.sweep(&SweepPolicy::default()).await.is_empty());

        // A handshake that really hangs is still reclaimed.
        tokio::time::sleep(Duration::from_secs(11 * 60)).await;
        let evicted = manager.sweep(&SweepPolicy::default()).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].reason, EvictionReason::StalledConnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_and_connected_records_survive() {
        let (manager, transport) = setup();
        manager.start("live", None).await.unwrap();
        transport.emit("live", TransportEvent::Open(AccountInfo::default()));
        manager.start("fresh", None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(manager.sweep(&SweepPolicy::default()).await.is_empty());
        assert_eq!(manager.list_active().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_qr_is_evicted() {
        let (manager, transport) = setup();
        manager.start("S1", None).await.unwrap();
        transport.emit("S1", TransportEvent::Qr("code".into()));
        tokio::time::sleep(Duration::from_secs(6 * 60)).await;

        let evicted = manager.sweep(&SweepPolicy::default()).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].reason, EvictionReason::AbandonedQr);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_is_evicted() {
        let (manager, transport) = setup();
        manager.start("S1", None).await.unwrap();
        transport.emit("S1", TransportEvent::Open(AccountInfo::default()));
        // Three transient closes, each reopened after its backoff.
        for _ in 0..3 {
            transport.emit("S1", TransportEvent::Close(CloseCause::connection_lost("blip")));
            tokio::time::sleep(Duration::from_secs(1)).await;
            manager.start("S1", None).await.unwrap();
        }
        assert_eq!(manager.list_active().await[0].reconnect_attempts, 3);

        let evicted = manager.sweep(&SweepPolicy::default()).await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].reason, EvictionReason::RetriesExhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_record_is_not_evicted_by_old_snapshot() {
        let (manager, _transport) = setup();
        manager.start("S1", None).await.unwrap();
        let old = manager.liveness().await.remove(0);

        manager.force_cleanup("S1").await;
        manager.start("S1", None).await.unwrap();
        assert!(!manager.force_cleanup_if("S1", old.epoch).await);
        assert_eq!(manager.list_active().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_runs_on_interval() {
        let (manager, _transport) = setup();
        manager.start("S3", None).await.unwrap();
        let sweeper = Sweeper::spawn(manager.clone(), SweepPolicy::default());

        // First pass at 5 min: not yet stalled.
        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        assert_eq!(manager.list_active().await.len(), 1);

        // Second pass at 10 min: still within the stall window.
        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(manager.list_active().await.len(), 1);

        // Third pass at 15 min evicts.
        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert!(manager.list_active().await.is_empty());
        sweeper.stop();
    }
}
