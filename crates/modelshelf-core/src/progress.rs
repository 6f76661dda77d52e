//! Last-known progress per operation, with live fan-out.
//!
//! Pollers call [`ProgressBroadcaster::latest`]; subscribers receive every
//! published snapshot over a tokio broadcast channel. Both see the same
//! snapshot values. Terminal snapshots stay readable for a grace period so a
//! poller that missed the final event still observes it.

use crate::config::ProgressConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// What kind of work an operation id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Scan,
    Reconcile,
    Refresh,
    Organize,
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Queued,
    Started,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressStatus::Completed | ProgressStatus::Failed | ProgressStatus::Cancelled
        )
    }
}

/// Point-in-time progress of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub kind: OperationKind,
    pub status: ProgressStatus,
    /// Items (files, records) handled so far.
    pub processed: u64,
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_done: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: String,
}

impl ProgressSnapshot {
    pub fn new(kind: OperationKind, status: ProgressStatus) -> Self {
        Self {
            kind,
            status,
            processed: 0,
            total: None,
            bytes_done: None,
            bytes_total: None,
            message: None,
            updated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn with_counts(mut self, processed: u64, total: impl Into<Option<u64>>) -> Self {
        self.processed = processed;
        self.total = total.into();
        self
    }

    pub fn with_bytes(mut self, done: u64, total: Option<u64>) -> Self {
        self.bytes_done = Some(done);
        self.bytes_total = total;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A published snapshot tagged with its operation id.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub op_id: String,
    pub snapshot: ProgressSnapshot,
}

struct Entry {
    snapshot: ProgressSnapshot,
    terminal_since: Option<Instant>,
}

pub struct ProgressBroadcaster {
    entries: RwLock<HashMap<String, Entry>>,
    sender: broadcast::Sender<ProgressEvent>,
    grace: Duration,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(ProgressConfig::TERMINAL_GRACE)
    }
}

impl ProgressBroadcaster {
    pub fn new(grace: Duration) -> Self {
        let (sender, _) = broadcast::channel(ProgressConfig::CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            sender,
            grace,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Record `snapshot` as the latest for `op_id` and fan it out.
    pub fn publish(&self, op_id: impl Into<String>, snapshot: ProgressSnapshot) {
        let op_id = op_id.into();
        self.purge_expired();
        {
            let mut entries = self.write();
            let terminal_since = snapshot.status.is_terminal().then(Instant::now);
            entries.insert(
                op_id.clone(),
                Entry {
                    snapshot: snapshot.clone(),
                    terminal_since,
                },
            );
        }
        // No receivers is fine: pollers still read `latest`.
        let _ = self.sender.send(ProgressEvent { op_id, snapshot });
    }

    /// Latest snapshot for `op_id`; `None` when unknown or expired.
    pub fn latest(&self, op_id: &str) -> Option<ProgressSnapshot> {
        self.purge_expired();
        self.read().get(op_id).map(|entry| entry.snapshot.clone())
    }

    /// Every live operation id with its latest snapshot.
    pub fn all(&self) -> Vec<ProgressEvent> {
        self.purge_expired();
        let mut events: Vec<ProgressEvent> = self
            .read()
            .iter()
            .map(|(op_id, entry)| ProgressEvent {
                op_id: op_id.clone(),
                snapshot: entry.snapshot.clone(),
            })
            .collect();
        events.sort_by(|a, b| a.op_id.cmp(&b.op_id));
        events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Drop terminal snapshots older than the grace period.
    pub fn purge_expired(&self) -> usize {
        let grace = self.grace;
        let expired = |entry: &Entry| {
            entry
                .terminal_since
                .map(|since| since.elapsed() >= grace)
                .unwrap_or(false)
        };

        if !self.read().values().any(expired) {
            return 0;
        }
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| !expired(entry));
        let purged = before - entries.len();
        if purged > 0 {
            debug!("Purged {} expired progress snapshots", purged);
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: ProgressStatus) -> ProgressSnapshot {
        ProgressSnapshot::new(OperationKind::Scan, status).with_counts(1, 2)
    }

    #[test]
    fn test_latest_unknown_is_none() {
        let hub = ProgressBroadcaster::default();
        assert!(hub.latest("missing").is_none());
    }

    #[tokio::test]
    async fn test_poller_and_subscriber_agree() {
        let hub = ProgressBroadcaster::default();
        let mut rx = hub.subscribe();

        hub.publish("scan:main", snapshot(ProgressStatus::Processing));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.op_id, "scan:main");
        assert_eq!(Some(event.snapshot), hub.latest("scan:main"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_snapshot_expires_after_grace() {
        let hub = ProgressBroadcaster::new(Duration::from_secs(5));
        hub.publish("op", snapshot(ProgressStatus::Completed));
        hub.publish("running", snapshot(ProgressStatus::Processing));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(hub.latest("op").is_some());

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(hub.latest("op").is_none());
        assert!(hub.latest("running").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_republish_after_terminal_restarts_grace() {
        let hub = ProgressBroadcaster::new(Duration::from_secs(5));
        hub.publish("op", snapshot(ProgressStatus::Failed));
        tokio::time::advance(Duration::from_secs(4)).await;
        hub.publish("op", snapshot(ProgressStatus::Started));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(hub.latest("op").unwrap().status, ProgressStatus::Started);
    }
}
