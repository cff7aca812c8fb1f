//! Sync progress snapshots and the publish/subscribe hub that delivers them.
//!
//! Observers receive the latest snapshot on subscribe and every snapshot
//! after it until they unsubscribe. Nothing older than the latest snapshot is
//! kept.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::warn;

use crate::models::RecordType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Syncing,
    Complete,
    Error,
    Paused,
}

impl RunStatus {
    /// A run is active while syncing or paused.
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Syncing | RunStatus::Paused)
    }
}

/// A record that failed permanently during the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncErrorEntry {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub local_id: String,
    pub message: String,
}

/// Point-in-time view of a sync run. Each emission replaces the previous one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub status: RunStatus,
    pub current_step: String,
    pub completed_items: usize,
    pub failed_items: usize,
    pub errors: Vec<SyncErrorEntry>,
    /// Reason a run ended in `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncProgress {
    /// Fresh snapshot for a run starting now.
    pub fn started(now: DateTime<Utc>) -> Self {
        Self {
            status: RunStatus::Syncing,
            current_step: "Starting sync".to_string(),
            started_at: Some(now),
            ..Self::default()
        }
    }
}

type Observer = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

struct HubInner {
    observers: Mutex<BTreeMap<u64, Observer>>,
    next_id: AtomicU64,
    latest: watch::Sender<SyncProgress>,
}

/// Publish/subscribe channel for [`SyncProgress`], owned by the sync manager.
#[derive(Clone)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(SyncProgress::default());
        Self {
            inner: Arc::new(HubInner {
                observers: Mutex::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                latest,
            }),
        }
    }

    pub fn latest(&self) -> SyncProgress {
        self.inner.latest.borrow().clone()
    }

    /// Register an observer. It is called immediately with the latest
    /// snapshot, then on every publish until the returned handle is
    /// unsubscribed or dropped.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let observer: Observer = Arc::new(observer);
        match self.inner.observers.lock() {
            Ok(mut observers) => {
                observers.insert(id, observer.clone());
            }
            Err(e) => warn!("progress observers lock poisoned: {e}"),
        }
        observer(&self.latest());
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Async alternative to [`subscribe`](Self::subscribe): a receiver that
    /// always holds the latest snapshot.
    pub fn watch(&self) -> watch::Receiver<SyncProgress> {
        self.inner.latest.subscribe()
    }

    pub fn publish(&self, progress: SyncProgress) {
        self.inner.latest.send_replace(progress.clone());
        // Call outside the lock so observers may subscribe or unsubscribe.
        let observers: Vec<Observer> = match self.inner.observers.lock() {
            Ok(observers) => observers.values().cloned().collect(),
            Err(e) => {
                warn!("progress observers lock poisoned: {e}");
                return;
            }
        };
        for observer in observers {
            observer(&progress);
        }
    }

    /// Edit the latest snapshot in place and publish it when `update`
    /// reports a change. The check and the edit are atomic with respect to
    /// [`publish`](Self::publish). Returns whether anything was published.
    pub fn update_if<F>(&self, update: F) -> bool
    where
        F: FnOnce(&mut SyncProgress) -> bool,
    {
        if !self.inner.latest.send_if_modified(update) {
            return false;
        }
        let progress = self.latest();
        let observers: Vec<Observer> = match self.inner.observers.lock() {
            Ok(observers) => observers.values().cloned().collect(),
            Err(e) => {
                warn!("progress observers lock poisoned: {e}");
                return true;
            }
        };
        for observer in observers {
            observer(&progress);
        }
        true
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .observers
            .lock()
            .map(|observers| observers.len())
            .unwrap_or(0)
    }
}

/// Handle returned by [`ProgressHub::subscribe`]. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            if let Ok(mut observers) = hub.observers.lock() {
                observers.remove(&self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<SyncProgress>>>, impl Fn(&SyncProgress) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |p: &SyncProgress| {
            sink.lock().unwrap().push(p.clone());
        })
    }

    fn step(text: &str) -> SyncProgress {
        SyncProgress {
            status: RunStatus::Syncing,
            current_step: text.to_string(),
            ..SyncProgress::default()
        }
    }

    #[test]
    fn test_subscriber_receives_latest_immediately() {
        let hub = ProgressHub::new();
        hub.publish(step("Pushing sales 1/2"));
        hub.publish(step("Pushing sales 2/2"));

        let (seen, observer) = recorder();
        let _sub = hub.subscribe(observer);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1, "late subscribers miss history");
        assert_eq!(seen[0].current_step, "Pushing sales 2/2");
    }

    #[test]
    fn test_unsubscribe_is_independent() {
        let hub = ProgressHub::new();
        let (first_seen, first) = recorder();
        let (second_seen, second) = recorder();
        let first_sub = hub.subscribe(first);
        let _second_sub = hub.subscribe(second);
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(step("a"));
        first_sub.unsubscribe();
        hub.publish(step("b"));

        assert_eq!(first_seen.lock().unwrap().len(), 2);
        let second_seen = second_seen.lock().unwrap();
        assert_eq!(second_seen.len(), 3);
        assert_eq!(second_seen[2].current_step, "b");
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let hub = ProgressHub::new();
        {
            let (_seen, observer) = recorder();
            let _sub = hub.subscribe(observer);
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_tracks_latest() {
        let hub = ProgressHub::new();
        let mut rx = hub.watch();
        hub.publish(step("x"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().current_step, "x");
    }

    #[test]
    fn test_update_if_only_publishes_changes() {
        let hub = ProgressHub::new();
        hub.publish(step("Pushing sales 1/4"));
        let (seen, observer) = recorder();
        let _sub = hub.subscribe(observer);

        let changed = hub.update_if(|p| {
            if p.status != RunStatus::Syncing {
                return false;
            }
            p.status = RunStatus::Paused;
            true
        });
        assert!(changed);
        assert_eq!(hub.latest().status, RunStatus::Paused);
        assert_eq!(hub.latest().current_step, "Pushing sales 1/4");

        hub.publish(SyncProgress {
            status: RunStatus::Complete,
            ..SyncProgress::default()
        });
        assert!(!hub.update_if(|p| p.status == RunStatus::Syncing));
        assert_eq!(hub.latest().status, RunStatus::Complete);

        let seen = seen.lock().unwrap();
        let statuses: Vec<RunStatus> = seen.iter().map(|p| p.status).collect();
        assert_eq!(
            statuses,
            vec![RunStatus::Syncing, RunStatus::Paused, RunStatus::Complete]
        );
    }

    #[test]
    fn test_error_entry_serializes_type_field() {
        let entry = SyncErrorEntry {
            record_type: RecordType::JobOrder,
            local_id: "loc_1".into(),
            message: "rejected".into(),
        };
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], "job_order");
        assert_eq!(value["localId"], "loc_1");
    }
}
