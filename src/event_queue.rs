//! Time-windowed ledger of change events per watershed.
//!
//! Events are deduplicated by identity key: source, watershed, signal type,
//! and detection time bucketed to `dedupBucketMinutes`. Accepted events are
//! written through to the event store; the in-memory window only holds what
//! is inside `eventWindowHours`. On cold start the queue hydrates from the
//! store exactly once, however many callers ask for it concurrently.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::config::ScoringConfig;
use crate::error::SentinelError;
use crate::huc;
use crate::store::{EventStore, StoredRecord, EVENTS_NAMESPACE};
use crate::types::{ChangeEvent, RecordOutcome};

/// Immutable per-run view of the active window, keyed by HUC-8.
pub type WindowSnapshot = BTreeMap<String, Vec<ChangeEvent>>;

/// Identity key of an event: `source|huc8|signal|bucketStart`.
pub fn dedup_key(event: &ChangeEvent, bucket_minutes: i64) -> String {
    let bucket_secs = bucket_minutes.max(1) * 60;
    let bucket_start = event.detected_at.timestamp().div_euclid(bucket_secs) * bucket_secs;
    format!(
        "{}|{}|{}|{}",
        event.source_id, event.watershed_id, event.signal_type, bucket_start
    )
}

/// Compact, stable store key for a dedup key.
pub fn record_id(dedup_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dedup_key.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("evt-{}", &digest[..24])
}

#[derive(Default)]
struct Window {
    /// Newest first per watershed.
    by_watershed: HashMap<String, Vec<ChangeEvent>>,
    keys: HashSet<String>,
}

impl Window {
    fn insert(&mut self, key: String, event: ChangeEvent) -> bool {
        if !self.keys.insert(key) {
            return false;
        }
        let list = self.by_watershed.entry(event.watershed_id.clone()).or_default();
        let pos = list
            .iter()
            .position(|e| e.detected_at < event.detected_at)
            .unwrap_or(list.len());
        list.insert(pos, event);
        true
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

pub struct EventQueue {
    store: Arc<dyn EventStore>,
    window_hours: f64,
    bucket_minutes: i64,
    window: RwLock<Window>,
    warmed: OnceCell<usize>,
}

impl EventQueue {
    pub fn new(store: Arc<dyn EventStore>, config: &ScoringConfig) -> Self {
        Self {
            store,
            window_hours: config.event_window_hours,
            bucket_minutes: config.dedup_bucket_minutes,
            window: RwLock::new(Window::default()),
            warmed: OnceCell::new(),
        }
    }

    fn in_window(&self, event: &ChangeEvent, now: DateTime<Utc>) -> bool {
        event.age_hours(now) <= self.window_hours
    }

    /// Hydrate the window from the store. Concurrent callers share a single
    /// in-flight load; once it succeeds later calls return immediately. A
    /// failed load leaves the queue cold so the next call retries.
    pub async fn warm(&self) -> Result<usize, SentinelError> {
        self.warmed
            .get_or_try_init(|| self.load_from_store())
            .await
            .copied()
    }

    pub fn is_warm(&self) -> bool {
        self.warmed.initialized()
    }

    async fn load_from_store(&self) -> Result<usize, SentinelError> {
        let records = self.store.get_all(EVENTS_NAMESPACE).await?;
        let now = Utc::now();
        let mut loaded = 0usize;
        let mut skipped = 0usize;

        let mut window = self.window.write();
        for record in &records {
            let event: ChangeEvent = match record.decode() {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("EventQueue: skipping undecodable record {}: {}", record.key, e);
                    skipped += 1;
                    continue;
                }
            };
            if !self.in_window(&event, now) {
                continue;
            }
            let key = dedup_key(&event, self.bucket_minutes);
            if window.insert(key, event) {
                loaded += 1;
            }
        }
        drop(window);

        log::info!(
            "EventQueue: warmed {} active events from {} stored records ({} skipped)",
            loaded,
            records.len(),
            skipped
        );
        Ok(loaded)
    }

    /// Record an event. Re-submitting an identity key already in the window
    /// is a no-op.
    pub async fn record_event(&self, event: ChangeEvent) -> Result<RecordOutcome, SentinelError> {
        self.record_event_at(event, Utc::now()).await
    }

    pub async fn record_event_at(
        &self,
        event: ChangeEvent,
        now: DateTime<Utc>,
    ) -> Result<RecordOutcome, SentinelError> {
        if !huc::is_valid_huc8(&event.watershed_id) {
            return Err(SentinelError::InvalidEvent(format!(
                "watershedId {:?} is not an 8-digit HUC",
                event.watershed_id
            )));
        }
        if event.source_id.trim().is_empty() {
            return Err(SentinelError::InvalidEvent("sourceId is empty".into()));
        }

        let key = dedup_key(&event, self.bucket_minutes);
        if self.window.read().keys.contains(&key) {
            log::debug!("EventQueue: deduplicated {}", key);
            return Ok(RecordOutcome::Deduplicated);
        }

        let record = StoredRecord::encode(&record_id(&key), Some(&event.watershed_id), &event)?;
        self.store.put(EVENTS_NAMESPACE, record).await?;

        if !self.in_window(&event, now) {
            log::debug!("EventQueue: {} recorded as history only", key);
            return Ok(RecordOutcome::OutsideWindow);
        }

        let huc8 = event.watershed_id.clone();
        if self.window.write().insert(key, event) {
            log::info!("EventQueue: accepted event for {}", huc8);
            Ok(RecordOutcome::Accepted)
        } else {
            Ok(RecordOutcome::Deduplicated)
        }
    }

    /// Active events for a watershed, newest first. Each call returns a
    /// fresh sequence.
    pub fn events_for(&self, huc8: &str) -> Vec<ChangeEvent> {
        self.events_for_at(huc8, Utc::now())
    }

    pub fn events_for_at(&self, huc8: &str, now: DateTime<Utc>) -> Vec<ChangeEvent> {
        self.window
            .read()
            .by_watershed
            .get(huc8)
            .map(|list| list.iter().filter(|e| self.in_window(e, now)).cloned().collect())
            .unwrap_or_default()
    }

    /// Full stored history for a watershed, including events that have
    /// left the active window.
    pub async fn history_for(&self, huc8: &str) -> Result<Vec<ChangeEvent>, SentinelError> {
        let records = self.store.list_by_watershed(EVENTS_NAMESPACE, huc8).await?;
        let mut events: Vec<ChangeEvent> = records
            .iter()
            .filter_map(|r| r.decode().ok())
            .collect();
        events.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        Ok(events)
    }

    /// Drop events older than the window from memory. The store keeps them.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.window.write();
        let window = &mut *guard;
        let mut expired_keys = Vec::new();

        for list in window.by_watershed.values_mut() {
            list.retain(|event| {
                let keep = event.age_hours(now) <= self.window_hours;
                if !keep {
                    expired_keys.push(dedup_key(event, self.bucket_minutes));
                }
                keep
            });
        }
        window.by_watershed.retain(|_, list| !list.is_empty());
        for key in &expired_keys {
            window.keys.remove(key);
        }

        if !expired_keys.is_empty() {
            log::info!("EventQueue: pruned {} expired events", expired_keys.len());
        }
        expired_keys.len()
    }

    /// Copy of the active window for one scoring run.
    pub fn snapshot(&self, now: DateTime<Utc>) -> WindowSnapshot {
        self.window
            .read()
            .by_watershed
            .iter()
            .filter_map(|(huc8, list)| {
                let active: Vec<ChangeEvent> =
                    list.iter().filter(|e| self.in_window(e, now)).cloned().collect();
                if active.is_empty() {
                    None
                } else {
                    Some((huc8.clone(), active))
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.window.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release the queue at shutdown. Accepted events are already durable.
    pub async fn close(&self) {
        let pruned = self.prune_expired(Utc::now());
        log::info!(
            "EventQueue: closed with {} active events ({} pruned)",
            self.len(),
            pruned
        );
    }
}
