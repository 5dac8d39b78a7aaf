//! Per-source ingestion health.
//!
//! Ingestion collaborators report outcomes; the scorer and summary only ever
//! read a snapshot. Writes clone the map only while a snapshot is still
//! held by a reader, so a scoring run keeps a consistent view even when
//! outcomes arrive mid-run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::config::HealthConfig;
use crate::error::SentinelError;
use crate::store::{EventStore, StoredRecord, HEALTH_NAMESPACE};
use crate::types::{SentinelHealth, SourceStatus};

/// Shared read-only view of every tracked source.
pub type HealthSnapshot = Arc<HashMap<String, SentinelHealth>>;

// ---------------------------------------------------------------------------
// Backoff schedule
// ---------------------------------------------------------------------------

const HEALTHY_INTERVAL_MIN: i64 = 5;
const DEGRADED_INTERVAL_MIN: i64 = 15;
const DOWN_INTERVAL_MIN: i64 = 60;
const DOWN_24H_INTERVAL_MIN: i64 = 360;
const DOWN_7D_INTERVAL_MIN: i64 = 1440;

/// Minutes until a source should next be polled, given its state at `now`.
/// Long outages back off to a few checks a day.
pub fn backoff_minutes(health: &SentinelHealth, now: DateTime<Utc>) -> i64 {
    if health.consecutive_failures == 0 {
        return HEALTHY_INTERVAL_MIN;
    }
    if let Some(first) = health.first_failure_at {
        let outage = now - first;
        if outage > Duration::days(7) {
            return DOWN_7D_INTERVAL_MIN;
        }
        if outage > Duration::hours(24) {
            return DOWN_24H_INTERVAL_MIN;
        }
    }
    match health.status {
        SourceStatus::Down => DOWN_INTERVAL_MIN,
        _ => DEGRADED_INTERVAL_MIN,
    }
}

/// Counts across all tracked sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRollup {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub down: usize,
    /// Sources with no success inside `staleAfterHours`.
    pub stale: usize,
}

pub struct SourceHealthTracker {
    store: Arc<dyn EventStore>,
    config: HealthConfig,
    sources: RwLock<HealthSnapshot>,
    warmed: OnceCell<usize>,
}

impl SourceHealthTracker {
    pub fn new(store: Arc<dyn EventStore>, config: HealthConfig) -> Self {
        Self {
            store,
            config,
            sources: RwLock::new(Arc::new(HashMap::new())),
            warmed: OnceCell::new(),
        }
    }

    /// Hydrate from the store once; concurrent callers share the load.
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
        let records = self.store.get_all(HEALTH_NAMESPACE).await?;
        let mut loaded = 0;

        let mut guard = self.sources.write();
        let map = Arc::make_mut(&mut *guard);
        for record in &records {
            match record.decode::<SentinelHealth>() {
                // Outcomes reported before warm-up are newer than the store
                Ok(health) if !map.contains_key(&health.source_id) => {
                    map.insert(health.source_id.clone(), health);
                    loaded += 1;
                }
                Ok(_) => {}
                Err(e) => log::warn!("Health: skipping undecodable record {}: {}", record.key, e),
            }
        }
        drop(guard);

        log::info!("Health: warmed {} sources", loaded);
        Ok(loaded)
    }

    /// Current view of every source. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> HealthSnapshot {
        Arc::clone(&self.sources.read())
    }

    pub fn get(&self, source_id: &str) -> Option<SentinelHealth> {
        self.sources.read().get(source_id).cloned()
    }

    /// Any success resets the source straight to `HEALTHY`.
    pub async fn report_success(
        &self,
        source_id: &str,
        at: DateTime<Utc>,
    ) -> Result<SentinelHealth, SentinelError> {
        let updated = self.mutate(source_id, |health| {
            health.status = SourceStatus::Healthy;
            health.last_success_at = Some(at);
            health.error_code = None;
            health.consecutive_failures = 0;
            health.first_failure_at = None;
            health.next_check_after = Some(at + Duration::minutes(backoff_minutes(health, at)));
        });
        self.persist(&updated).await?;
        Ok(updated)
    }

    /// One failure degrades the source; `downAfterFailures` in a row take it down.
    pub async fn report_failure(
        &self,
        source_id: &str,
        at: DateTime<Utc>,
        error_code: Option<String>,
    ) -> Result<SentinelHealth, SentinelError> {
        let down_after = self.config.down_after_failures.max(1);
        let updated = self.mutate(source_id, |health| {
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            health.last_error_at = Some(at);
            health.error_code = error_code;
            health.first_failure_at.get_or_insert(at);
            health.status = if health.consecutive_failures >= down_after {
                SourceStatus::Down
            } else {
                SourceStatus::Degraded
            };
            health.next_check_after = Some(at + Duration::minutes(backoff_minutes(health, at)));
        });

        if updated.status == SourceStatus::Down {
            log::warn!(
                "Health: source {} is DOWN after {} consecutive failures",
                source_id,
                updated.consecutive_failures
            );
        }
        self.persist(&updated).await?;
        Ok(updated)
    }

    fn mutate(&self, source_id: &str, apply: impl FnOnce(&mut SentinelHealth)) -> SentinelHealth {
        let mut guard = self.sources.write();
        let map = Arc::make_mut(&mut *guard);
        let health = map
            .entry(source_id.to_string())
            .or_insert_with(|| SentinelHealth::new(source_id));
        apply(health);
        health.clone()
    }

    async fn persist(&self, health: &SentinelHealth) -> Result<(), SentinelError> {
        let record = StoredRecord::encode(&health.source_id, None, health)?;
        self.store.put(HEALTH_NAMESPACE, record).await?;
        Ok(())
    }

    /// True when the source has not succeeded within `staleAfterHours`.
    /// A source that has never succeeded is stale once it has failed.
    pub fn is_stale(&self, health: &SentinelHealth, now: DateTime<Utc>) -> bool {
        match health.last_success_at {
            Some(at) => now - at > Duration::hours(self.config.stale_after_hours),
            None => health.consecutive_failures > 0,
        }
    }

    /// Whether a source's backoff has elapsed.
    pub fn is_due(&self, source_id: &str, now: DateTime<Utc>) -> bool {
        self.get(source_id)
            .and_then(|h| h.next_check_after)
            .map_or(true, |next| now >= next)
    }

    pub fn rollup(&self, now: DateTime<Utc>) -> HealthRollup {
        rollup_of(&self.snapshot(), |h| self.is_stale(h, now))
    }

    /// Flush every tracked source to the store.
    pub async fn close(&self) {
        let snapshot = self.snapshot();
        let mut failed = 0;
        for health in snapshot.values() {
            if let Err(e) = self.persist(health).await {
                log::warn!("Health: failed to flush {}: {}", health.source_id, e);
                failed += 1;
            }
        }
        log::info!(
            "Health: closed, flushed {} sources ({} failed)",
            snapshot.len() - failed,
            failed
        );
    }
}

/// Roll up a snapshot. Staleness is decided by the caller.
pub fn rollup_of(
    snapshot: &HashMap<String, SentinelHealth>,
    is_stale: impl Fn(&SentinelHealth) -> bool,
) -> HealthRollup {
    let mut rollup = HealthRollup {
        total: snapshot.len(),
        ..Default::default()
    };
    for health in snapshot.values() {
        match health.status {
            SourceStatus::Healthy => rollup.healthy += 1,
            SourceStatus::Degraded => rollup.degraded += 1,
            SourceStatus::Down => rollup.down += 1,
        }
        if is_stale(health) {
            rollup.stale += 1;
        }
    }
    rollup
}
