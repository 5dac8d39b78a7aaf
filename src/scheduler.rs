//! The Sentinel service: one scoring-and-escalation pass per trigger.
//!
//! A run warms the queue and health tracker, prunes and snapshots the
//! window, scores every watershed, escalates newly elevated cohorts within
//! the run budget, and caches the scores for the summary endpoint. Runs
//! never overlap: a trigger that arrives mid-run is reported as skipped.
//! Whatever goes wrong inside a run comes back as an `error` report.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::SentinelConfig;
use crate::error::SentinelError;
use crate::escalation::{EscalationController, EscalationOutcome, NarrativeClient};
use crate::event_queue::EventQueue;
use crate::health::SourceHealthTracker;
use crate::huc;
use crate::signals::ScoringEngine;
use crate::store::EventStore;
use crate::summary::{self, AlertSummary, TopWatershed};
use crate::types::{AlertLevel, ChangeEvent, RecordOutcome, SentinelHealth, WatershedScore};

/// Job name for this engine in the poll interval tables.
pub const SENTINEL_JOB: &str = "sentinel";

const DEFAULT_INTERVAL_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Complete,
    Skipped,
    Disabled,
    Error,
}

/// Scheduling hint for the external trigger. Escalated intervals apply
/// while any watershed sits at ALERT.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CadenceHint {
    pub escalated: bool,
    pub intervals: BTreeMap<String, u64>,
    pub next_run_secs: u64,
}

impl CadenceHint {
    pub fn for_scores(scores: &[WatershedScore], config: &SentinelConfig) -> Self {
        let escalated = scores.iter().any(|s| s.level == AlertLevel::Alert);
        let intervals = if escalated {
            config.escalated_poll_intervals.clone()
        } else {
            config.poll_intervals.clone()
        };
        let next_run_secs = intervals
            .get(SENTINEL_JOB)
            .copied()
            .unwrap_or(DEFAULT_INTERVAL_SECS);
        Self {
            escalated,
            intervals,
            next_run_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub status: RunStatus,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub watersheds_scored: usize,
    pub level_counts: BTreeMap<AlertLevel, usize>,
    pub top: Vec<TopWatershed>,
    pub escalations: Vec<EscalationOutcome>,
    /// Watersheds scored partly from sources that are not HEALTHY.
    pub reduced_confidence: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cadence: Option<CadenceHint>,
    pub warnings: Vec<String>,
}

impl RunReport {
    fn new(status: RunStatus, run_id: &str, started_at: DateTime<Utc>, started: Instant) -> Self {
        Self {
            status,
            run_id: run_id.to_string(),
            reason: None,
            message: None,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            watersheds_scored: 0,
            level_counts: BTreeMap::new(),
            top: Vec::new(),
            escalations: Vec::new(),
            reduced_confidence: Vec::new(),
            cadence: None,
            warnings: Vec::new(),
        }
    }
}

/// A watershed's window and its most recent score.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatershedDetail {
    pub huc8: String,
    pub region: String,
    pub events: Vec<ChangeEvent>,
    pub score: Option<WatershedScore>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct ScoreCache {
    scores: Arc<Vec<WatershedScore>>,
}

pub struct Sentinel {
    config: SentinelConfig,
    queue: Arc<EventQueue>,
    health: Arc<SourceHealthTracker>,
    engine: ScoringEngine,
    escalation: EscalationController,
    running: AtomicBool,
    cache: RwLock<ScoreCache>,
}

/// Clears the running flag when the run ends, panics included.
struct RunGuard {
    sentinel: Arc<Sentinel>,
}

impl RunGuard {
    fn acquire(sentinel: &Arc<Sentinel>) -> Option<Self> {
        sentinel
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                sentinel: Arc::clone(sentinel),
            })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.sentinel.running.store(false, Ordering::Release);
    }
}

impl Sentinel {
    pub fn new(
        config: SentinelConfig,
        store: Arc<dyn EventStore>,
        client: Arc<dyn NarrativeClient>,
    ) -> Self {
        let queue = Arc::new(EventQueue::new(Arc::clone(&store), &config.scoring));
        let health = Arc::new(SourceHealthTracker::new(store, config.health.clone()));
        let engine = ScoringEngine::new(config.scoring.clone());
        let escalation = EscalationController::new(client, &config.escalation);
        Self {
            config,
            queue,
            health,
            engine,
            escalation,
            running: AtomicBool::new(false),
            cache: RwLock::new(ScoreCache::default()),
        }
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn health(&self) -> &Arc<SourceHealthTracker> {
        &self.health
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Scores from the last run that got as far as scoring.
    pub fn latest_scores(&self) -> Arc<Vec<WatershedScore>> {
        Arc::clone(&self.cache.read().scores)
    }

    fn warm_up_timeout(&self) -> Duration {
        Duration::from_secs(self.config.run.warm_up_timeout_secs)
    }

    /// Warm the queue and tracker concurrently. Failures are returned as
    /// warnings; the run carries on with whatever is already in memory.
    pub async fn warm(&self) -> Vec<String> {
        let limit = self.warm_up_timeout();
        let (queue, health) = tokio::join!(
            tokio::time::timeout(limit, self.queue.warm()),
            tokio::time::timeout(limit, self.health.warm()),
        );

        let mut warnings = Vec::new();
        for (name, result) in [("event queue", queue), ("source health", health)] {
            let err = match result {
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => e,
                Err(_) => SentinelError::WarmUpTimeout(name, limit.as_secs()),
            };
            log::warn!("Sentinel: warm-up of {} failed: {}", name, err);
            warnings.push(format!("warm-up of {} failed: {}", name, err));
        }
        warnings
    }

    /// Accept an event from an ingestion collaborator.
    pub async fn record_event(&self, event: ChangeEvent) -> Result<RecordOutcome, SentinelError> {
        tokio::time::timeout(self.warm_up_timeout(), self.queue.warm())
            .await
            .map_err(|_| SentinelError::WarmUpTimeout("event queue", self.warm_up_timeout().as_secs()))??;
        self.queue.record_event(event).await
    }

    /// Record an ingestion outcome for a source.
    pub async fn report_source_outcome(
        &self,
        source_id: &str,
        success: bool,
        error_code: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<SentinelHealth, SentinelError> {
        tokio::time::timeout(self.warm_up_timeout(), self.health.warm())
            .await
            .map_err(|_| SentinelError::WarmUpTimeout("source health", self.warm_up_timeout().as_secs()))??;
        if success {
            self.health.report_success(source_id, at).await
        } else {
            self.health.report_failure(source_id, at, error_code).await
        }
    }

    /// Digest from cached scores and live health.
    pub fn summary(&self, now: DateTime<Utc>) -> AlertSummary {
        summary::build_summary(
            &self.latest_scores(),
            self.health.rollup(now),
            self.config.run.top_n,
            now,
        )
    }

    pub fn watershed(&self, huc8: &str) -> WatershedDetail {
        let score = self.latest_scores().iter().find(|s| s.huc8 == huc8).cloned();
        let region = score
            .as_ref()
            .and_then(|s| s.state_abbr.clone())
            .or_else(|| self.config.scoring.watershed_states.get(huc8).cloned())
            .unwrap_or_else(|| huc::region_name(huc8).to_string());
        WatershedDetail {
            huc8: huc8.to_string(),
            region,
            events: self.queue.events_for(huc8),
            score,
        }
    }

    /// Entrypoint for one trigger. Never fails: every outcome, including a
    /// panic inside the run, is a `RunReport`.
    pub async fn run_once(self: &Arc<Self>) -> RunReport {
        let started = Instant::now();
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        if let Some(reason) = self.config.features.disabled_reason() {
            log::info!("Sentinel: run {} not started: {}", run_id, reason);
            let mut report = RunReport::new(RunStatus::Disabled, &run_id, started_at, started);
            report.reason = Some(reason.to_string());
            return report;
        }

        let Some(guard) = RunGuard::acquire(self) else {
            log::info!("Sentinel: run {} skipped, previous run still in progress", run_id);
            let mut report = RunReport::new(RunStatus::Skipped, &run_id, started_at, started);
            report.reason = Some("previous run still in progress".to_string());
            return report;
        };

        log::info!("Sentinel: run {} started", run_id);
        let task_run_id = run_id.clone();
        // Spawned so a panic surfaces as a JoinError instead of unwinding
        // into the caller; the guard travels with the run.
        let handle = tokio::spawn(async move {
            let guard = guard;
            guard.sentinel.execute(&task_run_id, started_at, started).await
        });

        let report = match handle.await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                log::warn!("Sentinel: run {} failed: {}", run_id, e);
                let mut report = RunReport::new(RunStatus::Error, &run_id, started_at, started);
                report.message = Some(e.to_string());
                report
            }
            Err(e) => {
                log::warn!("Sentinel: run {} aborted: {}", run_id, e);
                let mut report = RunReport::new(RunStatus::Error, &run_id, started_at, started);
                report.message = Some(format!("internal fault: {}", e));
                report
            }
        };

        log::info!(
            "Sentinel: run {} finished {:?} in {}ms ({} watersheds, {} escalations)",
            run_id,
            report.status,
            report.duration_ms,
            report.watersheds_scored,
            report.escalations.len()
        );
        report
    }

    async fn execute(
        &self,
        run_id: &str,
        started_at: DateTime<Utc>,
        started: Instant,
    ) -> Result<RunReport, SentinelError> {
        let deadline = started + Duration::from_secs(self.config.run.budget_secs);
        let mut warnings = self.warm().await;

        let now = Utc::now();
        self.queue.prune_expired(now);
        let window = self.queue.snapshot(now);
        let health = self.health.snapshot();

        let scores = self.engine.score_all_watersheds(&window, &health, now);
        let scores = Arc::new(scores);
        self.cache.write().scores = Arc::clone(&scores);

        let escalations = if self.config.features.escalation_enabled {
            self.escalation.escalate(&scores, now, deadline).await
        } else {
            warnings.push("escalation disabled by feature flag".to_string());
            Vec::new()
        };

        let mut report = RunReport::new(RunStatus::Complete, run_id, started_at, started);
        report.watersheds_scored = scores.len();
        report.level_counts = summary::level_counts(&scores);
        report.top = summary::top_n(&scores, self.config.run.top_n);
        report.escalations = escalations;
        report.reduced_confidence = scores
            .iter()
            .filter(|s| s.reduced_confidence())
            .map(|s| s.huc8.clone())
            .collect();
        report.cadence = Some(CadenceHint::for_scores(&scores, &self.config));
        report.warnings = warnings;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Run on the adaptive cadence until the task is aborted. For
    /// deployments without an external trigger.
    pub fn spawn_ticker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let sentinel = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let report = sentinel.run_once().await;
                let next = report
                    .cadence
                    .map(|c| c.next_run_secs)
                    .or_else(|| sentinel.config.poll_intervals.get(SENTINEL_JOB).copied())
                    .unwrap_or(DEFAULT_INTERVAL_SECS);
                log::debug!("Sentinel: next scheduled run in {}s", next);
                tokio::time::sleep(Duration::from_secs(next.max(1))).await;
            }
        })
    }

    /// Flush state at shutdown.
    pub async fn close(&self) {
        self.queue.close().await;
        self.health.close().await;
        log::info!("Sentinel: closed");
    }
}
