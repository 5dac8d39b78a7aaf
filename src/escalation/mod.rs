//! Escalation of elevated watersheds to the narrative service.
//!
//! Per watershed the controller runs a small state machine:
//!
//! ```text
//! QUIET --(ADVISORY/ALERT)--> TRIGGERED --(attempt done)--> COOLDOWN --(cooldown elapsed)--> QUIET
//! ```
//!
//! Newly triggered watersheds are grouped into one cohort per level and each
//! cohort costs one narrative call. Calls run with bounded concurrency, a
//! per-call timeout and the run's overall deadline; a failing cohort never
//! blocks another.

pub mod client;
pub mod retry;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::EscalationConfig;
use crate::error::EscalationError;
use crate::types::{AlertLevel, WatershedScore};

pub use client::{HttpNarrativeClient, NarrativeClient, NarrativeRequest};
pub use retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EscalationPhase {
    Quiet,
    Triggered,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationStatus {
    /// The narrative service accepted the cohort.
    Triggered,
    /// The narrative service answered with a refusal.
    Failed,
    /// No answer: transport failure, timeout, budget exhausted or fault.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationOutcome {
    pub watershed_id: String,
    pub level: AlertLevel,
    pub status: EscalationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct WatershedState {
    phase: EscalationPhase,
    since: DateTime<Utc>,
}

/// Watersheds that crossed into one level this run.
#[derive(Debug, Clone, PartialEq)]
pub struct Cohort {
    pub level: AlertLevel,
    pub hucs: Vec<String>,
}

pub struct EscalationController {
    client: Arc<dyn NarrativeClient>,
    retry: RetryPolicy,
    cooldown: Duration,
    call_timeout: StdDuration,
    max_concurrency: usize,
    states: Mutex<HashMap<String, WatershedState>>,
}

impl EscalationController {
    pub fn new(client: Arc<dyn NarrativeClient>, config: &EscalationConfig) -> Self {
        Self {
            client,
            retry: RetryPolicy::from(&config.retry),
            cooldown: Duration::minutes(config.cooldown_minutes),
            call_timeout: StdDuration::from_secs(config.call_timeout_secs),
            max_concurrency: config.max_concurrency.max(1),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Current phase of a watershed, with expired cooldowns read as QUIET.
    pub fn phase_of(&self, huc8: &str, now: DateTime<Utc>) -> EscalationPhase {
        match self.states.lock().get(huc8) {
            Some(state) if state.phase == EscalationPhase::Cooldown && now - state.since >= self.cooldown => {
                EscalationPhase::Quiet
            }
            Some(state) => state.phase,
            None => EscalationPhase::Quiet,
        }
    }

    /// Advance the state machine for this run and return the cohorts to
    /// escalate, ALERT first. Watersheds still in cooldown are left out
    /// whatever their level.
    pub fn plan(&self, scores: &[WatershedScore], now: DateTime<Utc>) -> Vec<Cohort> {
        let mut states = self.states.lock();
        states.retain(|_, state| {
            !(state.phase == EscalationPhase::Cooldown && now - state.since >= self.cooldown)
        });

        let mut cohorts: BTreeMap<AlertLevel, Vec<String>> = BTreeMap::new();
        for score in scores.iter().filter(|s| s.level.is_escalating()) {
            if states.contains_key(&score.huc8) {
                log::debug!("Escalation: {} in cooldown, not re-triggering", score.huc8);
                continue;
            }
            states.insert(
                score.huc8.clone(),
                WatershedState {
                    phase: EscalationPhase::Triggered,
                    since: now,
                },
            );
            cohorts.entry(score.level).or_default().push(score.huc8.clone());
        }

        cohorts
            .into_iter()
            .rev()
            .map(|(level, mut hucs)| {
                hucs.sort();
                Cohort { level, hucs }
            })
            .collect()
    }

    fn enter_cooldown(&self, hucs: &[String], now: DateTime<Utc>) {
        let mut states = self.states.lock();
        for huc8 in hucs {
            states.insert(
                huc8.clone(),
                WatershedState {
                    phase: EscalationPhase::Cooldown,
                    since: now,
                },
            );
        }
    }

    /// Escalate every newly elevated watershed. Never fails: every planned
    /// watershed gets an outcome, and all of them enter cooldown.
    pub async fn escalate(
        &self,
        scores: &[WatershedScore],
        now: DateTime<Utc>,
        deadline: Instant,
    ) -> Vec<EscalationOutcome> {
        let cohorts = self.plan(scores, now);
        if cohorts.is_empty() {
            return Vec::new();
        }
        log::info!(
            "Escalation: {} cohort(s) covering {} watershed(s)",
            cohorts.len(),
            cohorts.iter().map(|c| c.hucs.len()).sum::<usize>()
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();
        for (idx, cohort) in cohorts.iter().enumerate() {
            let client = Arc::clone(&self.client);
            let retry = self.retry.clone();
            let semaphore = Arc::clone(&semaphore);
            let call_timeout = self.call_timeout;
            let request = NarrativeRequest {
                hucs: cohort.hucs.clone(),
                level: cohort.level,
            };

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (idx, Err(EscalationError::Configuration("semaphore closed".into())));
                };
                let label = format!("{} cohort", request.level);
                let call = retry.run(&label, || client.generate(&request));
                let result = match tokio::time::timeout(call_timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(EscalationError::Timeout(call_timeout.as_secs())),
                };
                (idx, result)
            });
        }

        let mut results: Vec<Option<(EscalationStatus, Option<String>)>> = vec![None; cohorts.len()];
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((idx, result)))) => {
                    results[idx] = Some(classify(&cohorts[idx], result));
                }
                Ok(Some(Err(e))) => {
                    log::warn!("Escalation: cohort task aborted: {}", e);
                }
                Ok(None) => break,
                Err(_) => {
                    log::warn!(
                        "Escalation: run budget exhausted, abandoning {} in-flight call(s)",
                        tasks.len()
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        let mut outcomes = Vec::new();
        for (cohort, result) in cohorts.iter().zip(results) {
            let (status, message) = result.unwrap_or_else(|| {
                (
                    EscalationStatus::Error,
                    Some("escalation did not complete within the run".to_string()),
                )
            });
            self.enter_cooldown(&cohort.hucs, now);
            outcomes.extend(cohort.hucs.iter().map(|huc8| EscalationOutcome {
                watershed_id: huc8.clone(),
                level: cohort.level,
                status,
                message: message.clone(),
            }));
        }
        outcomes
    }
}

fn classify(
    cohort: &Cohort,
    result: Result<(), EscalationError>,
) -> (EscalationStatus, Option<String>) {
    match result {
        Ok(()) => {
            log::info!(
                "Escalation: narrative triggered for {} at {}",
                cohort.hucs.join(","),
                cohort.level
            );
            (EscalationStatus::Triggered, None)
        }
        Err(e) => {
            log::warn!(
                "Escalation: {} cohort ({}) failed: {}",
                cohort.level,
                cohort.hucs.join(","),
                e
            );
            let status = match e {
                EscalationError::Rejected { .. } | EscalationError::Configuration(_) => {
                    EscalationStatus::Failed
                }
                EscalationError::Network(_) | EscalationError::Timeout(_) => EscalationStatus::Error,
            };
            (status, Some(e.to_string()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::config::RetryConfig;

    /// Scripted narrative client. Records every request; levels listed in
    /// `reject` answer 500, levels in `hang` never answer.
    #[derive(Default)]
    pub(crate) struct FakeNarrativeClient {
        pub calls: Mutex<Vec<NarrativeRequest>>,
        pub reject: Vec<AlertLevel>,
        pub hang: Vec<AlertLevel>,
        pub attempts: AtomicUsize,
    }

    #[async_trait]
    impl NarrativeClient for FakeNarrativeClient {
        async fn generate(&self, request: &NarrativeRequest) -> Result<(), EscalationError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang.contains(&request.level) {
                std::future::pending::<()>().await;
            }
            self.calls.lock().push(request.clone());
            if self.reject.contains(&request.level) {
                return Err(EscalationError::Rejected {
                    status: 400,
                    body: "bad cohort".into(),
                });
            }
            Ok(())
        }
    }

    pub(crate) fn test_config() -> EscalationConfig {
        EscalationConfig {
            narrative_url: None,
            cooldown_minutes: 360,
            max_concurrency: 2,
            call_timeout_secs: 1,
            retry: RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 1,
                jitter: 0.0,
            },
        }
    }

    fn score(huc8: &str, level: AlertLevel, now: DateTime<Utc>) -> WatershedScore {
        WatershedScore {
            huc8: huc8.into(),
            state_abbr: None,
            region: "Mid Atlantic".into(),
            score: 0.0,
            raw_score: 0.0,
            adjacency_bonus: 0.0,
            pattern_bonus: 0.0,
            level,
            events: Vec::new(),
            active_patterns: Vec::new(),
            confidence: 1.0,
            degraded_sources: Vec::new(),
            latest_event_at: Some(now),
            computed_at: now,
        }
    }

    fn deadline() -> Instant {
        Instant::now() + StdDuration::from_secs(10)
    }

    #[tokio::test]
    async fn test_one_call_per_level_cohort() {
        let fake = Arc::new(FakeNarrativeClient::default());
        let controller = EscalationController::new(fake.clone(), &test_config());
        let now = Utc::now();
        let scores = vec![
            score("02070010", AlertLevel::Advisory, now),
            score("02070011", AlertLevel::Advisory, now),
            score("02070012", AlertLevel::Alert, now),
            score("02070013", AlertLevel::Watch, now),
        ];

        let outcomes = controller.escalate(&scores, now, deadline()).await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.status == EscalationStatus::Triggered));

        let calls = fake.calls.lock();
        assert_eq!(calls.len(), 2);
        assert!(calls.contains(&NarrativeRequest {
            hucs: vec!["02070010".into(), "02070011".into()],
            level: AlertLevel::Advisory,
        }));
        assert!(calls.contains(&NarrativeRequest {
            hucs: vec!["02070012".into()],
            level: AlertLevel::Alert,
        }));
    }

    #[tokio::test]
    async fn test_persisting_alert_escalates_once_until_cooldown_expires() {
        let fake = Arc::new(FakeNarrativeClient::default());
        let controller = EscalationController::new(fake.clone(), &test_config());
        let now = Utc::now();
        let scores = vec![score("02070010", AlertLevel::Alert, now)];

        assert_eq!(controller.escalate(&scores, now, deadline()).await.len(), 1);
        assert_eq!(controller.phase_of("02070010", now), EscalationPhase::Cooldown);

        let later = now + Duration::minutes(5);
        assert!(controller.escalate(&scores, later, deadline()).await.is_empty());
        assert_eq!(fake.calls.lock().len(), 1);

        let after_cooldown = now + Duration::minutes(361);
        assert_eq!(controller.phase_of("02070010", after_cooldown), EscalationPhase::Quiet);
        assert_eq!(controller.escalate(&scores, after_cooldown, deadline()).await.len(), 1);
        assert_eq!(fake.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_cohort_does_not_block_other() {
        let fake = Arc::new(FakeNarrativeClient {
            reject: vec![AlertLevel::Alert],
            ..Default::default()
        });
        let controller = EscalationController::new(fake.clone(), &test_config());
        let now = Utc::now();
        let scores = vec![
            score("02070010", AlertLevel::Alert, now),
            score("02070011", AlertLevel::Advisory, now),
        ];

        let outcomes = controller.escalate(&scores, now, deadline()).await;
        let by_id: HashMap<&str, EscalationStatus> = outcomes
            .iter()
            .map(|o| (o.watershed_id.as_str(), o.status))
            .collect();
        assert_eq!(by_id["02070010"], EscalationStatus::Failed);
        assert_eq!(by_id["02070011"], EscalationStatus::Triggered);
        // Failed attempts still enter cooldown
        assert_eq!(controller.phase_of("02070010", now), EscalationPhase::Cooldown);
    }

    #[tokio::test]
    async fn test_hung_call_times_out_as_error() {
        let fake = Arc::new(FakeNarrativeClient {
            hang: vec![AlertLevel::Alert],
            ..Default::default()
        });
        let controller = EscalationController::new(fake.clone(), &test_config());
        let now = Utc::now();
        let scores = vec![
            score("02070010", AlertLevel::Alert, now),
            score("02070011", AlertLevel::Advisory, now),
        ];

        let outcomes = controller.escalate(&scores, now, deadline()).await;
        let hung = outcomes.iter().find(|o| o.watershed_id == "02070010").expect("outcome");
        assert_eq!(hung.status, EscalationStatus::Error);
        let ok = outcomes.iter().find(|o| o.watershed_id == "02070011").expect("outcome");
        assert_eq!(ok.status, EscalationStatus::Triggered);
    }

    #[tokio::test]
    async fn test_run_deadline_abandons_in_flight_calls() {
        let fake = Arc::new(FakeNarrativeClient {
            hang: vec![AlertLevel::Alert],
            ..Default::default()
        });
        let mut config = test_config();
        config.call_timeout_secs = 60;
        let controller = EscalationController::new(fake.clone(), &config);
        let now = Utc::now();
        let scores = vec![score("02070010", AlertLevel::Alert, now)];

        let started = Instant::now();
        let outcomes = controller
            .escalate(&scores, now, Instant::now() + StdDuration::from_millis(100))
            .await;
        assert!(started.elapsed() < StdDuration::from_secs(5));
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, EscalationStatus::Error);
        assert_eq!(controller.phase_of("02070010", now), EscalationPhase::Cooldown);
    }

    #[test]
    fn test_plan_orders_alert_first() {
        let controller =
            EscalationController::new(Arc::new(FakeNarrativeClient::default()), &test_config());
        let now = Utc::now();
        let cohorts = controller.plan(
            &[
                score("02070011", AlertLevel::Advisory, now),
                score("02070010", AlertLevel::Alert, now),
            ],
            now,
        );
        assert_eq!(cohorts[0].level, AlertLevel::Alert);
        assert_eq!(cohorts[1].level, AlertLevel::Advisory);
        assert_eq!(controller.phase_of("02070011", now), EscalationPhase::Triggered);
    }
}
