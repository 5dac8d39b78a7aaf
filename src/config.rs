//! Engine configuration.
//!
//! The config lives at `~/.sentinel/config.json` (or `$SENTINEL_CONFIG`).
//! Every field has a default so a partial document, or no document at all,
//! yields a working engine. Secrets and deployment addresses can be
//! overridden from the environment.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SentinelError;
use crate::types::{AlertLevel, SignalType};

// ---------------------------------------------------------------------------
// Scoring tables
// ---------------------------------------------------------------------------

/// Lower bound of an alert level. Levels are half-open `[min_score, next)`;
/// the highest boundary is open-ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdBoundary {
    pub level: AlertLevel,
    pub min_score: f64,
}

/// A named co-occurrence rule evaluated per watershed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompoundPattern {
    pub id: String,
    pub label: String,
    pub required_signals: BTreeSet<SignalType>,
    pub window_hours: f64,
    pub bonus: f64,
    /// Patterns that cannot count together with this one.
    #[serde(default)]
    pub exclusive_with: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FreshnessConfig {
    pub half_life_hours: f64,
    /// Weight an event approaches at the far edge of the window.
    pub floor: f64,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            half_life_hours: 12.0,
            floor: 0.1,
        }
    }
}

/// Multiplier applied to `adjacentHucBonus` by the neighbour's level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdjacencyFactors {
    pub watch: f64,
    pub advisory: f64,
    pub alert: f64,
}

impl Default for AdjacencyFactors {
    fn default() -> Self {
        Self {
            watch: 0.5,
            advisory: 0.75,
            alert: 1.0,
        }
    }
}

impl AdjacencyFactors {
    pub fn for_level(&self, level: AlertLevel) -> f64 {
        match level {
            AlertLevel::None => 0.0,
            AlertLevel::Watch => self.watch,
            AlertLevel::Advisory => self.advisory,
            AlertLevel::Alert => self.alert,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringConfig {
    pub event_window_hours: f64,
    pub dedup_bucket_minutes: i64,
    pub freshness: FreshnessConfig,
    pub signal_base_scores: BTreeMap<SignalType, f64>,
    pub alert_thresholds: Vec<ThresholdBoundary>,
    pub compound_patterns: Vec<CompoundPattern>,
    pub adjacent_huc_bonus: f64,
    pub adjacency_factors: AdjacencyFactors,
    /// Explicit adjacent HUC-8 pairs. Direction does not matter.
    pub adjacency: Vec<(String, String)>,
    /// Also treat HUC-8s in the same HUC-6 basin as adjacent.
    pub infer_basin_adjacency: bool,
    pub watershed_states: HashMap<String, String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            event_window_hours: 72.0,
            dedup_bucket_minutes: 60,
            freshness: FreshnessConfig::default(),
            signal_base_scores: default_base_scores(),
            alert_thresholds: default_thresholds(),
            compound_patterns: default_patterns(),
            adjacent_huc_bonus: 10.0,
            adjacency_factors: AdjacencyFactors::default(),
            adjacency: Vec::new(),
            infer_basin_adjacency: false,
            watershed_states: HashMap::new(),
        }
    }
}

impl ScoringConfig {
    /// Base score for a signal type. Unlisted types contribute nothing.
    pub fn base_score(&self, signal: SignalType) -> f64 {
        self.signal_base_scores.get(&signal).copied().unwrap_or(0.0)
    }

    /// Classify a score against the ordered threshold table.
    pub fn alert_level(&self, score: f64) -> AlertLevel {
        get_alert_level(score, &self.alert_thresholds)
    }

    pub fn event_window(&self) -> chrono::Duration {
        chrono::Duration::seconds((self.event_window_hours * 3600.0) as i64)
    }

    fn validate(&self) -> Result<(), SentinelError> {
        if self.event_window_hours <= 0.0 {
            return Err(SentinelError::Config("eventWindowHours must be positive".into()));
        }
        if self.dedup_bucket_minutes <= 0 {
            return Err(SentinelError::Config("dedupBucketMinutes must be positive".into()));
        }
        if !(self.freshness.floor > 0.0 && self.freshness.floor <= 1.0) {
            return Err(SentinelError::Config("freshness.floor must be in (0, 1]".into()));
        }
        if self.freshness.half_life_hours <= 0.0 {
            return Err(SentinelError::Config("freshness.halfLifeHours must be positive".into()));
        }
        if let Some((signal, score)) = self.signal_base_scores.iter().find(|(_, s)| **s < 0.0) {
            return Err(SentinelError::Config(format!(
                "base score for {} is negative ({})",
                signal, score
            )));
        }
        for pair in self.alert_thresholds.windows(2) {
            if pair[1].min_score <= pair[0].min_score || pair[1].level <= pair[0].level {
                return Err(SentinelError::Config(
                    "alertThresholds must ascend strictly by score and level".into(),
                ));
            }
        }
        let mut ids = BTreeSet::new();
        for pattern in &self.compound_patterns {
            if !ids.insert(pattern.id.as_str()) {
                return Err(SentinelError::Config(format!(
                    "duplicate compound pattern id {}",
                    pattern.id
                )));
            }
            if pattern.window_hours <= 0.0 || pattern.required_signals.is_empty() {
                return Err(SentinelError::Config(format!(
                    "compound pattern {} needs a positive window and at least one signal",
                    pattern.id
                )));
            }
        }
        Ok(())
    }
}

/// Map a score to its level: the highest boundary whose `min_score` the
/// score reaches. Scores below every boundary are `None`.
pub fn get_alert_level(score: f64, thresholds: &[ThresholdBoundary]) -> AlertLevel {
    thresholds
        .iter()
        .filter(|t| score >= t.min_score)
        .map(|t| t.level)
        .max()
        .unwrap_or(AlertLevel::None)
}

fn default_base_scores() -> BTreeMap<SignalType, f64> {
    BTreeMap::from([
        (SignalType::DissolvedOxygenCrash, 15.0),
        (SignalType::NutrientSpike, 10.0),
        (SignalType::HarmfulAlgalBloom, 20.0),
        (SignalType::SewageOverflow, 20.0),
        (SignalType::ComplianceViolation, 8.0),
        (SignalType::NewImpairment, 12.0),
        (SignalType::FlowAnomaly, 6.0),
        (SignalType::TemperatureAnomaly, 5.0),
        (SignalType::ShellfishClosure, 15.0),
        (SignalType::BeachAdvisory, 10.0),
    ])
}

fn default_thresholds() -> Vec<ThresholdBoundary> {
    vec![
        ThresholdBoundary { level: AlertLevel::Watch, min_score: 10.0 },
        ThresholdBoundary { level: AlertLevel::Advisory, min_score: 30.0 },
        ThresholdBoundary { level: AlertLevel::Alert, min_score: 60.0 },
    ]
}

fn pattern(
    id: &str,
    label: &str,
    signals: &[SignalType],
    window_hours: f64,
    bonus: f64,
    exclusive_with: &[&str],
) -> CompoundPattern {
    CompoundPattern {
        id: id.to_string(),
        label: label.to_string(),
        required_signals: signals.iter().copied().collect(),
        window_hours,
        bonus,
        exclusive_with: exclusive_with.iter().map(|s| s.to_string()).collect(),
    }
}

fn default_patterns() -> Vec<CompoundPattern> {
    use SignalType::*;
    vec![
        pattern(
            "hypoxia-cascade",
            "Nutrient loading followed by oxygen collapse",
            &[NutrientSpike, DissolvedOxygenCrash],
            48.0,
            20.0,
            &[],
        ),
        pattern(
            "bloom-toxicity",
            "Algal bloom under elevated water temperature",
            &[HarmfulAlgalBloom, TemperatureAnomaly],
            72.0,
            15.0,
            &[],
        ),
        pattern(
            "sewage-contamination",
            "Sewage overflow with recreational closures",
            &[SewageOverflow, BeachAdvisory],
            24.0,
            20.0,
            &["shellfish-risk"],
        ),
        pattern(
            "shellfish-risk",
            "Sewage overflow with shellfish harvest closures",
            &[SewageOverflow, ShellfishClosure],
            48.0,
            18.0,
            &["sewage-contamination"],
        ),
        pattern(
            "regulatory-failure",
            "Permit violations in a newly impaired water",
            &[ComplianceViolation, NewImpairment],
            72.0,
            10.0,
            &[],
        ),
    ]
}

// ---------------------------------------------------------------------------
// Runtime sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureFlags {
    pub sentinel_enabled: bool,
    pub scoring_enabled: bool,
    pub escalation_enabled: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            sentinel_enabled: true,
            scoring_enabled: true,
            escalation_enabled: true,
        }
    }
}

impl FeatureFlags {
    /// Reason the run should be a no-op, if any.
    pub fn disabled_reason(&self) -> Option<&'static str> {
        if !self.sentinel_enabled {
            Some("sentinel disabled by feature flag")
        } else if !self.scoring_enabled {
            Some("sentinel scoring disabled by feature flag")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    /// Consecutive failures that move a source from DEGRADED to DOWN.
    pub down_after_failures: u32,
    pub stale_after_hours: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            down_after_failures: 3,
            stale_after_hours: 48,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of each delay randomised, in [0, 1].
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 5_000,
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EscalationConfig {
    pub narrative_url: Option<String>,
    pub cooldown_minutes: i64,
    pub max_concurrency: usize,
    pub call_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            narrative_url: None,
            cooldown_minutes: 360,
            max_concurrency: 2,
            call_timeout_secs: 45,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunConfig {
    /// Wall-clock budget for one invocation.
    pub budget_secs: u64,
    pub warm_up_timeout_secs: u64,
    pub top_n: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            budget_secs: 240,
            warm_up_timeout_secs: 30,
            top_n: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub bind: String,
    /// Shared bearer secret for the trigger and ingestion endpoints.
    pub cron_secret: Option<String>,
    /// Drive runs from an in-process ticker instead of an external trigger.
    pub self_schedule: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            cron_secret: None,
            self_schedule: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// SQLite file path, or the literal `memory` for a volatile store.
    pub path: Option<String>,
}

impl StoreConfig {
    pub fn is_memory(&self) -> bool {
        self.path.as_deref() == Some("memory")
    }

    /// Resolve the SQLite path: explicit path or `~/.sentinel/sentinel.db`.
    pub fn sqlite_path(&self) -> Result<PathBuf, SentinelError> {
        match self.path.as_deref() {
            Some(path) if path != "memory" => Ok(PathBuf::from(path)),
            _ => Ok(sentinel_dir()?.join("sentinel.db")),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SentinelConfig {
    pub features: FeatureFlags,
    pub scoring: ScoringConfig,
    pub health: HealthConfig,
    pub escalation: EscalationConfig,
    pub run: RunConfig,
    /// Scheduling hint per job, in seconds, under normal conditions.
    pub poll_intervals: BTreeMap<String, u64>,
    /// Shorter cadence used while any watershed is at ALERT.
    pub escalated_poll_intervals: BTreeMap<String, u64>,
    pub server: ServerConfig,
    pub store: StoreConfig,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            features: FeatureFlags::default(),
            scoring: ScoringConfig::default(),
            health: HealthConfig::default(),
            escalation: EscalationConfig::default(),
            run: RunConfig::default(),
            poll_intervals: BTreeMap::from([
                ("sentinel".to_string(), 300),
                ("ingest".to_string(), 900),
            ]),
            escalated_poll_intervals: BTreeMap::from([
                ("sentinel".to_string(), 60),
                ("ingest".to_string(), 300),
            ]),
            server: ServerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl SentinelConfig {
    pub fn validate(&self) -> Result<(), SentinelError> {
        self.scoring.validate()?;
        if self.escalation.max_concurrency == 0 {
            return Err(SentinelError::Config("escalation.maxConcurrency must be at least 1".into()));
        }
        if self.escalation.cooldown_minutes < 0 {
            return Err(SentinelError::Config("escalation.cooldownMinutes must not be negative".into()));
        }
        if !(0.0..=1.0).contains(&self.escalation.retry.jitter) {
            return Err(SentinelError::Config("escalation.retry.jitter must be in [0, 1]".into()));
        }
        if self.health.down_after_failures == 0 {
            return Err(SentinelError::Config("health.downAfterFailures must be at least 1".into()));
        }
        Ok(())
    }

    /// Apply `SENTINEL_*` environment overrides.
    fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = get("SENTINEL_CRON_SECRET").filter(|s| !s.is_empty()) {
            self.server.cron_secret = Some(secret);
        }
        if let Some(url) = get("SENTINEL_NARRATIVE_URL").filter(|s| !s.is_empty()) {
            self.escalation.narrative_url = Some(url);
        }
        if let Some(bind) = get("SENTINEL_BIND").filter(|s| !s.is_empty()) {
            self.server.bind = bind;
        }
        if let Some(path) = get("SENTINEL_STORE_PATH").filter(|s| !s.is_empty()) {
            self.store.path = Some(path);
        }
    }
}

fn sentinel_dir() -> Result<PathBuf, SentinelError> {
    let home = dirs::home_dir()
        .ok_or_else(|| SentinelError::Config("Could not find home directory".into()))?;
    Ok(home.join(".sentinel"))
}

/// Resolve the config path from `$SENTINEL_CONFIG` or the default location.
pub fn config_path() -> Result<PathBuf, SentinelError> {
    match std::env::var("SENTINEL_CONFIG") {
        Ok(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(sentinel_dir()?.join("config.json")),
    }
}

/// Load, override from the environment, and validate the config.
pub fn load_config() -> Result<SentinelConfig, SentinelError> {
    let path = config_path()?;
    let mut config = load_config_from(&path)?;
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Parse the config at `path`. A missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<SentinelConfig, SentinelError> {
    if !path.exists() {
        log::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(SentinelConfig::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| SentinelError::Config(format!("Failed to read config: {}", e)))?;

    serde_json::from_str(&content)
        .map_err(|e| SentinelError::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let config = ScoringConfig::default();
        assert_eq!(config.alert_level(30.0), AlertLevel::Advisory);
        assert_eq!(config.alert_level(29.0), AlertLevel::Watch);
        assert_eq!(config.alert_level(60.0), AlertLevel::Alert);
        assert_eq!(config.alert_level(59.0), AlertLevel::Advisory);
        assert_eq!(config.alert_level(10.0), AlertLevel::Watch);
        assert_eq!(config.alert_level(9.0), AlertLevel::None);
    }

    #[test]
    fn test_highest_threshold_is_open_ended() {
        let config = ScoringConfig::default();
        assert_eq!(config.alert_level(10_000.0), AlertLevel::Alert);
        assert_eq!(config.alert_level(0.0), AlertLevel::None);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let json = r#"{
            "scoring": { "eventWindowHours": 24 },
            "escalation": { "cooldownMinutes": 30 }
        }"#;
        let config: SentinelConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.scoring.event_window_hours, 24.0);
        assert_eq!(config.scoring.dedup_bucket_minutes, 60);
        assert_eq!(config.escalation.cooldown_minutes, 30);
        assert_eq!(config.escalation.max_concurrency, 2);
        assert_eq!(config.poll_intervals.get("sentinel"), Some(&300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_base_scores_are_enum_keyed() {
        let json = r#"{ "scoring": { "signalBaseScores": { "nutrient-spike": 4.5 } } }"#;
        let config: SentinelConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.scoring.base_score(SignalType::NutrientSpike), 4.5);
        assert_eq!(config.scoring.base_score(SignalType::FlowAnomaly), 0.0);
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let mut config = SentinelConfig::default();
        config.scoring.alert_thresholds = vec![
            ThresholdBoundary { level: AlertLevel::Watch, min_score: 30.0 },
            ThresholdBoundary { level: AlertLevel::Advisory, min_score: 10.0 },
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_floor_rejected() {
        let mut config = SentinelConfig::default();
        config.scoring.freshness.floor = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_pattern_ids_rejected() {
        let mut config = SentinelConfig::default();
        let first = config.scoring.compound_patterns[0].clone();
        config.scoring.compound_patterns.push(first);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SentinelConfig::default();
        config.apply_env(|key| match key {
            "SENTINEL_CRON_SECRET" => Some("s3cret".into()),
            "SENTINEL_NARRATIVE_URL" => Some("http://insights.local/api/insights".into()),
            "SENTINEL_STORE_PATH" => Some("memory".into()),
            _ => None,
        });
        assert_eq!(config.server.cron_secret.as_deref(), Some("s3cret"));
        assert_eq!(
            config.escalation.narrative_url.as_deref(),
            Some("http://insights.local/api/insights")
        );
        assert!(config.store.is_memory());
        assert_eq!(config.server.bind, "127.0.0.1:8787");
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config_from(&dir.path().join("absent.json")).expect("defaults");
        assert_eq!(config, SentinelConfig::default());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").expect("write");
        assert!(load_config_from(&path).is_err());
    }

    #[test]
    fn test_disabled_reason() {
        let mut flags = FeatureFlags::default();
        assert!(flags.disabled_reason().is_none());
        flags.scoring_enabled = false;
        assert_eq!(flags.disabled_reason(), Some("sentinel scoring disabled by feature flag"));
        flags.sentinel_enabled = false;
        assert_eq!(flags.disabled_reason(), Some("sentinel disabled by feature flag"));
    }
}
