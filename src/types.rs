//! Core types shared by the queue, scorer, escalation controller and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Category of environmental change observed by an ingestion source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    DissolvedOxygenCrash,
    NutrientSpike,
    HarmfulAlgalBloom,
    SewageOverflow,
    ComplianceViolation,
    NewImpairment,
    FlowAnomaly,
    TemperatureAnomaly,
    ShellfishClosure,
    BeachAdvisory,
}

impl SignalType {
    pub const ALL: [SignalType; 10] = [
        SignalType::DissolvedOxygenCrash,
        SignalType::NutrientSpike,
        SignalType::HarmfulAlgalBloom,
        SignalType::SewageOverflow,
        SignalType::ComplianceViolation,
        SignalType::NewImpairment,
        SignalType::FlowAnomaly,
        SignalType::TemperatureAnomaly,
        SignalType::ShellfishClosure,
        SignalType::BeachAdvisory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::DissolvedOxygenCrash => "dissolved-oxygen-crash",
            SignalType::NutrientSpike => "nutrient-spike",
            SignalType::HarmfulAlgalBloom => "harmful-algal-bloom",
            SignalType::SewageOverflow => "sewage-overflow",
            SignalType::ComplianceViolation => "compliance-violation",
            SignalType::NewImpairment => "new-impairment",
            SignalType::FlowAnomaly => "flow-anomaly",
            SignalType::TemperatureAnomaly => "temperature-anomaly",
            SignalType::ShellfishClosure => "shellfish-closure",
            SignalType::BeachAdvisory => "beach-advisory",
        }
    }
}

impl std::fmt::Display for SignalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered severity classification derived from a watershed score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    None,
    Watch,
    Advisory,
    Alert,
}

impl AlertLevel {
    pub const ALL: [AlertLevel; 4] = [
        AlertLevel::None,
        AlertLevel::Watch,
        AlertLevel::Advisory,
        AlertLevel::Alert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::None => "none",
            AlertLevel::Watch => "watch",
            AlertLevel::Advisory => "advisory",
            AlertLevel::Alert => "alert",
        }
    }

    /// Whether this level is handed to the escalation controller.
    pub fn is_escalating(&self) -> bool {
        *self >= AlertLevel::Advisory
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A normalized observation reported by an ingestion collaborator.
///
/// Immutable once recorded. `severity_hint` is carried for the narrative
/// step and the UI; scoring weights come from the configured base scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub watershed_id: String,
    pub source_id: String,
    pub signal_type: SignalType,
    #[serde(default)]
    pub severity_hint: Option<f64>,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub reference: Option<String>,
}

impl ChangeEvent {
    /// Age of the event in fractional hours relative to `now`. Events stamped
    /// in the future report zero.
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        let secs = (now - self.detected_at).num_seconds() as f64;
        (secs / 3600.0).max(0.0)
    }
}

/// Result of offering an event to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordOutcome {
    Accepted,
    Deduplicated,
    /// Persisted as history but older than the active window.
    OutsideWindow,
}

// ---------------------------------------------------------------------------
// Source health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SourceStatus {
    Healthy,
    Degraded,
    Down,
}

/// Ingestion health for one source, as last reported by its collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentinelHealth {
    pub source_id: String,
    pub status: SourceStatus,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub first_failure_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_check_after: Option<DateTime<Utc>>,
}

impl SentinelHealth {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            status: SourceStatus::Healthy,
            last_success_at: None,
            last_error_at: None,
            error_code: None,
            consecutive_failures: 0,
            first_failure_at: None,
            next_check_after: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scores
// ---------------------------------------------------------------------------

/// A compound pattern that matched a watershed in the current run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternMatch {
    pub id: String,
    pub label: String,
    pub bonus: f64,
}

/// Ephemeral per-run projection of a watershed's risk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatershedScore {
    pub huc8: String,
    pub state_abbr: Option<String>,
    pub region: String,
    pub score: f64,
    pub raw_score: f64,
    pub adjacency_bonus: f64,
    pub pattern_bonus: f64,
    pub level: AlertLevel,
    pub events: Vec<ChangeEvent>,
    pub active_patterns: Vec<PatternMatch>,
    /// Share of the raw score contributed by healthy sources.
    pub confidence: f64,
    pub degraded_sources: Vec<String>,
    pub latest_event_at: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

impl WatershedScore {
    pub fn reduced_confidence(&self) -> bool {
        self.confidence < 1.0 || !self.degraded_sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_level_ordering() {
        assert!(AlertLevel::None < AlertLevel::Watch);
        assert!(AlertLevel::Watch < AlertLevel::Advisory);
        assert!(AlertLevel::Advisory < AlertLevel::Alert);
        assert!(AlertLevel::Advisory.is_escalating());
        assert!(!AlertLevel::Watch.is_escalating());
    }

    #[test]
    fn test_signal_type_serde_matches_as_str() {
        for signal in SignalType::ALL {
            let json = serde_json::to_string(&signal).expect("serialize");
            assert_eq!(json, format!("\"{}\"", signal.as_str()));
        }
    }

    #[test]
    fn test_change_event_deserializes_camel_case() {
        let json = r#"{
            "watershedId": "02070010",
            "sourceId": "wqp",
            "signalType": "dissolved-oxygen-crash",
            "detectedAt": "2026-05-01T12:00:00Z"
        }"#;
        let event: ChangeEvent = serde_json::from_str(json).expect("parse");
        assert_eq!(event.watershed_id, "02070010");
        assert_eq!(event.signal_type, SignalType::DissolvedOxygenCrash);
        assert!(event.severity_hint.is_none());
        assert!(event.reference.is_none());
    }

    #[test]
    fn test_future_event_has_zero_age() {
        let now = Utc::now();
        let event = ChangeEvent {
            watershed_id: "02070010".into(),
            source_id: "wqp".into(),
            signal_type: SignalType::NutrientSpike,
            severity_hint: None,
            detected_at: now + chrono::Duration::hours(2),
            reference: None,
        };
        assert_eq!(event.age_hours(now), 0.0);
    }
}
