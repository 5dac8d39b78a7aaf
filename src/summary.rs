//! Dashboard digest built from the latest scores and a health rollup.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::health::HealthRollup;
use crate::types::{AlertLevel, WatershedScore};

/// Compact row for a ranked watershed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopWatershed {
    pub huc8: String,
    pub region: String,
    pub score: f64,
    pub level: AlertLevel,
    pub event_count: usize,
    pub patterns: Vec<String>,
    pub reduced_confidence: bool,
}

impl From<&WatershedScore> for TopWatershed {
    fn from(score: &WatershedScore) -> Self {
        Self {
            huc8: score.huc8.clone(),
            region: score
                .state_abbr
                .clone()
                .unwrap_or_else(|| score.region.clone()),
            score: (score.score * 10.0).round() / 10.0,
            level: score.level,
            event_count: score.events.len(),
            patterns: score.active_patterns.iter().map(|p| p.id.clone()).collect(),
            reduced_confidence: score.reduced_confidence(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSummary {
    pub generated_at: DateTime<Utc>,
    /// When the scores were computed; `None` before the first run.
    pub scored_at: Option<DateTime<Utc>>,
    pub latest_event_at: Option<DateTime<Utc>>,
    pub total_watersheds: usize,
    pub counts: BTreeMap<AlertLevel, usize>,
    pub top: Vec<TopWatershed>,
    pub reduced_confidence_count: usize,
    pub health: HealthRollup,
}

/// Every level present with a count, zero included.
pub fn level_counts(scores: &[WatershedScore]) -> BTreeMap<AlertLevel, usize> {
    let mut counts: BTreeMap<AlertLevel, usize> = AlertLevel::ALL.iter().map(|l| (*l, 0)).collect();
    for score in scores {
        *counts.entry(score.level).or_default() += 1;
    }
    counts
}

/// Top `n` rows. `scores` is expected in engine order (score descending).
pub fn top_n(scores: &[WatershedScore], n: usize) -> Vec<TopWatershed> {
    scores.iter().take(n).map(TopWatershed::from).collect()
}

pub fn build_summary(
    scores: &[WatershedScore],
    health: HealthRollup,
    top: usize,
    now: DateTime<Utc>,
) -> AlertSummary {
    AlertSummary {
        generated_at: now,
        scored_at: scores.iter().map(|s| s.computed_at).max(),
        latest_event_at: scores.iter().filter_map(|s| s.latest_event_at).max(),
        total_watersheds: scores.len(),
        counts: level_counts(scores),
        top: top_n(scores, top),
        reduced_confidence_count: scores.iter().filter(|s| s.reduced_confidence()).count(),
        health,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PatternMatch;

    fn score(huc8: &str, value: f64, level: AlertLevel, confidence: f64) -> WatershedScore {
        let now = Utc::now();
        WatershedScore {
            huc8: huc8.into(),
            state_abbr: None,
            region: "Mid Atlantic".into(),
            score: value,
            raw_score: value,
            adjacency_bonus: 0.0,
            pattern_bonus: 0.0,
            level,
            events: Vec::new(),
            active_patterns: vec![PatternMatch {
                id: "hypoxia-cascade".into(),
                label: "Hypoxia cascade".into(),
                bonus: 20.0,
            }],
            confidence,
            degraded_sources: Vec::new(),
            latest_event_at: Some(now),
            computed_at: now,
        }
    }

    #[test]
    fn test_summary_counts_and_top() {
        let scores = vec![
            score("02070010", 72.0, AlertLevel::Alert, 1.0),
            score("02070011", 35.0, AlertLevel::Advisory, 0.5),
            score("02070012", 12.0, AlertLevel::Watch, 1.0),
        ];
        let rollup = HealthRollup {
            total: 2,
            healthy: 1,
            degraded: 0,
            down: 1,
            stale: 1,
        };
        let summary = build_summary(&scores, rollup.clone(), 2, Utc::now());

        assert_eq!(summary.total_watersheds, 3);
        assert_eq!(summary.counts[&AlertLevel::Alert], 1);
        assert_eq!(summary.counts[&AlertLevel::None], 0);
        assert_eq!(summary.top.len(), 2);
        assert_eq!(summary.top[0].huc8, "02070010");
        assert_eq!(summary.top[0].patterns, vec!["hypoxia-cascade"]);
        assert_eq!(summary.reduced_confidence_count, 1);
        assert_eq!(summary.health, rollup);
    }

    #[test]
    fn test_empty_summary() {
        let summary = build_summary(&[], HealthRollup::default(), 10, Utc::now());
        assert_eq!(summary.total_watersheds, 0);
        assert!(summary.top.is_empty());
        assert!(summary.scored_at.is_none());
    }

    #[test]
    fn test_region_prefers_state() {
        let mut s = score("02070010", 40.0, AlertLevel::Advisory, 1.0);
        s.state_abbr = Some("MD".into());
        assert_eq!(TopWatershed::from(&s).region, "MD");
    }
}
