//! Watershed scoring engine.
//!
//! `score = Σ base(signal) × freshness(age) + adjacency spillover + Σ pattern bonuses`,
//! then classified against the threshold table. Scoring reads immutable
//! snapshots and mutates nothing shared.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use super::decay;
use super::patterns;
use super::propagation::{self, AdjacencyGraph};
use crate::config::ScoringConfig;
use crate::huc;
use crate::types::{AlertLevel, ChangeEvent, PatternMatch, SentinelHealth, SourceStatus, WatershedScore};

/// Per-watershed intermediate before adjacency is known.
struct LocalScore<'a> {
    events: Vec<&'a ChangeEvent>,
    raw_score: f64,
    healthy_score: f64,
    patterns: Vec<PatternMatch>,
    degraded_sources: BTreeSet<String>,
}

impl LocalScore<'_> {
    fn pattern_bonus(&self) -> f64 {
        self.patterns.iter().map(|p| p.bonus).sum()
    }
}

pub struct ScoringEngine {
    config: ScoringConfig,
}

impl ScoringEngine {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score every watershed that has an active event or receives spillover.
    ///
    /// Sorted by score descending; ties go to the watershed with the most
    /// recent event, then to the lower HUC code.
    pub fn score_all_watersheds(
        &self,
        events: &BTreeMap<String, Vec<ChangeEvent>>,
        health: &HashMap<String, SentinelHealth>,
        now: DateTime<Utc>,
    ) -> Vec<WatershedScore> {
        let locals: BTreeMap<&str, LocalScore> = events
            .iter()
            .filter_map(|(huc8, list)| {
                let local = self.score_local(list, health, now);
                if local.events.is_empty() {
                    None
                } else {
                    Some((huc8.as_str(), local))
                }
            })
            .collect();

        let pre_levels: BTreeMap<String, AlertLevel> = locals
            .iter()
            .map(|(huc8, local)| {
                let level = self.config.alert_level(local.raw_score + local.pattern_bonus());
                (huc8.to_string(), level)
            })
            .collect();

        let graph = AdjacencyGraph::from_config(&self.config, locals.keys().copied());
        let bonuses = propagation::adjacency_bonuses(&pre_levels, &graph, &self.config);

        let codes: BTreeSet<&str> = locals
            .keys()
            .copied()
            .chain(bonuses.keys().map(|k| k.as_str()))
            .collect();

        let mut scores: Vec<WatershedScore> = codes
            .into_iter()
            .map(|huc8| {
                let adjacency_bonus = bonuses.get(huc8).copied().unwrap_or(0.0);
                match locals.get(huc8) {
                    Some(local) => self.finish(huc8, local, adjacency_bonus, now),
                    None => self.spillover_only(huc8, adjacency_bonus, now),
                }
            })
            .collect();

        scores.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.latest_event_at.cmp(&a.latest_event_at))
                .then_with(|| a.huc8.cmp(&b.huc8))
        });
        scores
    }

    fn score_local<'a>(
        &self,
        list: &'a [ChangeEvent],
        health: &HashMap<String, SentinelHealth>,
        now: DateTime<Utc>,
    ) -> LocalScore<'a> {
        let window = self.config.event_window_hours;
        let mut events: Vec<&ChangeEvent> = list.iter().filter(|e| e.age_hours(now) <= window).collect();
        events.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));

        let mut raw_score = 0.0;
        let mut healthy_score = 0.0;
        let mut degraded_sources = BTreeSet::new();

        for event in &events {
            let contribution = decay::event_contribution(
                self.config.base_score(event.signal_type),
                event.age_hours(now),
                window,
                &self.config.freshness,
            );
            raw_score += contribution;

            let status = health
                .get(&event.source_id)
                .map(|h| h.status)
                .unwrap_or(SourceStatus::Healthy);
            if status == SourceStatus::Healthy {
                healthy_score += contribution;
            } else {
                degraded_sources.insert(event.source_id.clone());
            }
        }

        let owned: Vec<ChangeEvent> = events.iter().map(|e| (*e).clone()).collect();
        let patterns = patterns::evaluate_patterns(&owned, &self.config.compound_patterns, now);

        LocalScore {
            events,
            raw_score,
            healthy_score,
            patterns,
            degraded_sources,
        }
    }

    fn finish(&self, huc8: &str, local: &LocalScore, adjacency_bonus: f64, now: DateTime<Utc>) -> WatershedScore {
        let pattern_bonus = local.pattern_bonus();
        let score = local.raw_score + adjacency_bonus + pattern_bonus;
        let confidence = if local.raw_score > 0.0 {
            (local.healthy_score / local.raw_score).clamp(0.0, 1.0)
        } else if local.degraded_sources.is_empty() {
            1.0
        } else {
            0.0
        };

        WatershedScore {
            huc8: huc8.to_string(),
            state_abbr: self.config.watershed_states.get(huc8).cloned(),
            region: huc::region_name(huc8).to_string(),
            score,
            raw_score: local.raw_score,
            adjacency_bonus,
            pattern_bonus,
            level: self.config.alert_level(score),
            events: local.events.iter().map(|e| (*e).clone()).collect(),
            active_patterns: local.patterns.clone(),
            confidence,
            degraded_sources: local.degraded_sources.iter().cloned().collect(),
            latest_event_at: local.events.first().map(|e| e.detected_at),
            computed_at: now,
        }
    }

    fn spillover_only(&self, huc8: &str, adjacency_bonus: f64, now: DateTime<Utc>) -> WatershedScore {
        WatershedScore {
            huc8: huc8.to_string(),
            state_abbr: self.config.watershed_states.get(huc8).cloned(),
            region: huc::region_name(huc8).to_string(),
            score: adjacency_bonus,
            raw_score: 0.0,
            adjacency_bonus,
            pattern_bonus: 0.0,
            level: self.config.alert_level(adjacency_bonus),
            events: Vec::new(),
            active_patterns: Vec::new(),
            confidence: 1.0,
            degraded_sources: Vec::new(),
            latest_event_at: None,
            computed_at: now,
        }
    }
}
