//! Compound pattern detection.
//!
//! A pattern matches a watershed when every one of its required signal
//! types appears among the watershed's events inside the pattern's own
//! window. Repeats of a signal never count twice: each pattern matches at
//! most once per watershed per run.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::config::CompoundPattern;
use crate::types::{ChangeEvent, PatternMatch, SignalType};

/// Signal types seen within `window_hours` of `now`.
fn signals_within(events: &[ChangeEvent], window_hours: f64, now: DateTime<Utc>) -> BTreeSet<SignalType> {
    events
        .iter()
        .filter(|e| e.age_hours(now) <= window_hours)
        .map(|e| e.signal_type)
        .collect()
}

fn excludes(a: &CompoundPattern, b: &CompoundPattern) -> bool {
    a.exclusive_with.iter().any(|id| id == &b.id) || b.exclusive_with.iter().any(|id| id == &a.id)
}

/// Evaluate every pattern against one watershed's events.
///
/// Matching patterns are additive. When two matches are declared mutually
/// exclusive the higher bonus wins, ties going to the earlier declaration.
/// Results come back in declaration order.
pub fn evaluate_patterns(
    events: &[ChangeEvent],
    patterns: &[CompoundPattern],
    now: DateTime<Utc>,
) -> Vec<PatternMatch> {
    let mut matched: Vec<(usize, &CompoundPattern)> = patterns
        .iter()
        .enumerate()
        .filter(|(_, p)| {
            let present = signals_within(events, p.window_hours, now);
            p.required_signals.is_subset(&present)
        })
        .collect();

    // Highest bonus first so exclusivity keeps the stronger pattern
    matched.sort_by(|(ia, a), (ib, b)| b.bonus.total_cmp(&a.bonus).then(ia.cmp(ib)));

    let mut kept: Vec<(usize, &CompoundPattern)> = Vec::new();
    for (idx, pattern) in matched {
        if kept.iter().any(|(_, k)| excludes(k, pattern)) {
            log::debug!("Pattern {} suppressed by an exclusive match", pattern.id);
            continue;
        }
        kept.push((idx, pattern));
    }

    kept.sort_by_key(|(idx, _)| *idx);
    kept.into_iter()
        .map(|(_, p)| PatternMatch {
            id: p.id.clone(),
            label: p.label.clone(),
            bonus: p.bonus,
        })
        .collect()
}
