//! Temporal decay for event weighting (pure math, no IO).

use crate::config::FreshnessConfig;

/// Weight of an event by age: exponential half-life decay that settles on a
/// floor instead of zero.
///
/// `floor + (1 - floor) * 2^(-age / half_life)`
///
/// Bounded in `(floor, 1]` for any non-negative age, and monotonically
/// non-increasing. Negative ages (clock skew) count as fresh.
pub fn freshness_multiplier(age_hours: f64, freshness: &FreshnessConfig) -> f64 {
    let floor = freshness.floor.clamp(f64::MIN_POSITIVE, 1.0);
    if freshness.half_life_hours <= 0.0 || age_hours <= 0.0 {
        return 1.0;
    }
    floor + (1.0 - floor) * (2.0_f64).powf(-age_hours / freshness.half_life_hours)
}

/// Contribution of one event: base score times freshness, or zero once the
/// event has aged out of the window.
pub fn event_contribution(
    base_score: f64,
    age_hours: f64,
    window_hours: f64,
    freshness: &FreshnessConfig,
) -> f64 {
    if age_hours > window_hours {
        return 0.0;
    }
    base_score * freshness_multiplier(age_hours, freshness)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve() -> FreshnessConfig {
        FreshnessConfig {
            half_life_hours: 12.0,
            floor: 0.1,
        }
    }

    #[test]
    fn test_zero_age_full_weight() {
        assert_eq!(freshness_multiplier(0.0, &curve()), 1.0);
    }

    #[test]
    fn test_half_life_midpoint() {
        let result = freshness_multiplier(12.0, &curve());
        assert!((result - 0.55).abs() < 1e-9, "expected 0.55, got {}", result);
    }

    #[test]
    fn test_window_edge_approaches_floor() {
        let result = freshness_multiplier(72.0, &curve());
        assert!(result > 0.1, "never reaches the floor exactly, got {}", result);
        assert!(result < 0.12, "should be near the floor, got {}", result);
    }

    #[test]
    fn test_monotonic_non_increasing() {
        let mut previous = f64::INFINITY;
        for age in 0..=96 {
            let weight = freshness_multiplier(age as f64, &curve());
            assert!(weight <= previous, "weight rose at age {}", age);
            assert!(weight > 0.0 && weight <= 1.0);
            previous = weight;
        }
    }

    #[test]
    fn test_negative_age_is_fresh() {
        assert_eq!(freshness_multiplier(-3.0, &curve()), 1.0);
    }

    #[test]
    fn test_contribution_zero_outside_window() {
        assert_eq!(event_contribution(15.0, 72.5, 72.0, &curve()), 0.0);
        assert!(event_contribution(15.0, 71.9, 72.0, &curve()) > 0.0);
    }

    #[test]
    fn test_older_event_contributes_less() {
        let newer = event_contribution(15.0, 1.0, 72.0, &curve());
        let older = event_contribution(15.0, 30.0, 72.0, &curve());
        assert!(older <= newer);
    }
}
