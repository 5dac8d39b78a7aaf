//! Adjacency spillover between neighbouring watersheds.
//!
//! When a watershed is elevated, each of its neighbours picks up
//! `adjacentHucBonus × factor(level)`. Spillover is computed from levels
//! before any adjacency is applied, so it never cascades further than one
//! hop, and every unordered pair is visited once per run.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ScoringConfig;
use crate::huc;
use crate::types::AlertLevel;

/// Undirected HUC-8 adjacency graph.
#[derive(Debug, Clone, Default)]
pub struct AdjacencyGraph {
    neighbours: BTreeMap<String, BTreeSet<String>>,
}

impl AdjacencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the configured pairs, optionally adding same-basin
    /// siblings among `known` watersheds.
    pub fn from_config<'a>(config: &ScoringConfig, known: impl IntoIterator<Item = &'a str>) -> Self {
        let mut graph = Self::new();
        for (a, b) in &config.adjacency {
            graph.connect(a, b);
        }

        if config.infer_basin_adjacency {
            let mut by_basin: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
            for code in known {
                if let Some(prefix) = huc::basin_prefix(code) {
                    by_basin.entry(prefix).or_default().push(code);
                }
            }
            for members in by_basin.values() {
                for (i, a) in members.iter().enumerate() {
                    for b in &members[i + 1..] {
                        graph.connect(a, b);
                    }
                }
            }
        }

        graph
    }

    /// Add an undirected edge. Self-loops are ignored.
    pub fn connect(&mut self, a: &str, b: &str) {
        if a == b {
            return;
        }
        self.neighbours.entry(a.to_string()).or_default().insert(b.to_string());
        self.neighbours.entry(b.to_string()).or_default().insert(a.to_string());
    }

    pub fn neighbours(&self, huc8: &str) -> impl Iterator<Item = &String> {
        self.neighbours.get(huc8).into_iter().flatten()
    }

    /// Each unordered pair exactly once, smaller code first.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.neighbours
            .iter()
            .flat_map(|(a, set)| {
                set.iter()
                    .filter(move |b| a.as_str() < b.as_str())
                    .map(move |b| (a.as_str(), b.as_str()))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbours.is_empty()
    }
}

/// Spillover bonus per watershed given each watershed's pre-adjacency level.
///
/// Watersheds with no level entry are treated as `None`. A watershed that
/// only appears through adjacency still receives its bonus.
pub fn adjacency_bonuses(
    levels: &BTreeMap<String, AlertLevel>,
    graph: &AdjacencyGraph,
    config: &ScoringConfig,
) -> BTreeMap<String, f64> {
    let mut bonuses: BTreeMap<String, f64> = BTreeMap::new();
    let level_of = |code: &str| levels.get(code).copied().unwrap_or(AlertLevel::None);

    for (a, b) in graph.pairs() {
        let (level_a, level_b) = (level_of(a), level_of(b));

        if level_b > AlertLevel::None {
            *bonuses.entry(a.to_string()).or_default() +=
                config.adjacent_huc_bonus * config.adjacency_factors.for_level(level_b);
        }
        if level_a > AlertLevel::None {
            *bonuses.entry(b.to_string()).or_default() +=
                config.adjacent_huc_bonus * config.adjacency_factors.for_level(level_a);
        }
    }

    bonuses.retain(|_, bonus| *bonus > 0.0);
    bonuses
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(entries: &[(&str, AlertLevel)]) -> BTreeMap<String, AlertLevel> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_pairs_are_unique() {
        let mut graph = AdjacencyGraph::new();
        graph.connect("02070010", "02070011");
        graph.connect("02070011", "02070010");
        graph.connect("02070010", "02070010");
        assert_eq!(graph.pairs(), vec![("02070010", "02070011")]);
    }

    #[test]
    fn test_bonus_flows_from_elevated_neighbour_only() {
        let config = ScoringConfig::default();
        let mut graph = AdjacencyGraph::new();
        graph.connect("02070010", "02070011");

        let bonuses = adjacency_bonuses(
            &levels(&[("02070010", AlertLevel::Alert), ("02070011", AlertLevel::None)]),
            &graph,
            &config,
        );
        assert_eq!(bonuses.get("02070011"), Some(&10.0));
        assert!(bonuses.get("02070010").is_none());
    }

    #[test]
    fn test_mutual_elevation_counts_each_direction_once() {
        let config = ScoringConfig::default();
        let mut graph = AdjacencyGraph::new();
        graph.connect("02070010", "02070011");

        let bonuses = adjacency_bonuses(
            &levels(&[("02070010", AlertLevel::Watch), ("02070011", AlertLevel::Advisory)]),
            &graph,
            &config,
        );
        assert_eq!(bonuses.get("02070010"), Some(&7.5));
        assert_eq!(bonuses.get("02070011"), Some(&5.0));
    }

    #[test]
    fn test_no_cascade_beyond_one_hop() {
        let config = ScoringConfig::default();
        let mut graph = AdjacencyGraph::new();
        graph.connect("02070010", "02070011");
        graph.connect("02070011", "02070012");

        let bonuses = adjacency_bonuses(
            &levels(&[("02070010", AlertLevel::Alert)]),
            &graph,
            &config,
        );
        assert!(bonuses.contains_key("02070011"));
        assert!(!bonuses.contains_key("02070012"));
    }

    #[test]
    fn test_basin_inference() {
        let mut config = ScoringConfig::default();
        config.infer_basin_adjacency = true;
        let graph = AdjacencyGraph::from_config(&config, ["02070010", "02070011", "02080001"]);
        let neighbours: Vec<&String> = graph.neighbours("02070010").collect();
        assert_eq!(neighbours, vec!["02070011"]);
        assert!(graph.neighbours("02080001").next().is_none());
    }

    #[test]
    fn test_explicit_pairs_without_inference() {
        let mut config = ScoringConfig::default();
        config.adjacency = vec![("02070010".into(), "02080001".into())];
        let graph = AdjacencyGraph::from_config(&config, ["02070010", "02070011"]);
        assert_eq!(graph.pairs(), vec![("02070010", "02080001")]);
    }
}
