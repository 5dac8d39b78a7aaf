//! Watershed scoring: freshness decay, compound patterns, adjacency
//! spillover, and the engine that combines them.
//!
//! Everything in here is a pure function of a queue snapshot, a health
//! snapshot, the scoring config and a reference instant.

pub mod decay;
pub mod patterns;
pub mod propagation;
pub mod scoring;

pub use scoring::ScoringEngine;
