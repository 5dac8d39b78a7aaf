//! Watershed alert scoring and escalation engine.
//!
//! Ingestion collaborators report [`types::ChangeEvent`]s and source health;
//! a periodic trigger scores every watershed, escalates newly elevated ones
//! to the narrative service and reports the run.

pub mod config;
pub mod error;
pub mod escalation;
pub mod event_queue;
pub mod health;
pub mod huc;
mod migrations;
pub mod scheduler;
pub mod server;
pub mod signals;
pub mod store;
pub mod summary;
pub mod types;
