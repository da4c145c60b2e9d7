//! Output module for harvest observability
//!
//! This module handles:
//! - Metrics through the `metrics` facade (counters, in-flight flush gauge,
//!   fetch durations)
//! - Advisory counters persisted to the state database
//! - Printing stored statistics

pub mod metrics;
pub mod stats;

pub use self::metrics::{install_recorder, Metrics};
pub use self::stats::{load_statistics, print_statistics, HarvestStatistics, StatsAggregator};
