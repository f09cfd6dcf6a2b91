//! Brine Data - in-memory aggregation stores
//!
//! The write path of the pipeline: the data merger consumes canonical
//! event records and maintains
//! - the metrics store (`brine-metrics`),
//! - the per-minion store (`minion`),
//! - the per-state-job stores (`state`),
//! - the label-cardinality merger bounding sls/sid label growth (`merge`).

pub mod merge;
pub mod merger;
pub mod minion;
pub mod state;

pub use merge::SmartMerger;
pub use merger::{DataMerger, MergerOptions};
pub use minion::MinionsCollection;
pub use state::{JobStatus, StateJobCollection};

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
