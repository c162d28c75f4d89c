//! Engine configuration.
//!
//! Every field has a default, so a missing file or a partial JSON object is
//! valid:
//! ```json
//! {
//!   "attempt_offsets_minutes": [10, 70, 130],
//!   "trend_threshold_points": 5.0,
//!   "down_aware_operators": ["Disney", "Universal"],
//!   "log_level": "debug"
//! }
//! ```

use crate::error::Result;
use crate::model::ParkType;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minutes after local midnight at which each attempt becomes due.
    pub attempt_offsets_minutes: Vec<i64>,
    /// Longest span a single observation may stand for.
    pub collection_interval_minutes: i64,
    pub max_plausible_wait_minutes: i32,
    pub trend_threshold_points: f64,
    /// A run whose failed share of entities exceeds this is aborted.
    pub systemic_failure_ratio: f64,
    pub worker_concurrency: usize,
    pub lock_ttl_minutes: i64,
    pub staleness_threshold_minutes: i64,
    /// Operators whose feeds distinguish "down" from "scheduled closed".
    pub down_aware_operators: Vec<String>,
    pub default_tier: u8,
    /// Rolling JSON log; LOG_FILE_PATH overrides it.
    pub log_file: String,
    /// Base stderr level, extended by RUST_LOG.
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            attempt_offsets_minutes: vec![10, 70, 130],
            collection_interval_minutes: 10,
            max_plausible_wait_minutes: 600,
            trend_threshold_points: 5.0,
            systemic_failure_ratio: 0.5,
            worker_concurrency: 8,
            lock_ttl_minutes: 180,
            staleness_threshold_minutes: 60,
            down_aware_operators: vec!["Disney".to_string(), "Universal".to_string()],
            default_tier: 2,
            log_file: "logs/ride_downtime.log".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Loads from `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&str>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempt_offsets_minutes.len().max(1) as u32
    }

    /// Resolves the Rule-3 park type from the operator name.
    pub fn park_type_for(&self, operator: &str) -> ParkType {
        let operator = operator.to_ascii_lowercase();
        let down_aware = self
            .down_aware_operators
            .iter()
            .any(|o| operator.contains(&o.to_ascii_lowercase()));

        if down_aware {
            ParkType::DownAware
        } else {
            ParkType::GenericClosed
        }
    }
}
