//! Operations report: run outcomes and feed staleness.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::model::ParkId;
use crate::scheduler::{RunStatus, RunSummary};
use crate::storage::Store;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct StalePark {
    pub park_id: ParkId,
    pub name: String,
    pub timezone: String,
    pub last_observed_at: Option<DateTime<Utc>>,
    pub minutes_since: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    /// Latest attempt of every timezone/date in the lookback window.
    pub latest_runs: Vec<RunSummary>,
    /// Pairs that reached FAILED_TERMINAL and need an operator.
    pub terminal: Vec<RunSummary>,
    pub stale_parks: Vec<StalePark>,
    pub healthy: bool,
}

/// Builds the report as of `now`, looking back `days` local dates.
pub fn health_report(store: &Store, now: DateTime<Utc>, days: i64, config: &EngineConfig) -> Result<HealthReport> {
    let since = (now - Duration::days(days)).date_naive();
    let latest_runs: Vec<RunSummary> = store
        .latest_runs_since(since)?
        .iter()
        .map(RunSummary::from)
        .collect();
    let terminal: Vec<RunSummary> = latest_runs
        .iter()
        .filter(|r| r.status == RunStatus::FailedTerminal)
        .cloned()
        .collect();

    let threshold = Duration::minutes(config.staleness_threshold_minutes);
    let mut stale_parks = Vec::new();
    for park in store.parks()? {
        let last = store.latest_observation(park.park_id)?;
        let stale = last.is_none_or(|t| now - t > threshold);
        if stale {
            warn!(park_id = park.park_id, last_observed_at = ?last, "Park feed is stale");
            stale_parks.push(StalePark {
                park_id: park.park_id,
                name: park.name,
                timezone: park.timezone,
                last_observed_at: last,
                minutes_since: last.map(|t| (now - t).num_minutes()),
            });
        }
    }

    Ok(HealthReport {
        generated_at: now,
        healthy: terminal.is_empty() && stale_parks.is_empty(),
        latest_runs,
        terminal,
        stale_parks,
    })
}
