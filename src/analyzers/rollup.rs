//! Weekly, monthly and yearly statistics derived from stored daily rows.
//!
//! Rollups never look at raw snapshots, so they can be rebuilt after the
//! raw data for a day has been cleaned up.

use crate::analyzers::aggregate::check_ride_invariants;
use crate::analyzers::park::aggregate_park;
use crate::analyzers::types::{ParkStats, RideStats};
use crate::analyzers::utility::{percentage, round2};
use crate::error::{EngineError, Result};
use crate::model::{EntityKind, ParkId, RideId};
use crate::period::{Granularity, Period};
use crate::storage::Store;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Rows written and entities skipped by one rollup pass.
#[derive(Debug, Default)]
pub struct RollupReport {
    pub ride_rows: usize,
    pub park_rows: usize,
    pub failures: Vec<(EntityKind, i64, String)>,
}

impl RollupReport {
    fn absorb(&mut self, other: RollupReport) {
        self.ride_rows += other.ride_rows;
        self.park_rows += other.park_rows;
        self.failures.extend(other.failures);
    }
}

/// Combines daily rows of one ride into a single row for `period_key`.
///
/// Wait averages are weighted by each day's sample count; the longest
/// downtime is the longest single daily run.
pub fn rollup_ride(period_key: &str, daily: &[RideStats]) -> Option<RideStats> {
    let last = daily.iter().max_by(|a, b| a.period_key.cmp(&b.period_key))?;

    let uptime_minutes: i64 = daily.iter().map(|r| r.uptime_minutes).sum();
    let downtime_minutes: i64 = daily.iter().map(|r| r.downtime_minutes).sum();
    let operating_minutes = uptime_minutes + downtime_minutes;
    let wait_samples: i64 = daily.iter().filter(|r| r.avg_wait.is_some()).map(|r| r.wait_samples).sum();
    let wait_sum: f64 = daily
        .iter()
        .filter_map(|r| r.avg_wait.map(|avg| avg * r.wait_samples as f64))
        .sum();

    Some(RideStats {
        ride_id: last.ride_id,
        park_id: last.park_id,
        period_key: period_key.to_string(),
        tier: last.tier,
        operating_minutes,
        uptime_minutes,
        downtime_minutes,
        uptime_percentage: percentage(uptime_minutes, operating_minutes),
        avg_wait: if wait_samples == 0 {
            None
        } else {
            Some(round2(wait_sum / wait_samples as f64))
        },
        min_wait: daily.iter().filter_map(|r| r.min_wait).min(),
        max_wait: daily.iter().filter_map(|r| r.max_wait).max(),
        wait_samples,
        status_changes: daily.iter().map(|r| r.status_changes).sum(),
        longest_downtime_minutes: daily.iter().map(|r| r.longest_downtime_minutes).max().unwrap_or(0),
    })
}

/// Recomputes one park's ride and park rows for a rollup period.
pub fn rollup_park(store: &Store, park_id: ParkId, period: Period) -> Result<RollupReport> {
    let granularity = period.granularity();
    if !Granularity::ROLLUPS.contains(&granularity) {
        return Err(EngineError::Malformed(format!("{period} is not a rollup period")));
    }

    let (first, last) = period.date_range();
    let (from_key, to_key) = (Period::Day(first).key(), Period::Day(last).key());
    let key = period.key();

    let park_days = store.park_stats_for_park(Granularity::Day, park_id, &from_key, &to_key)?;
    let session_minutes: i64 = park_days.iter().map(|p| p.operating_minutes).sum();

    let mut by_ride: BTreeMap<RideId, Vec<RideStats>> = BTreeMap::new();
    for row in store.ride_stats_for_park(Granularity::Day, park_id, &from_key, &to_key)? {
        by_ride.entry(row.ride_id).or_default().push(row);
    }

    let mut report = RollupReport::default();
    let mut rides = Vec::with_capacity(by_ride.len());
    for (ride_id, daily) in &by_ride {
        let Some(row) = rollup_ride(&key, daily) else {
            continue;
        };
        match check_ride_invariants(&row, session_minutes) {
            Ok(()) => rides.push(row),
            Err(e) => {
                warn!(ride_id, period = %key, error = %e, "Skipping ride rollup");
                report.failures.push((EntityKind::Ride, *ride_id, e.to_string()));
            }
        }
    }

    let park: Vec<ParkStats> = match aggregate_park(park_id, &key, session_minutes, &rides) {
        Ok(row) => row.into_iter().collect(),
        Err(e) => {
            warn!(park_id, period = %key, error = %e, "Skipping park rollup");
            report.failures.push((EntityKind::Park, park_id, e.to_string()));
            Vec::new()
        }
    };

    store.replace_ride_stats(granularity, park_id, &key, &key, &rides)?;
    store.replace_park_stats(granularity, park_id, &key, &key, &park)?;

    report.ride_rows = rides.len();
    report.park_rows = park.len();
    debug!(park_id, period = %key, rides = report.ride_rows, "Rollup written");
    Ok(report)
}

/// Recomputes every rollup period that contains `date` for the given parks.
pub fn rollup_for_date(store: &Store, parks: &[ParkId], date: NaiveDate) -> Result<RollupReport> {
    let mut report = RollupReport::default();
    for granularity in Granularity::ROLLUPS {
        let period = Period::containing(granularity, date);
        for park_id in parks {
            report.absorb(rollup_park(store, *park_id, period)?);
        }
    }
    Ok(report)
}
