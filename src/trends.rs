//! Period-over-period uptime movers.

use crate::analyzers::utility::round2;
use crate::error::Result;
use crate::period::{Granularity, Period};
use crate::storage::Store;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendEntry {
    pub entity_id: i64,
    pub current: f64,
    pub previous: f64,
    /// `current - previous`, in percentage points.
    pub delta: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendSet {
    pub improved: Vec<TrendEntry>,
    pub declined: Vec<TrendEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendReport {
    pub granularity: Granularity,
    pub period_key: String,
    pub previous_key: String,
    pub parks: TrendSet,
    pub rides: TrendSet,
}

/// Splits entities into improved and declined by uptime delta.
///
/// Only moves of at least `threshold` points are kept. Entities missing
/// from `previous` are skipped. Each set is ordered by `|delta|`
/// descending, then by entity id.
pub fn compute_trends(current: &[(i64, f64)], previous: &[(i64, f64)], threshold: f64) -> TrendSet {
    let previous: HashMap<i64, f64> = previous.iter().copied().collect();
    let mut set = TrendSet::default();

    for (entity_id, now) in current {
        let Some(before) = previous.get(entity_id) else {
            continue;
        };
        let delta = round2(now - before);
        if delta.abs() < threshold {
            continue;
        }
        let entry = TrendEntry {
            entity_id: *entity_id,
            current: *now,
            previous: *before,
            delta,
        };
        if delta > 0.0 {
            set.improved.push(entry);
        } else {
            set.declined.push(entry);
        }
    }

    for entries in [&mut set.improved, &mut set.declined] {
        entries.sort_by(|a, b| {
            b.delta
                .abs()
                .total_cmp(&a.delta.abs())
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
    }
    set
}

/// Park and ride trends of `period` against the period before it.
pub fn trends_for(store: &Store, period: Period, threshold: f64) -> Result<TrendReport> {
    let granularity = period.granularity();
    let previous = period.previous();
    let (key, previous_key) = (period.key(), previous.key());

    let park_uptime = |key: &str| -> Result<Vec<(i64, f64)>> {
        Ok(store
            .park_stats(granularity, key)?
            .iter()
            .map(|p| (p.park_id, p.avg_uptime_percentage))
            .collect())
    };
    let ride_uptime = |key: &str| -> Result<Vec<(i64, f64)>> {
        Ok(store
            .ride_stats(granularity, key)?
            .iter()
            .map(|r| (r.ride_id, r.uptime_percentage))
            .collect())
    };

    Ok(TrendReport {
        granularity,
        parks: compute_trends(&park_uptime(&key)?, &park_uptime(&previous_key)?, threshold),
        rides: compute_trends(&ride_uptime(&key)?, &ride_uptime(&previous_key)?, threshold),
        period_key: key,
        previous_key,
    })
}
