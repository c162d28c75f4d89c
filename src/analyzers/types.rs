//! Statistics rows produced by the aggregation engine.

use crate::model::{OperatingSession, ParkId, RideId, StatusChangeEvent};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Permanent per-ride statistics for one period.
///
/// `uptime_minutes + downtime_minutes == operating_minutes` always holds;
/// rows for rides that never operated in the period are never written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideStats {
    pub ride_id: RideId,
    pub park_id: ParkId,
    pub period_key: String,
    pub tier: u8,
    pub operating_minutes: i64,
    pub uptime_minutes: i64,
    pub downtime_minutes: i64,
    pub uptime_percentage: f64,
    pub avg_wait: Option<f64>,
    pub min_wait: Option<i32>,
    pub max_wait: Option<i32>,
    /// Number of up samples behind the wait figures.
    pub wait_samples: i64,
    pub status_changes: i64,
    pub longest_downtime_minutes: i64,
}

impl RideStats {
    pub fn downtime_hours(&self) -> f64 {
        self.downtime_minutes as f64 / 60.0
    }
}

/// Permanent per-park statistics for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkStats {
    pub park_id: ParkId,
    pub period_key: String,
    pub operating_minutes: i64,
    pub rides_tracked: i64,
    pub rides_with_downtime: i64,
    pub total_downtime_hours: f64,
    pub weighted_downtime_hours: f64,
    pub total_tier_weight: i64,
    /// Tier-weighted downtime hours per unit of tracked weight. Lower is better.
    pub shame_score: f64,
    pub tier1_rides: i64,
    pub tier2_rides: i64,
    pub tier3_rides: i64,
    pub best_ride_id: Option<RideId>,
    pub worst_ride_id: Option<RideId>,
    pub avg_uptime_percentage: f64,
    pub avg_wait: Option<f64>,
    pub max_wait: Option<i32>,
}

/// Everything one park contributes to a daily run, written atomically.
///
/// Rows previously stored for the park and day are replaced, so a ride that
/// no longer qualifies on recompute disappears instead of lingering.
#[derive(Debug, Clone)]
pub struct ParkDayOutput {
    pub park_id: ParkId,
    pub local_date: NaiveDate,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub session: Option<OperatingSession>,
    pub status_changes: Vec<(RideId, Vec<StatusChangeEvent>)>,
    pub ride_daily: Vec<RideStats>,
    pub ride_hourly: Vec<RideStats>,
    pub park_daily: Option<ParkStats>,
    pub park_hourly: Vec<ParkStats>,
}
