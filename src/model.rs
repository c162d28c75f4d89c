//! Core domain types shared by every stage of the engine.

use crate::error::{EngineError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type ParkId = i64;
pub type RideId = i64;

/// Status string reported by the upstream feed, when it reports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Operating,
    Down,
    Closed,
    Refurbishment,
}

impl RideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Operating => "OPERATING",
            RideStatus::Down => "DOWN",
            RideStatus::Closed => "CLOSED",
            RideStatus::Refurbishment => "REFURBISHMENT",
        }
    }
}

impl FromStr for RideStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OPERATING" => Ok(RideStatus::Operating),
            "DOWN" => Ok(RideStatus::Down),
            "CLOSED" => Ok(RideStatus::Closed),
            "REFURBISHMENT" => Ok(RideStatus::Refurbishment),
            other => Err(EngineError::Malformed(format!("unknown ride status '{other}'"))),
        }
    }
}

/// One periodic observation of a ride, as written by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideStatusSnapshot {
    pub ride_id: RideId,
    pub park_id: ParkId,
    pub observed_at: DateTime<Utc>,
    pub is_open: Option<bool>,
    pub wait_time: Option<i32>,
    pub status: Option<RideStatus>,
}

impl RideStatusSnapshot {
    /// Trusted open/closed state. See [`crate::transitions::computed_open`].
    pub fn computed_open(&self) -> bool {
        crate::transitions::computed_open(self.is_open, self.wait_time)
    }
}

/// Park-wide rollup of one collection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkActivitySnapshot {
    pub park_id: ParkId,
    pub observed_at: DateTime<Utc>,
    pub rides_open: u32,
    pub rides_closed: u32,
    pub avg_wait: Option<f64>,
    pub max_wait: Option<i32>,
    pub appears_open: bool,
}

impl ParkActivitySnapshot {
    /// Derives the cycle rollup from the ride snapshots of that cycle.
    ///
    /// A park appears open when at least one ride is computed-open.
    pub fn from_rides<'a>(
        park_id: ParkId,
        observed_at: DateTime<Utc>,
        rides: impl IntoIterator<Item = &'a RideStatusSnapshot>,
    ) -> Self {
        let mut rides_open = 0u32;
        let mut rides_closed = 0u32;
        let mut waits = Vec::new();

        for ride in rides {
            if ride.computed_open() {
                rides_open += 1;
                if let Some(wait) = ride.wait_time {
                    waits.push(wait);
                }
            } else {
                rides_closed += 1;
            }
        }

        let avg_wait = if waits.is_empty() {
            None
        } else {
            Some(waits.iter().map(|w| *w as f64).sum::<f64>() / waits.len() as f64)
        };

        Self {
            park_id,
            observed_at,
            rides_open,
            rides_closed,
            avg_wait,
            max_wait: waits.iter().copied().max(),
            appears_open: rides_open > 0,
        }
    }
}

/// How a park's feed reports non-operating rides (Rule 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParkType {
    /// Reports an explicit DOWN distinct from scheduled CLOSED.
    DownAware,
    /// Reports a single generic CLOSED for every non-operating ride.
    GenericClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Park {
    pub park_id: ParkId,
    pub name: String,
    /// IANA zone name, e.g. `America/Los_Angeles`.
    pub timezone: String,
    #[serde(default)]
    pub operator: String,
}

impl Park {
    pub fn tz(&self) -> Result<Tz> {
        parse_timezone(&self.timezone)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub ride_id: RideId,
    pub park_id: ParkId,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Tier assignment owned by the classification subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideTier {
    pub ride_id: RideId,
    pub tier: u8,
}

impl RideTier {
    pub fn weight(&self) -> u32 {
        tier_weight(self.tier)
    }
}

/// Tier 1 rides weigh 3, tier 2 weigh 2, tier 3 weigh 1. Unknown tiers fall
/// back to the tier-2 weight.
pub fn tier_weight(tier: u8) -> u32 {
    match tier {
        1 => 3,
        3 => 1,
        _ => 2,
    }
}

/// A ride's open/closed flip, or its first observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub ride_id: RideId,
    pub changed_at: DateTime<Utc>,
    /// `None` for the first observation of a ride.
    pub previous_open: Option<bool>,
    pub new_open: bool,
    pub wait_time: Option<i32>,
    /// Minutes spent in the previous state; `None` when there was none.
    pub previous_duration_minutes: Option<i64>,
}

impl StatusChangeEvent {
    /// True for real flips, false for the first-observation marker.
    pub fn is_flip(&self) -> bool {
        self.previous_open.is_some()
    }
}

/// One park's running window on one local calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatingSession {
    pub park_id: ParkId,
    pub local_date: NaiveDate,
    pub session_start: DateTime<Utc>,
    pub session_end: DateTime<Utc>,
    pub operating_minutes: i64,
}

impl OperatingSession {
    /// Minutes of the session falling inside `[start, end)`.
    pub fn minutes_within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        let from = self.session_start.max(start);
        let to = self.session_end.min(end);
        if to <= from { 0 } else { (to - from).num_minutes() }
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| EngineError::UnknownTimezone(name.to_string()))
}

/// Kind of entity a statistics row or failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Ride,
    Park,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Ride => write!(f, "ride"),
            EntityKind::Park => write!(f, "park"),
        }
    }
}
