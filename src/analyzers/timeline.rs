//! Turns one ride's raw observations into classified time intervals.
//!
//! Each observation stands for the time until the ride's next observation,
//! capped at one collection interval so gaps in coverage are never filled,
//! and clipped to the park's operating session.

use crate::classifier::{Classification, DowntimeRules, ParkState};
use crate::config::EngineConfig;
use crate::model::{OperatingSession, ParkType, RideId, RideStatusSnapshot};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedInterval {
    pub observed_at: DateTime<Utc>,
    /// Span the observation accounts for, inside the session. May be empty.
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub classification: Classification,
    pub wait_time: Option<i32>,
}

impl ClassifiedInterval {
    /// Seconds of this interval falling inside `[from, to)`.
    pub fn overlap_secs(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
        let start = self.start.max(from);
        let end = self.end.min(to);
        if end <= start { 0 } else { (end - start).num_seconds() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RideTimeline {
    pub intervals: Vec<ClassifiedInterval>,
    /// Observations dropped as implausible.
    pub rejected: usize,
}

/// Why an observation cannot be classified, if it cannot.
pub fn implausibility(snapshot: &RideStatusSnapshot, max_wait: i32) -> Option<String> {
    match snapshot.wait_time {
        Some(w) if w < 0 => Some(format!("negative wait time {w}")),
        Some(w) if w > max_wait => Some(format!("wait time {w} exceeds {max_wait}")),
        _ => None,
    }
}

/// State of the activity cycle closest to `at`, if one lies within
/// `tolerance`. Ride and activity rows of one cycle need not share a
/// timestamp to the second.
fn park_state_near(
    park_states: &BTreeMap<DateTime<Utc>, ParkState>,
    at: DateTime<Utc>,
    tolerance: Duration,
) -> Option<ParkState> {
    let before = park_states.range(..=at).next_back();
    let after = park_states.range(at..).next();
    [before, after]
        .into_iter()
        .flatten()
        .map(|(t, state)| ((*t - at).abs(), *state))
        .filter(|(gap, _)| *gap <= tolerance)
        .min_by_key(|(gap, _)| *gap)
        .map(|(_, state)| state)
}

/// Builds the classified timeline of one ride.
///
/// Observations with no park activity cycle within half a collection
/// interval are taken as seen while the park showed no activity. With no session every observation is
/// excluded and the timeline is empty.
pub fn build_timeline(
    ride_id: RideId,
    snapshots: &[RideStatusSnapshot],
    park_states: &BTreeMap<DateTime<Utc>, ParkState>,
    session: Option<&OperatingSession>,
    park_type: ParkType,
    rules: &dyn DowntimeRules,
    config: &EngineConfig,
) -> RideTimeline {
    let mut timeline = RideTimeline::default();

    let mut valid: Vec<&RideStatusSnapshot> = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots.iter().filter(|s| s.ride_id == ride_id) {
        match implausibility(snapshot, config.max_plausible_wait_minutes) {
            Some(reason) => {
                warn!(
                    ride_id,
                    observed_at = %snapshot.observed_at,
                    reason = %reason,
                    "Excluding implausible observation"
                );
                timeline.rejected += 1;
            }
            None => valid.push(snapshot),
        }
    }
    valid.sort_by_key(|s| s.observed_at);

    let Some(session) = session else {
        return timeline;
    };

    let step = Duration::minutes(config.collection_interval_minutes);
    let tolerance = step / 2;
    let idle = ParkState { appears_open: false };

    for (i, snapshot) in valid.iter().enumerate() {
        let observed_at = snapshot.observed_at;
        if observed_at + tolerance < session.session_start || observed_at > session.session_end {
            continue;
        }

        let capped = observed_at + step;
        let natural_end = valid
            .get(i + 1)
            .map_or(capped, |next| next.observed_at.min(capped));
        let start = observed_at.max(session.session_start);
        let end = natural_end.min(session.session_end).max(start);

        let park = park_state_near(park_states, observed_at, tolerance).unwrap_or(idle);

        timeline.intervals.push(ClassifiedInterval {
            observed_at,
            start,
            end,
            classification: rules.classify(snapshot, park, park_type),
            wait_time: snapshot.wait_time,
        });
    }

    timeline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::StandardRules;
    use chrono::{NaiveDate, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 4, 14, 0, 0).unwrap()
    }

    fn snap(minute: i64, wait: Option<i32>, is_open: bool) -> RideStatusSnapshot {
        RideStatusSnapshot {
            ride_id: 7,
            park_id: 1,
            observed_at: base() + Duration::minutes(minute),
            is_open: Some(is_open),
            wait_time: wait,
            status: None,
        }
    }

    fn session(minutes: i64) -> OperatingSession {
        OperatingSession {
            park_id: 1,
            local_date: NaiveDate::from_ymd_opt(2024, 7, 4).unwrap(),
            session_start: base(),
            session_end: base() + Duration::minutes(minutes),
            operating_minutes: minutes,
        }
    }

    fn all_open(minutes: &[i64]) -> BTreeMap<DateTime<Utc>, ParkState> {
        minutes
            .iter()
            .map(|m| (base() + Duration::minutes(*m), ParkState { appears_open: true }))
            .collect()
    }

    #[test]
    fn test_intervals_capped_and_clipped() {
        let snaps = vec![snap(0, Some(10), true), snap(10, None, false), snap(40, Some(5), true)];
        let states = all_open(&[0, 10, 40]);
        let s = session(45);
        let timeline = build_timeline(7, &snaps, &states, Some(&s), ParkType::GenericClosed, &StandardRules, &EngineConfig::default());

        let spans: Vec<i64> = timeline.intervals.iter().map(|i| (i.end - i.start).num_minutes()).collect();
        // 0..10, 10..20 (gap to 40 not filled), 40..45 (session end)
        assert_eq!(spans, vec![10, 10, 5]);
        assert_eq!(timeline.intervals[1].classification, Classification::CountsAsDown);
    }

    #[test]
    fn test_implausible_rows_rejected() {
        let snaps = vec![snap(0, Some(10), true), snap(10, Some(5000), true), snap(20, Some(-3), false)];
        let states = all_open(&[0, 10, 20]);
        let s = session(60);
        let timeline = build_timeline(7, &snaps, &states, Some(&s), ParkType::GenericClosed, &StandardRules, &EngineConfig::default());
        assert_eq!(timeline.rejected, 2);
        assert_eq!(timeline.intervals.len(), 1);
    }

    #[test]
    fn test_missing_park_activity_excludes() {
        let snaps = vec![snap(0, None, false), snap(10, None, false)];
        let states = all_open(&[0]);
        let s = session(60);
        let timeline = build_timeline(7, &snaps, &states, Some(&s), ParkType::GenericClosed, &StandardRules, &EngineConfig::default());
        assert_eq!(timeline.intervals[0].classification, Classification::CountsAsDown);
        assert_eq!(timeline.intervals[1].classification, Classification::Excluded);
    }

    #[test]
    fn test_activity_a_few_seconds_off_still_matches() {
        let snaps = vec![snap(0, Some(10), true), snap(10, None, false), snap(20, Some(5), true)];
        let states: BTreeMap<DateTime<Utc>, ParkState> = [0, 10, 20]
            .iter()
            .map(|m| (base() + Duration::minutes(*m) + Duration::seconds(7), ParkState { appears_open: true }))
            .collect();
        let s = OperatingSession {
            session_start: base() + Duration::seconds(7),
            session_end: base() + Duration::minutes(30) + Duration::seconds(7),
            ..session(30)
        };
        let timeline = build_timeline(7, &snaps, &states, Some(&s), ParkType::GenericClosed, &StandardRules, &EngineConfig::default());

        let classes: Vec<Classification> = timeline.intervals.iter().map(|i| i.classification).collect();
        assert_eq!(
            classes,
            vec![Classification::CountsAsUp, Classification::CountsAsDown, Classification::CountsAsUp]
        );
        // The first cycle starts at the session start, seven seconds late.
        assert_eq!(timeline.intervals[0].start, s.session_start);
        assert_eq!((timeline.intervals[0].end - timeline.intervals[0].start).num_seconds(), 593);
    }

    #[test]
    fn test_no_session_yields_empty_timeline() {
        let snaps = vec![snap(0, Some(10), true)];
        let timeline = build_timeline(7, &snaps, &all_open(&[0]), None, ParkType::DownAware, &StandardRules, &EngineConfig::default());
        assert!(timeline.intervals.is_empty());
    }

    #[test]
    fn test_overlap_secs() {
        let interval = ClassifiedInterval {
            observed_at: base(),
            start: base(),
            end: base() + Duration::minutes(10),
            classification: Classification::CountsAsUp,
            wait_time: None,
        };
        assert_eq!(interval.overlap_secs(base() + Duration::minutes(5), base() + Duration::hours(1)), 300);
        assert_eq!(interval.overlap_secs(base() + Duration::hours(1), base() + Duration::hours(2)), 0);
    }
}
