use crate::analyzers::timeline::ClassifiedInterval;
use crate::analyzers::types::RideStats;
use crate::analyzers::utility::{mean, percentage, round2};
use crate::classifier::{Classification, DowntimeRules};
use crate::error::{EngineError, Result};
use crate::model::{ParkId, RideId, StatusChangeEvent};
use chrono::{DateTime, Utc};

/// Identifies the ride and period a row is computed for.
#[derive(Debug, Clone)]
pub struct RideWindow<'a> {
    pub ride_id: RideId,
    pub park_id: ParkId,
    pub tier: u8,
    pub period_key: &'a str,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Session minutes inside the window; the ceiling on operating minutes.
    pub session_minutes: i64,
}

/// Computes one ride's statistics for a window of its classified timeline.
///
/// Returns `Ok(None)` when the ride never counted as up inside the window:
/// such a ride has no row for the period at all. Any broken invariant is an
/// error for this ride only.
pub fn aggregate_ride(
    window: &RideWindow<'_>,
    intervals: &[ClassifiedInterval],
    events: &[StatusChangeEvent],
    rules: &dyn DowntimeRules,
) -> Result<Option<RideStats>> {
    let observed: Vec<&ClassifiedInterval> = intervals
        .iter()
        .filter(|i| i.observed_at >= window.start && i.observed_at < window.end)
        .collect();

    let classes: Vec<Classification> = observed.iter().map(|i| i.classification).collect();
    if !rules.has_operated(&classes) {
        return Ok(None);
    }

    let mut up_secs = 0i64;
    let mut down_secs = 0i64;
    let mut longest_secs = 0i64;
    let mut run_secs = 0i64;
    let mut run_end: Option<DateTime<Utc>> = None;

    for interval in intervals {
        let secs = interval.overlap_secs(window.start, window.end);
        if secs == 0 {
            continue;
        }
        match interval.classification {
            Classification::CountsAsUp => {
                up_secs += secs;
                run_secs = 0;
                run_end = None;
            }
            Classification::CountsAsDown => {
                down_secs += secs;
                let contiguous = run_end == Some(interval.start.max(window.start));
                run_secs = if contiguous { run_secs + secs } else { secs };
                run_end = Some(interval.end.min(window.end));
                longest_secs = longest_secs.max(run_secs);
            }
            Classification::Excluded => {
                run_secs = 0;
                run_end = None;
            }
        }
    }

    let uptime_minutes = up_secs / 60;
    let downtime_minutes = down_secs / 60;
    let operating_minutes = uptime_minutes + downtime_minutes;

    let waits: Vec<i32> = observed
        .iter()
        .filter(|i| i.classification == Classification::CountsAsUp)
        .filter_map(|i| i.wait_time)
        .collect();
    let wait_values: Vec<f64> = waits.iter().map(|w| *w as f64).collect();

    let status_changes = events
        .iter()
        .filter(|e| e.is_flip() && e.changed_at >= window.start && e.changed_at < window.end)
        .count() as i64;

    let row = RideStats {
        ride_id: window.ride_id,
        park_id: window.park_id,
        period_key: window.period_key.to_string(),
        tier: window.tier,
        operating_minutes,
        uptime_minutes,
        downtime_minutes,
        uptime_percentage: percentage(uptime_minutes, operating_minutes),
        avg_wait: mean(&wait_values).map(round2),
        min_wait: waits.iter().copied().min(),
        max_wait: waits.iter().copied().max(),
        wait_samples: waits.len() as i64,
        status_changes,
        longest_downtime_minutes: longest_secs / 60,
    };

    check_ride_invariants(&row, window.session_minutes)?;
    Ok(Some(row))
}

/// Verifies the row-level invariants shared by daily, hourly and rollup rows.
pub fn check_ride_invariants(row: &RideStats, session_minutes: i64) -> Result<()> {
    let entity = format!("ride {} ({})", row.ride_id, row.period_key);

    if row.uptime_minutes < 0 || row.downtime_minutes < 0 {
        return Err(EngineError::invariant(
            entity,
            format!("negative minutes: up {} down {}", row.uptime_minutes, row.downtime_minutes),
        ));
    }
    if row.uptime_minutes + row.downtime_minutes != row.operating_minutes {
        return Err(EngineError::invariant(
            entity,
            format!(
                "up {} + down {} != operating {}",
                row.uptime_minutes, row.downtime_minutes, row.operating_minutes
            ),
        ));
    }
    if row.operating_minutes > session_minutes {
        return Err(EngineError::invariant(
            entity,
            format!("operating {} exceeds session {}", row.operating_minutes, session_minutes),
        ));
    }
    if !(0.0..=100.0).contains(&row.uptime_percentage) {
        return Err(EngineError::invariant(
            entity,
            format!("uptime percentage {} out of range", row.uptime_percentage),
        ));
    }
    if row.longest_downtime_minutes > row.downtime_minutes {
        return Err(EngineError::invariant(
            entity,
            format!(
                "longest downtime {} exceeds total {}",
                row.longest_downtime_minutes, row.downtime_minutes
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::StandardRules;
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 4, 14, 0, 0).unwrap()
    }

    fn interval(minute: i64, len: i64, classification: Classification, wait: Option<i32>) -> ClassifiedInterval {
        let start = base() + Duration::minutes(minute);
        ClassifiedInterval {
            observed_at: start,
            start,
            end: start + Duration::minutes(len),
            classification,
            wait_time: wait,
        }
    }

    fn window(key: &str, hours: i64) -> RideWindow<'_> {
        RideWindow {
            ride_id: 7,
            park_id: 1,
            tier: 1,
            period_key: key,
            start: base(),
            end: base() + Duration::hours(hours),
            session_minutes: hours * 60,
        }
    }

    #[test]
    fn test_minutes_percentage_and_longest_run() {
        use Classification::*;
        let intervals = vec![
            interval(0, 10, CountsAsUp, Some(20)),
            interval(10, 10, CountsAsDown, None),
            interval(20, 10, CountsAsDown, None),
            interval(30, 10, CountsAsUp, Some(40)),
            interval(40, 10, CountsAsDown, None),
            interval(50, 10, Excluded, None),
        ];
        let row = aggregate_ride(&window("2024-07-04", 1), &intervals, &[], &StandardRules)
            .unwrap()
            .unwrap();

        assert_eq!(row.uptime_minutes, 20);
        assert_eq!(row.downtime_minutes, 30);
        assert_eq!(row.operating_minutes, 50);
        assert_eq!(row.uptime_percentage, 40.0);
        assert_eq!(row.longest_downtime_minutes, 20);
        assert_eq!(row.avg_wait, Some(30.0));
        assert_eq!(row.min_wait, Some(20));
        assert_eq!(row.max_wait, Some(40));
        assert_eq!(row.wait_samples, 2);
    }

    #[test]
    fn test_never_up_has_no_row() {
        use Classification::*;
        let intervals = vec![interval(0, 10, CountsAsDown, None), interval(10, 10, Excluded, None)];
        assert!(aggregate_ride(&window("2024-07-04", 1), &intervals, &[], &StandardRules)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_gap_breaks_downtime_run() {
        use Classification::*;
        let intervals = vec![
            interval(0, 10, CountsAsUp, None),
            interval(10, 10, CountsAsDown, None),
            interval(40, 10, CountsAsDown, None),
        ];
        let row = aggregate_ride(&window("2024-07-04", 1), &intervals, &[], &StandardRules)
            .unwrap()
            .unwrap();
        assert_eq!(row.downtime_minutes, 20);
        assert_eq!(row.longest_downtime_minutes, 10);
    }

    #[test]
    fn test_counts_only_flips_inside_window() {
        let events = vec![
            StatusChangeEvent {
                ride_id: 7,
                changed_at: base(),
                previous_open: None,
                new_open: true,
                wait_time: None,
                previous_duration_minutes: None,
            },
            StatusChangeEvent {
                ride_id: 7,
                changed_at: base() + Duration::minutes(10),
                previous_open: Some(true),
                new_open: false,
                wait_time: None,
                previous_duration_minutes: Some(10),
            },
            StatusChangeEvent {
                ride_id: 7,
                changed_at: base() + Duration::hours(3),
                previous_open: Some(false),
                new_open: true,
                wait_time: None,
                previous_duration_minutes: Some(170),
            },
        ];
        let intervals = vec![interval(0, 10, Classification::CountsAsUp, None)];
        let row = aggregate_ride(&window("2024-07-04", 1), &intervals, &events, &StandardRules)
            .unwrap()
            .unwrap();
        assert_eq!(row.status_changes, 1);
    }

    #[test]
    fn test_operating_beyond_session_is_violation() {
        let intervals = vec![interval(0, 60, Classification::CountsAsUp, None)];
        let mut w = window("2024-07-04", 1);
        w.session_minutes = 30;
        let err = aggregate_ride(&w, &intervals, &[], &StandardRules).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation { .. }));
    }

    #[test]
    fn test_hour_window_takes_spillover() {
        use Classification::*;
        // Observation at 14:55 runs into the 15:00 hour.
        let intervals = vec![interval(55, 10, CountsAsUp, None), interval(65, 10, CountsAsUp, None)];
        let mut w = window("2024-07-04T15", 1);
        w.start = base() + Duration::hours(1);
        w.end = base() + Duration::hours(2);
        let row = aggregate_ride(&w, &intervals, &[], &StandardRules).unwrap().unwrap();
        assert_eq!(row.uptime_minutes, 15);
    }
}
