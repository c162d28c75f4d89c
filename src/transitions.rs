//! Status transition detection.
//!
//! This module owns the computed-open heuristic. Nothing else in the crate
//! may decide on its own whether a raw observation means "open".

use crate::model::{RideId, RideStatusSnapshot, StatusChangeEvent};
use chrono::{DateTime, Utc};

/// Trusted open/closed state of an observation.
///
/// A positive wait time means open whatever the reported flag says, because
/// the upstream feed reports closures on rides that are visibly queueing.
/// Otherwise the ride is open only when the flag explicitly says so.
pub fn computed_open(is_open: Option<bool>, wait_time: Option<i32>) -> bool {
    if wait_time.is_some_and(|w| w > 0) {
        return true;
    }
    is_open == Some(true)
}

/// Last known state of a ride before the snapshots being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorState {
    pub open: bool,
    pub since: DateTime<Utc>,
}

impl From<&StatusChangeEvent> for PriorState {
    fn from(event: &StatusChangeEvent) -> Self {
        Self {
            open: event.new_open,
            since: event.changed_at,
        }
    }
}

/// Emits an event every time the computed state differs from the last known
/// one. With no prior state the first observation emits an event with no
/// previous state and no duration.
///
/// Snapshots of other rides are skipped; the rest are processed in time
/// order, so the output depends only on the input set.
pub fn detect_transitions(
    ride_id: RideId,
    prior: Option<PriorState>,
    snapshots: &[RideStatusSnapshot],
) -> Vec<StatusChangeEvent> {
    let mut ordered: Vec<&RideStatusSnapshot> =
        snapshots.iter().filter(|s| s.ride_id == ride_id).collect();
    ordered.sort_by_key(|s| s.observed_at);

    let mut state = prior;
    let mut events = Vec::new();

    for snapshot in ordered {
        let open = snapshot.computed_open();

        let event = match state {
            Some(known) if known.open == open => continue,
            Some(known) => StatusChangeEvent {
                ride_id,
                changed_at: snapshot.observed_at,
                previous_open: Some(known.open),
                new_open: open,
                wait_time: snapshot.wait_time,
                previous_duration_minutes: Some((snapshot.observed_at - known.since).num_minutes()),
            },
            None => StatusChangeEvent {
                ride_id,
                changed_at: snapshot.observed_at,
                previous_open: None,
                new_open: open,
                wait_time: snapshot.wait_time,
                previous_duration_minutes: None,
            },
        };

        state = Some(PriorState::from(&event));
        events.push(event);
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 4, 14, 0, 0).unwrap()
    }

    fn snap(minute: i64, is_open: Option<bool>, wait: Option<i32>) -> RideStatusSnapshot {
        RideStatusSnapshot {
            ride_id: 5,
            park_id: 1,
            observed_at: base() + Duration::minutes(minute),
            is_open,
            wait_time: wait,
            status: None,
        }
    }

    #[test]
    fn test_computed_open_rules() {
        assert!(computed_open(Some(false), Some(15)));
        assert!(computed_open(None, Some(1)));
        assert!(computed_open(Some(true), Some(0)));
        assert!(computed_open(Some(true), None));
        assert!(!computed_open(Some(false), Some(0)));
        assert!(!computed_open(None, None));
        assert!(!computed_open(Some(false), Some(-5)));
    }

    #[test]
    fn test_first_observation_has_no_duration() {
        let events = detect_transitions(5, None, &[snap(0, Some(true), Some(10))]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].previous_open, None);
        assert_eq!(events[0].previous_duration_minutes, None);
        assert!(!events[0].is_flip());
    }

    #[test]
    fn test_flips_carry_previous_duration() {
        let snaps = vec![
            snap(0, Some(true), Some(20)),
            snap(10, Some(true), Some(25)),
            snap(20, Some(false), Some(0)),
            snap(30, Some(false), None),
            snap(40, Some(false), Some(5)), // wait overrides the flag
        ];
        let events = detect_transitions(5, None, &snaps);

        assert_eq!(events.len(), 3);
        assert_eq!(events[1].previous_open, Some(true));
        assert!(!events[1].new_open);
        assert_eq!(events[1].previous_duration_minutes, Some(20));
        assert!(events[2].new_open);
        assert_eq!(events[2].previous_duration_minutes, Some(20));
    }

    #[test]
    fn test_prior_state_suppresses_repeat() {
        let prior = PriorState { open: true, since: base() - Duration::hours(1) };
        let events = detect_transitions(5, Some(prior), &[snap(0, Some(true), Some(5))]);
        assert!(events.is_empty());

        let events = detect_transitions(5, Some(prior), &[snap(0, Some(false), Some(0))]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].previous_duration_minutes, Some(60));
    }

    #[test]
    fn test_unordered_input_gives_same_result() {
        let ordered = vec![
            snap(0, Some(true), None),
            snap(10, Some(false), None),
            snap(20, Some(true), None),
        ];
        let mut shuffled = ordered.clone();
        shuffled.reverse();
        assert_eq!(
            detect_transitions(5, None, &ordered),
            detect_transitions(5, None, &shuffled)
        );
    }
}
