//! Operating session detection.
//!
//! A park's session for a local calendar day runs from its first to its
//! last "appears open" cycle on that day. Days are cut at the park's own
//! local midnight, so late-night activity splits into two sessions.

use crate::model::{OperatingSession, ParkActivitySnapshot, ParkId};
use crate::period::local_date;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::BTreeMap;

/// Returns one session per local date that has at least one open cycle,
/// ordered by date. Snapshots of other parks are ignored.
pub fn detect_sessions(
    park_id: ParkId,
    tz: Tz,
    activity: &[ParkActivitySnapshot],
) -> Vec<OperatingSession> {
    let mut windows: BTreeMap<NaiveDate, (DateTime<Utc>, DateTime<Utc>)> = BTreeMap::new();

    for snapshot in activity {
        if snapshot.park_id != park_id || !snapshot.appears_open {
            continue;
        }

        let date = local_date(tz, snapshot.observed_at);
        windows
            .entry(date)
            .and_modify(|(start, end)| {
                *start = (*start).min(snapshot.observed_at);
                *end = (*end).max(snapshot.observed_at);
            })
            .or_insert((snapshot.observed_at, snapshot.observed_at));
    }

    windows
        .into_iter()
        .map(|(local_date, (session_start, session_end))| OperatingSession {
            park_id,
            local_date,
            session_start,
            session_end,
            operating_minutes: (session_end - session_start).num_minutes(),
        })
        .collect()
}

/// Session for a single local date, or `None` when the park never appeared
/// open that day.
pub fn detect_session(
    park_id: ParkId,
    tz: Tz,
    date: NaiveDate,
    activity: &[ParkActivitySnapshot],
) -> Option<OperatingSession> {
    detect_sessions(park_id, tz, activity)
        .into_iter()
        .find(|s| s.local_date == date)
}
