use super::{Store, date_key, get_date, get_utc};
use crate::error::Result;
use crate::model::{
    OperatingSession, ParkActivitySnapshot, ParkId, RideId, RideStatus, RideStatusSnapshot,
    StatusChangeEvent,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::params;

const RIDE_SNAPSHOT_COLUMNS: &str = "ride_id, park_id, observed_at, is_open, wait_time, status";

impl Store {
    /// Inserts ride snapshots; a repeated (ride, observed at) replaces the
    /// earlier row. Returns the number of rows written.
    pub fn insert_ride_snapshots(&self, snapshots: &[RideStatusSnapshot]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO ride_status_snapshots
                 (ride_id, park_id, observed_at, is_open, wait_time, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for s in snapshots {
                stmt.execute(params![
                    s.ride_id,
                    s.park_id,
                    s.observed_at.timestamp(),
                    s.is_open,
                    s.wait_time,
                    s.status.map(|st| st.as_str()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(snapshots.len())
    }

    /// Inserts collector-supplied activity, replacing any row for the same
    /// (park, observed at).
    pub fn insert_park_activity(&self, activity: &[ParkActivitySnapshot]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO park_activity_snapshots
                 (park_id, observed_at, rides_open, rides_closed, avg_wait, max_wait, appears_open)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for a in activity {
                stmt.execute(params![
                    a.park_id,
                    a.observed_at.timestamp(),
                    a.rides_open,
                    a.rides_closed,
                    a.avg_wait,
                    a.max_wait,
                    a.appears_open,
                ])?;
            }
        }
        tx.commit()?;
        Ok(activity.len())
    }

    /// Upserts activity derived from ride rows. A collector-supplied row for
    /// the same cycle is left alone. Returns the number of rows written.
    pub fn insert_derived_park_activity(&self, activity: &[ParkActivitySnapshot]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO park_activity_snapshots
                 (park_id, observed_at, rides_open, rides_closed, avg_wait, max_wait, appears_open, derived)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
                 ON CONFLICT (park_id, observed_at) DO UPDATE SET
                    rides_open = excluded.rides_open,
                    rides_closed = excluded.rides_closed,
                    avg_wait = excluded.avg_wait,
                    max_wait = excluded.max_wait,
                    appears_open = excluded.appears_open
                 WHERE park_activity_snapshots.derived = 1",
            )?;
            for a in activity {
                written += stmt.execute(params![
                    a.park_id,
                    a.observed_at.timestamp(),
                    a.rides_open,
                    a.rides_closed,
                    a.avg_wait,
                    a.max_wait,
                    a.appears_open,
                ])?;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Observations of one ride in `[start, end)`, oldest first.
    pub fn ride_snapshots(
        &self,
        ride_id: RideId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RideStatusSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RIDE_SNAPSHOT_COLUMNS} FROM ride_status_snapshots
             WHERE ride_id = ?1 AND observed_at >= ?2 AND observed_at < ?3
             ORDER BY observed_at"
        ))?;
        let rows = stmt.query_map(
            params![ride_id, start.timestamp(), end.timestamp()],
            map_ride_snapshot,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Observations of every ride of a park in `[start, end)`.
    pub fn park_ride_snapshots(
        &self,
        park_id: ParkId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RideStatusSnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RIDE_SNAPSHOT_COLUMNS} FROM ride_status_snapshots
             WHERE park_id = ?1 AND observed_at >= ?2 AND observed_at < ?3
             ORDER BY observed_at, ride_id"
        ))?;
        let rows = stmt.query_map(
            params![park_id, start.timestamp(), end.timestamp()],
            map_ride_snapshot,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn park_activity(
        &self,
        park_id: ParkId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ParkActivitySnapshot>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT park_id, observed_at, rides_open, rides_closed, avg_wait, max_wait, appears_open
             FROM park_activity_snapshots
             WHERE park_id = ?1 AND observed_at >= ?2 AND observed_at < ?3
             ORDER BY observed_at",
        )?;
        let rows = stmt.query_map(params![park_id, start.timestamp(), end.timestamp()], |row| {
            Ok(ParkActivitySnapshot {
                park_id: row.get(0)?,
                observed_at: get_utc(row, 1)?,
                rides_open: row.get(2)?,
                rides_closed: row.get(3)?,
                avg_wait: row.get(4)?,
                max_wait: row.get(5)?,
                appears_open: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent raw observation of any ride of the park.
    pub fn latest_observation(&self, park_id: ParkId) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let secs: Option<i64> = conn.query_row(
            "SELECT MAX(observed_at) FROM ride_status_snapshots WHERE park_id = ?1",
            params![park_id],
            |row| row.get(0),
        )?;
        Ok(secs.and_then(|s| DateTime::from_timestamp(s, 0)))
    }

    /// Last transition of a ride strictly before `before`.
    pub fn last_status_change_before(
        &self,
        ride_id: RideId,
        before: DateTime<Utc>,
    ) -> Result<Option<StatusChangeEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ride_id, changed_at, previous_open, new_open, wait_time, previous_duration_minutes
             FROM status_changes WHERE ride_id = ?1 AND changed_at < ?2
             ORDER BY changed_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query_map(params![ride_id, before.timestamp()], map_status_change)?;
        Ok(rows.next().transpose()?)
    }

    pub fn status_changes(
        &self,
        ride_id: RideId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StatusChangeEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ride_id, changed_at, previous_open, new_open, wait_time, previous_duration_minutes
             FROM status_changes WHERE ride_id = ?1 AND changed_at >= ?2 AND changed_at < ?3
             ORDER BY changed_at",
        )?;
        let rows = stmt.query_map(
            params![ride_id, start.timestamp(), end.timestamp()],
            map_status_change,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn session(&self, park_id: ParkId, date: NaiveDate) -> Result<Option<OperatingSession>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT park_id, local_date, session_start, session_end, operating_minutes
             FROM operating_sessions WHERE park_id = ?1 AND local_date = ?2",
        )?;
        let mut rows = stmt.query_map(params![park_id, date_key(date)], |row| {
            Ok(OperatingSession {
                park_id: row.get(0)?,
                local_date: get_date(row, 1)?,
                session_start: get_utc(row, 2)?,
                session_end: get_utc(row, 3)?,
                operating_minutes: row.get(4)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }
}

pub(super) fn insert_session(tx: &rusqlite::Transaction<'_>, s: &OperatingSession) -> Result<()> {
    tx.execute(
        "INSERT INTO operating_sessions
         (park_id, local_date, session_start, session_end, operating_minutes)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(park_id, local_date) DO UPDATE SET
            session_start = excluded.session_start,
            session_end = excluded.session_end,
            operating_minutes = excluded.operating_minutes",
        params![
            s.park_id,
            date_key(s.local_date),
            s.session_start.timestamp(),
            s.session_end.timestamp(),
            s.operating_minutes,
        ],
    )?;
    Ok(())
}

/// Replaces a ride's transitions inside `[start, end)` with `events`.
pub(super) fn replace_status_changes(
    tx: &rusqlite::Transaction<'_>,
    ride_id: RideId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    events: &[StatusChangeEvent],
) -> Result<()> {
    tx.execute(
        "DELETE FROM status_changes WHERE ride_id = ?1 AND changed_at >= ?2 AND changed_at < ?3",
        params![ride_id, start.timestamp(), end.timestamp()],
    )?;
    let mut stmt = tx.prepare(
        "INSERT OR REPLACE INTO status_changes
         (ride_id, changed_at, previous_open, new_open, wait_time, previous_duration_minutes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for e in events {
        stmt.execute(params![
            e.ride_id,
            e.changed_at.timestamp(),
            e.previous_open,
            e.new_open,
            e.wait_time,
            e.previous_duration_minutes,
        ])?;
    }
    Ok(())
}

fn map_ride_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<RideStatusSnapshot> {
    let status: Option<String> = row.get(5)?;
    Ok(RideStatusSnapshot {
        ride_id: row.get(0)?,
        park_id: row.get(1)?,
        observed_at: get_utc(row, 2)?,
        is_open: row.get(3)?,
        wait_time: row.get(4)?,
        // Unknown status strings were rejected at ingest.
        status: status.and_then(|s| s.parse::<RideStatus>().ok()),
    })
}

fn map_status_change(row: &rusqlite::Row<'_>) -> rusqlite::Result<StatusChangeEvent> {
    Ok(StatusChangeEvent {
        ride_id: row.get(0)?,
        changed_at: get_utc(row, 1)?,
        previous_open: row.get(2)?,
        new_open: row.get(3)?,
        wait_time: row.get(4)?,
        previous_duration_minutes: row.get(5)?,
    })
}
