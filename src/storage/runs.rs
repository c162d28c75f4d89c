use super::{Store, date_key, get_date, get_utc};
use crate::error::{EngineError, Result};
use crate::model::{EntityKind, ParkId};
use crate::scheduler::{EntityFailure, RunLogEntry, RunStatus};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension, params};

const RUN_COLUMNS: &str = "timezone, local_date, attempt, status, started_at, finished_at, \
     rides_ok, rides_failed, parks_ok, parks_failed, rejected_rows, error";

impl Store {
    pub fn insert_run(&self, run: &RunLogEntry) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO aggregation_run_log ({RUN_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                run.timezone,
                date_key(run.local_date),
                run.attempt,
                run.status.as_str(),
                run.started_at.timestamp(),
                run.finished_at.map(|t| t.timestamp()),
                run.rides_ok,
                run.rides_failed,
                run.parks_ok,
                run.parks_failed,
                run.rejected_rows,
                run.error,
            ],
        )?;
        Ok(())
    }

    /// Overwrites the mutable fields of an existing attempt row.
    pub fn update_run(&self, run: &RunLogEntry) -> Result<()> {
        self.conn().execute(
            "UPDATE aggregation_run_log SET
                status = ?4, finished_at = ?5, rides_ok = ?6, rides_failed = ?7,
                parks_ok = ?8, parks_failed = ?9, rejected_rows = ?10, error = ?11
             WHERE timezone = ?1 AND local_date = ?2 AND attempt = ?3",
            params![
                run.timezone,
                date_key(run.local_date),
                run.attempt,
                run.status.as_str(),
                run.finished_at.map(|t| t.timestamp()),
                run.rides_ok,
                run.rides_failed,
                run.parks_ok,
                run.parks_failed,
                run.rejected_rows,
                run.error,
            ],
        )?;
        Ok(())
    }

    /// The highest-numbered attempt for a timezone/date.
    pub fn latest_run(&self, timezone: &str, date: NaiveDate) -> Result<Option<RunLogEntry>> {
        latest_run_on(&self.conn(), timezone, date)
    }

    pub fn runs_for(&self, timezone: &str, date: NaiveDate) -> Result<Vec<RunLogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM aggregation_run_log
             WHERE timezone = ?1 AND local_date = ?2 ORDER BY attempt"
        ))?;
        let rows = stmt.query_map(params![timezone, date_key(date)], map_run)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .collect()
    }

    /// Latest attempt of every timezone/date on or after `since`.
    pub fn latest_runs_since(&self, since: NaiveDate) -> Result<Vec<RunLogEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM aggregation_run_log r
             WHERE local_date >= ?1 AND attempt = (
                SELECT MAX(attempt) FROM aggregation_run_log m
                WHERE m.timezone = r.timezone AND m.local_date = r.local_date)
             ORDER BY local_date, timezone"
        ))?;
        let rows = stmt.query_map(params![date_key(since)], map_run)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .collect()
    }

    pub fn record_entity_failure(&self, failure: &EntityFailure) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO entity_failures
             (timezone, local_date, attempt, entity_kind, entity_id, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                failure.timezone,
                date_key(failure.local_date),
                failure.attempt,
                failure.entity_kind.to_string(),
                failure.entity_id,
                failure.reason,
            ],
        )?;
        Ok(())
    }

    pub fn entity_failures(&self, timezone: &str, date: NaiveDate) -> Result<Vec<EntityFailure>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT timezone, local_date, attempt, entity_kind, entity_id, reason
             FROM entity_failures WHERE timezone = ?1 AND local_date = ?2
             ORDER BY attempt, entity_kind, entity_id",
        )?;
        let rows = stmt.query_map(params![timezone, date_key(date)], |row| {
            let kind: String = row.get(3)?;
            Ok(EntityFailure {
                timezone: row.get(0)?,
                local_date: get_date(row, 1)?,
                attempt: row.get(2)?,
                entity_kind: if kind == "park" { EntityKind::Park } else { EntityKind::Ride },
                entity_id: row.get(4)?,
                reason: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Takes the (timezone, date) lock unless another holder took it less
    /// than `ttl_minutes` ago.
    pub fn try_acquire_lock(
        &self,
        timezone: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
        ttl_minutes: i64,
    ) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let held: Option<i64> = tx
            .query_row(
                "SELECT acquired_at FROM aggregation_locks WHERE timezone = ?1 AND local_date = ?2",
                params![timezone, date_key(date)],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(acquired_at) = held {
            let fresh = DateTime::from_timestamp(acquired_at, 0)
                .is_some_and(|t| now - t < Duration::minutes(ttl_minutes));
            if fresh {
                return Ok(false);
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO aggregation_locks (timezone, local_date, acquired_at)
             VALUES (?1, ?2, ?3)",
            params![timezone, date_key(date), now.timestamp()],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn release_lock(&self, timezone: &str, date: NaiveDate) -> Result<()> {
        self.conn().execute(
            "DELETE FROM aggregation_locks WHERE timezone = ?1 AND local_date = ?2",
            params![timezone, date_key(date)],
        )?;
        Ok(())
    }

    /// Deletes raw ride and park snapshots of `parks` inside `[start, end)`.
    ///
    /// The latest run-log row for (timezone, date) is re-read inside the same
    /// transaction; anything other than SUCCESS refuses the delete and leaves
    /// every row in place. A successful delete marks the date as cleaned.
    /// Returns (ride rows, park rows) deleted.
    pub fn delete_raw_snapshots(
        &self,
        timezone: &str,
        date: NaiveDate,
        parks: &[ParkId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(usize, usize)> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let status = latest_run_on(&tx, timezone, date)?.map(|r| r.status);
        if status != Some(RunStatus::Success) {
            return Err(EngineError::CleanupRefused {
                timezone: timezone.to_string(),
                date: date_key(date),
                status: status.map_or("NONE".to_string(), |s| s.as_str().to_string()),
            });
        }

        let mut ride_rows = 0;
        let mut park_rows = 0;
        for park_id in parks {
            ride_rows += tx.execute(
                "DELETE FROM ride_status_snapshots
                 WHERE park_id = ?1 AND observed_at >= ?2 AND observed_at < ?3",
                params![park_id, start.timestamp(), end.timestamp()],
            )?;
            park_rows += tx.execute(
                "DELETE FROM park_activity_snapshots
                 WHERE park_id = ?1 AND observed_at >= ?2 AND observed_at < ?3",
                params![park_id, start.timestamp(), end.timestamp()],
            )?;
        }

        tx.execute(
            "INSERT OR REPLACE INTO raw_cleanups (timezone, local_date, cleaned_at, ride_rows, park_rows)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![timezone, date_key(date), Utc::now().timestamp(), ride_rows, park_rows],
        )?;
        tx.commit()?;
        Ok((ride_rows, park_rows))
    }

    /// Whether the raw snapshots of (timezone, date) were already deleted.
    pub fn raw_cleaned(&self, timezone: &str, date: NaiveDate) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM raw_cleanups WHERE timezone = ?1 AND local_date = ?2",
                params![timezone, date_key(date)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn latest_run_on(conn: &Connection, timezone: &str, date: NaiveDate) -> Result<Option<RunLogEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RUN_COLUMNS} FROM aggregation_run_log
         WHERE timezone = ?1 AND local_date = ?2 ORDER BY attempt DESC LIMIT 1"
    ))?;
    let mut rows = stmt.query_map(params![timezone, date_key(date)], map_run)?;
    rows.next().transpose()?.transpose()
}

/// Row mapping is split so an unknown status string surfaces as an engine
/// error rather than a SQLite conversion error.
fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<RunLogEntry>> {
    let status: String = row.get(3)?;
    let finished_at: Option<i64> = row.get(5)?;
    let entry = RunLogEntry {
        timezone: row.get(0)?,
        local_date: get_date(row, 1)?,
        attempt: row.get(2)?,
        status: RunStatus::Pending,
        started_at: get_utc(row, 4)?,
        finished_at: finished_at.and_then(|s| DateTime::from_timestamp(s, 0)),
        rides_ok: row.get(6)?,
        rides_failed: row.get(7)?,
        parks_ok: row.get(8)?,
        parks_failed: row.get(9)?,
        rejected_rows: row.get(10)?,
        error: row.get(11)?,
    };
    Ok(status.parse::<RunStatus>().map(|status| RunLogEntry { status, ..entry }))
}
