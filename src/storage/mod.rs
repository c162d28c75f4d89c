//! SQLite persistence for raw observations, sessions, statistics and the
//! aggregation run log.
//!
//! Tables mirror the logical layout: raw rows keyed by (entity, observed
//! at), transitions by (ride, change time), sessions by (park, local date),
//! one stats table per granularity keyed by (entity, period key), and the
//! run log keyed by (timezone, local date, attempt). Timestamps are stored
//! as UTC epoch seconds; local dates as `YYYY-MM-DD` text.

mod catalog;
mod runs;
mod snapshots;
mod stats;

use crate::error::Result;
use crate::period::Granularity;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if needed) the database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        for granularity in Granularity::ALL {
            conn.execute_batch(&ride_stats_ddl(granularity))?;
            conn.execute_batch(&park_stats_ddl(granularity))?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave SQLite half-written:
        // every multi-statement write runs in a transaction.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS parks (
    park_id   INTEGER PRIMARY KEY,
    name      TEXT NOT NULL,
    timezone  TEXT NOT NULL,
    operator  TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS rides (
    ride_id  INTEGER PRIMARY KEY,
    park_id  INTEGER NOT NULL,
    name     TEXT NOT NULL,
    active   INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS ride_tiers (
    ride_id  INTEGER PRIMARY KEY,
    tier     INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS ride_status_snapshots (
    ride_id      INTEGER NOT NULL,
    park_id      INTEGER NOT NULL,
    observed_at  INTEGER NOT NULL,
    is_open      INTEGER,
    wait_time    INTEGER,
    status       TEXT,
    PRIMARY KEY (ride_id, observed_at)
);
CREATE INDEX IF NOT EXISTS idx_ride_snapshots_park
    ON ride_status_snapshots (park_id, observed_at);
CREATE TABLE IF NOT EXISTS park_activity_snapshots (
    park_id       INTEGER NOT NULL,
    observed_at   INTEGER NOT NULL,
    rides_open    INTEGER NOT NULL,
    rides_closed  INTEGER NOT NULL,
    avg_wait      REAL,
    max_wait      INTEGER,
    appears_open  INTEGER NOT NULL,
    derived       INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (park_id, observed_at)
);
CREATE TABLE IF NOT EXISTS status_changes (
    ride_id                    INTEGER NOT NULL,
    changed_at                 INTEGER NOT NULL,
    previous_open              INTEGER,
    new_open                   INTEGER NOT NULL,
    wait_time                  INTEGER,
    previous_duration_minutes  INTEGER,
    PRIMARY KEY (ride_id, changed_at)
);
CREATE TABLE IF NOT EXISTS operating_sessions (
    park_id            INTEGER NOT NULL,
    local_date         TEXT NOT NULL,
    session_start      INTEGER NOT NULL,
    session_end        INTEGER NOT NULL,
    operating_minutes  INTEGER NOT NULL,
    PRIMARY KEY (park_id, local_date)
);
CREATE TABLE IF NOT EXISTS aggregation_run_log (
    timezone        TEXT NOT NULL,
    local_date      TEXT NOT NULL,
    attempt         INTEGER NOT NULL,
    status          TEXT NOT NULL,
    started_at      INTEGER NOT NULL,
    finished_at     INTEGER,
    rides_ok        INTEGER NOT NULL DEFAULT 0,
    rides_failed    INTEGER NOT NULL DEFAULT 0,
    parks_ok        INTEGER NOT NULL DEFAULT 0,
    parks_failed    INTEGER NOT NULL DEFAULT 0,
    rejected_rows   INTEGER NOT NULL DEFAULT 0,
    error           TEXT,
    PRIMARY KEY (timezone, local_date, attempt)
);
CREATE TABLE IF NOT EXISTS aggregation_locks (
    timezone     TEXT NOT NULL,
    local_date   TEXT NOT NULL,
    acquired_at  INTEGER NOT NULL,
    PRIMARY KEY (timezone, local_date)
);
CREATE TABLE IF NOT EXISTS raw_cleanups (
    timezone    TEXT NOT NULL,
    local_date  TEXT NOT NULL,
    cleaned_at  INTEGER NOT NULL,
    ride_rows   INTEGER NOT NULL,
    park_rows   INTEGER NOT NULL,
    PRIMARY KEY (timezone, local_date)
);
CREATE TABLE IF NOT EXISTS entity_failures (
    timezone     TEXT NOT NULL,
    local_date   TEXT NOT NULL,
    attempt      INTEGER NOT NULL,
    entity_kind  TEXT NOT NULL,
    entity_id    INTEGER NOT NULL,
    reason       TEXT NOT NULL,
    PRIMARY KEY (timezone, local_date, attempt, entity_kind, entity_id)
);
"#;

fn ride_stats_ddl(granularity: Granularity) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS ride_{g}_stats (
    ride_id                   INTEGER NOT NULL,
    park_id                   INTEGER NOT NULL,
    period_key                TEXT NOT NULL,
    tier                      INTEGER NOT NULL,
    operating_minutes         INTEGER NOT NULL,
    uptime_minutes            INTEGER NOT NULL,
    downtime_minutes          INTEGER NOT NULL,
    uptime_percentage         REAL NOT NULL,
    avg_wait                  REAL,
    min_wait                  INTEGER,
    max_wait                  INTEGER,
    wait_samples              INTEGER NOT NULL,
    status_changes            INTEGER NOT NULL,
    longest_downtime_minutes  INTEGER NOT NULL,
    PRIMARY KEY (ride_id, period_key)
);
CREATE INDEX IF NOT EXISTS idx_ride_{g}_stats_park ON ride_{g}_stats (park_id, period_key);
"#,
        g = granularity.as_str()
    )
}

fn park_stats_ddl(granularity: Granularity) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS park_{g}_stats (
    park_id                  INTEGER NOT NULL,
    period_key               TEXT NOT NULL,
    operating_minutes        INTEGER NOT NULL,
    rides_tracked            INTEGER NOT NULL,
    rides_with_downtime      INTEGER NOT NULL,
    total_downtime_hours     REAL NOT NULL,
    weighted_downtime_hours  REAL NOT NULL,
    total_tier_weight        INTEGER NOT NULL,
    shame_score              REAL NOT NULL,
    tier1_rides              INTEGER NOT NULL,
    tier2_rides              INTEGER NOT NULL,
    tier3_rides              INTEGER NOT NULL,
    best_ride_id             INTEGER,
    worst_ride_id            INTEGER,
    avg_uptime_percentage    REAL NOT NULL,
    avg_wait                 REAL,
    max_wait                 INTEGER,
    PRIMARY KEY (park_id, period_key)
);
"#,
        g = granularity.as_str()
    )
}

fn get_utc(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let secs: i64 = row.get(idx)?;
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn get_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<NaiveDate> {
    let text: String = row.get(idx)?;
    NaiveDate::parse_from_str(&text, "%Y-%m-%d")
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
