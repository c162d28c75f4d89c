use super::snapshots::{insert_session, replace_status_changes};
use super::{Store, date_key};
use crate::analyzers::types::{ParkDayOutput, ParkStats, RideStats};
use crate::error::Result;
use crate::model::ParkId;
use crate::period::Granularity;
use rusqlite::{Connection, params};

const RIDE_COLUMNS: &str = "ride_id, park_id, period_key, tier, operating_minutes, uptime_minutes, \
     downtime_minutes, uptime_percentage, avg_wait, min_wait, max_wait, wait_samples, \
     status_changes, longest_downtime_minutes";

const PARK_COLUMNS: &str = "park_id, period_key, operating_minutes, rides_tracked, \
     rides_with_downtime, total_downtime_hours, weighted_downtime_hours, total_tier_weight, \
     shame_score, tier1_rides, tier2_rides, tier3_rides, best_ride_id, worst_ride_id, \
     avg_uptime_percentage, avg_wait, max_wait";

impl Store {
    /// Writes one park's daily output in a single transaction.
    pub fn save_park_day(&self, out: &ParkDayOutput) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        match &out.session {
            Some(session) => insert_session(&tx, session)?,
            None => {
                tx.execute(
                    "DELETE FROM operating_sessions WHERE park_id = ?1 AND local_date = ?2",
                    params![out.park_id, date_key(out.local_date)],
                )?;
            }
        }

        for (ride_id, events) in &out.status_changes {
            replace_status_changes(&tx, *ride_id, out.window_start, out.window_end, events)?;
        }

        let day = date_key(out.local_date);
        let (first_hour, last_hour) = (format!("{day}T00"), format!("{day}T23"));

        replace_ride_rows(&tx, Granularity::Day, out.park_id, &day, &day, &out.ride_daily)?;
        replace_ride_rows(&tx, Granularity::Hour, out.park_id, &first_hour, &last_hour, &out.ride_hourly)?;
        replace_park_rows(&tx, Granularity::Day, out.park_id, &day, &day, out.park_daily.as_slice())?;
        replace_park_rows(&tx, Granularity::Hour, out.park_id, &first_hour, &last_hour, &out.park_hourly)?;

        tx.commit()?;
        Ok(())
    }

    /// Replaces a park's ride rows with period keys in `[from_key, to_key]`.
    pub fn replace_ride_stats(
        &self,
        granularity: Granularity,
        park_id: ParkId,
        from_key: &str,
        to_key: &str,
        rows: &[RideStats],
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        replace_ride_rows(&tx, granularity, park_id, from_key, to_key, rows)?;
        tx.commit()?;
        Ok(())
    }

    pub fn replace_park_stats(
        &self,
        granularity: Granularity,
        park_id: ParkId,
        from_key: &str,
        to_key: &str,
        rows: &[ParkStats],
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        replace_park_rows(&tx, granularity, park_id, from_key, to_key, rows)?;
        tx.commit()?;
        Ok(())
    }

    /// Every ride row for one period, ordered by ride id.
    pub fn ride_stats(&self, granularity: Granularity, period_key: &str) -> Result<Vec<RideStats>> {
        self.ride_stats_where(granularity, "period_key = ?1", params![period_key])
    }

    /// A park's ride rows with period keys in `[from_key, to_key]`.
    pub fn ride_stats_for_park(
        &self,
        granularity: Granularity,
        park_id: ParkId,
        from_key: &str,
        to_key: &str,
    ) -> Result<Vec<RideStats>> {
        self.ride_stats_where(
            granularity,
            "park_id = ?1 AND period_key >= ?2 AND period_key <= ?3",
            params![park_id, from_key, to_key],
        )
    }

    pub fn park_stats(&self, granularity: Granularity, period_key: &str) -> Result<Vec<ParkStats>> {
        self.park_stats_where(granularity, "period_key = ?1", params![period_key])
    }

    pub fn park_stats_for_park(
        &self,
        granularity: Granularity,
        park_id: ParkId,
        from_key: &str,
        to_key: &str,
    ) -> Result<Vec<ParkStats>> {
        self.park_stats_where(
            granularity,
            "park_id = ?1 AND period_key >= ?2 AND period_key <= ?3",
            params![park_id, from_key, to_key],
        )
    }

    fn ride_stats_where(
        &self,
        granularity: Granularity,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<RideStats>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RIDE_COLUMNS} FROM ride_{g}_stats WHERE {filter} ORDER BY period_key, ride_id",
            g = granularity.as_str()
        ))?;
        let rows = stmt.query_map(args, |row| {
            Ok(RideStats {
                ride_id: row.get(0)?,
                park_id: row.get(1)?,
                period_key: row.get(2)?,
                tier: row.get(3)?,
                operating_minutes: row.get(4)?,
                uptime_minutes: row.get(5)?,
                downtime_minutes: row.get(6)?,
                uptime_percentage: row.get(7)?,
                avg_wait: row.get(8)?,
                min_wait: row.get(9)?,
                max_wait: row.get(10)?,
                wait_samples: row.get(11)?,
                status_changes: row.get(12)?,
                longest_downtime_minutes: row.get(13)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn park_stats_where(
        &self,
        granularity: Granularity,
        filter: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<ParkStats>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PARK_COLUMNS} FROM park_{g}_stats WHERE {filter} ORDER BY period_key, park_id",
            g = granularity.as_str()
        ))?;
        let rows = stmt.query_map(args, |row| {
            Ok(ParkStats {
                park_id: row.get(0)?,
                period_key: row.get(1)?,
                operating_minutes: row.get(2)?,
                rides_tracked: row.get(3)?,
                rides_with_downtime: row.get(4)?,
                total_downtime_hours: row.get(5)?,
                weighted_downtime_hours: row.get(6)?,
                total_tier_weight: row.get(7)?,
                shame_score: row.get(8)?,
                tier1_rides: row.get(9)?,
                tier2_rides: row.get(10)?,
                tier3_rides: row.get(11)?,
                best_ride_id: row.get(12)?,
                worst_ride_id: row.get(13)?,
                avg_uptime_percentage: row.get(14)?,
                avg_wait: row.get(15)?,
                max_wait: row.get(16)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn replace_ride_rows(
    conn: &Connection,
    granularity: Granularity,
    park_id: ParkId,
    from_key: &str,
    to_key: &str,
    rows: &[RideStats],
) -> Result<()> {
    let g = granularity.as_str();
    conn.execute(
        &format!("DELETE FROM ride_{g}_stats WHERE park_id = ?1 AND period_key >= ?2 AND period_key <= ?3"),
        params![park_id, from_key, to_key],
    )?;
    let mut stmt = conn.prepare(&format!(
        "INSERT OR REPLACE INTO ride_{g}_stats ({RIDE_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
    ))?;
    for r in rows {
        stmt.execute(params![
            r.ride_id,
            r.park_id,
            r.period_key,
            r.tier,
            r.operating_minutes,
            r.uptime_minutes,
            r.downtime_minutes,
            r.uptime_percentage,
            r.avg_wait,
            r.min_wait,
            r.max_wait,
            r.wait_samples,
            r.status_changes,
            r.longest_downtime_minutes,
        ])?;
    }
    Ok(())
}

fn replace_park_rows(
    conn: &Connection,
    granularity: Granularity,
    park_id: ParkId,
    from_key: &str,
    to_key: &str,
    rows: &[ParkStats],
) -> Result<()> {
    let g = granularity.as_str();
    conn.execute(
        &format!("DELETE FROM park_{g}_stats WHERE park_id = ?1 AND period_key >= ?2 AND period_key <= ?3"),
        params![park_id, from_key, to_key],
    )?;
    let mut stmt = conn.prepare(&format!(
        "INSERT OR REPLACE INTO park_{g}_stats ({PARK_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
    ))?;
    for p in rows {
        stmt.execute(params![
            p.park_id,
            p.period_key,
            p.operating_minutes,
            p.rides_tracked,
            p.rides_with_downtime,
            p.total_downtime_hours,
            p.weighted_downtime_hours,
            p.total_tier_weight,
            p.shame_score,
            p.tier1_rides,
            p.tier2_rides,
            p.tier3_rides,
            p.best_ride_id,
            p.worst_ride_id,
            p.avg_uptime_percentage,
            p.avg_wait,
            p.max_wait,
        ])?;
    }
    Ok(())
}
