use super::Store;
use crate::error::Result;
use crate::model::{Park, ParkId, Ride, RideId, RideTier};
use rusqlite::params;
use std::collections::HashMap;

impl Store {
    pub fn upsert_park(&self, park: &Park) -> Result<()> {
        self.conn().execute(
            "INSERT INTO parks (park_id, name, timezone, operator) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(park_id) DO UPDATE SET
                name = excluded.name, timezone = excluded.timezone, operator = excluded.operator",
            params![park.park_id, park.name, park.timezone, park.operator],
        )?;
        Ok(())
    }

    pub fn upsert_ride(&self, ride: &Ride) -> Result<()> {
        self.conn().execute(
            "INSERT INTO rides (ride_id, park_id, name, active) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(ride_id) DO UPDATE SET
                park_id = excluded.park_id, name = excluded.name, active = excluded.active",
            params![ride.ride_id, ride.park_id, ride.name, ride.active],
        )?;
        Ok(())
    }

    pub fn upsert_tier(&self, tier: &RideTier) -> Result<()> {
        self.conn().execute(
            "INSERT INTO ride_tiers (ride_id, tier) VALUES (?1, ?2)
             ON CONFLICT(ride_id) DO UPDATE SET tier = excluded.tier",
            params![tier.ride_id, tier.tier],
        )?;
        Ok(())
    }

    pub fn parks(&self) -> Result<Vec<Park>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT park_id, name, timezone, operator FROM parks ORDER BY park_id")?;
        let rows = stmt.query_map([], map_park)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn park(&self, park_id: ParkId) -> Result<Option<Park>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT park_id, name, timezone, operator FROM parks WHERE park_id = ?1")?;
        let mut rows = stmt.query_map(params![park_id], map_park)?;
        Ok(rows.next().transpose()?)
    }

    pub fn parks_in_timezone(&self, timezone: &str) -> Result<Vec<Park>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT park_id, name, timezone, operator FROM parks WHERE timezone = ?1 ORDER BY park_id",
        )?;
        let rows = stmt.query_map(params![timezone], map_park)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Distinct park timezones, i.e. the scheduler's groups.
    pub fn timezones(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT timezone FROM parks ORDER BY timezone")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Active rides of a park, ordered by id.
    pub fn rides_for_park(&self, park_id: ParkId) -> Result<Vec<Ride>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ride_id, park_id, name, active FROM rides
             WHERE park_id = ?1 AND active = 1 ORDER BY ride_id",
        )?;
        let rows = stmt.query_map(params![park_id], |row| {
            Ok(Ride {
                ride_id: row.get(0)?,
                park_id: row.get(1)?,
                name: row.get(2)?,
                active: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn tiers(&self) -> Result<HashMap<RideId, u8>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT ride_id, tier FROM ride_tiers")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, RideId>(0)?, row.get::<_, u8>(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
    }
}

fn map_park(row: &rusqlite::Row<'_>) -> rusqlite::Result<Park> {
    Ok(Park {
        park_id: row.get(0)?,
        name: row.get(1)?,
        timezone: row.get(2)?,
        operator: row.get(3)?,
    })
}
