//! Loading collector output and the park catalog into the store.
//!
//! Ride snapshots arrive as CSV with the header
//! `ride_id,park_id,observed_at,is_open,wait_time,status`; `observed_at` is
//! RFC 3339 and the last three columns may be empty. Park activity CSV, when
//! the collector writes it, uses
//! `park_id,observed_at,rides_open,rides_closed,avg_wait,max_wait,appears_open`.

use crate::analyzers::timeline::implausibility;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{
    Park, ParkActivitySnapshot, ParkId, Ride, RideId, RideStatus, RideStatusSnapshot, RideTier,
    parse_timezone,
};
use crate::storage::Store;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info, warn};

/// A ride snapshot as written by the collector.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotRow {
    pub ride_id: RideId,
    pub park_id: ParkId,
    pub observed_at: DateTime<Utc>,
    pub is_open: Option<bool>,
    pub wait_time: Option<i32>,
    pub status: Option<String>,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<RideStatusSnapshot> {
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(s.parse::<RideStatus>()?),
        };
        Ok(RideStatusSnapshot {
            ride_id: self.ride_id,
            park_id: self.park_id,
            observed_at: self.observed_at,
            is_open: self.is_open,
            wait_time: self.wait_time,
            status,
        })
    }
}

impl From<&RideStatusSnapshot> for SnapshotRow {
    fn from(s: &RideStatusSnapshot) -> Self {
        Self {
            ride_id: s.ride_id,
            park_id: s.park_id,
            observed_at: s.observed_at,
            is_open: s.is_open,
            wait_time: s.wait_time,
            status: s.status.map(|st| st.as_str().to_string()),
        }
    }
}

#[derive(Debug, Default)]
pub struct SnapshotBatch {
    pub snapshots: Vec<RideStatusSnapshot>,
    /// Rows that could not be parsed; logged and skipped.
    pub rejected: usize,
}

/// Parses ride snapshot CSV. A bad row is skipped, never fatal.
pub fn read_ride_snapshots<R: Read>(reader: R) -> SnapshotBatch {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut batch = SnapshotBatch::default();

    for (line, result) in rdr.deserialize::<SnapshotRow>().enumerate() {
        match result.map_err(EngineError::from).and_then(SnapshotRow::into_snapshot) {
            Ok(snapshot) => batch.snapshots.push(snapshot),
            Err(e) => {
                warn!(line = line + 2, error = %e, "Skipping malformed snapshot row");
                batch.rejected += 1;
            }
        }
    }
    batch
}

#[derive(Debug, Default)]
pub struct ActivityBatch {
    pub activity: Vec<ParkActivitySnapshot>,
    pub rejected: usize,
}

/// Parses park activity CSV, skipping bad rows the same way as ride rows.
pub fn read_park_activity<R: Read>(reader: R) -> ActivityBatch {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut batch = ActivityBatch::default();

    for (line, result) in rdr.deserialize::<ParkActivitySnapshot>().enumerate() {
        match result {
            Ok(row) => batch.activity.push(row),
            Err(e) => {
                warn!(line = line + 2, error = %e, "Skipping malformed activity row");
                batch.rejected += 1;
            }
        }
    }
    batch
}

/// One activity row per (park, cycle) that has ride snapshots but no
/// collector-supplied activity. Rides of one cycle share its timestamp.
/// Observations with an implausible wait are left out of the counts.
pub fn derive_park_activity(
    snapshots: &[RideStatusSnapshot],
    supplied: &[ParkActivitySnapshot],
    max_wait: i32,
) -> Vec<ParkActivitySnapshot> {
    let known: HashSet<(ParkId, DateTime<Utc>)> =
        supplied.iter().map(|a| (a.park_id, a.observed_at)).collect();

    let mut cycles: BTreeMap<(ParkId, DateTime<Utc>), Vec<&RideStatusSnapshot>> = BTreeMap::new();
    for s in snapshots {
        if known.contains(&(s.park_id, s.observed_at)) {
            continue;
        }
        let rides = cycles.entry((s.park_id, s.observed_at)).or_default();
        if implausibility(s, max_wait).is_none() {
            rides.push(s);
        }
    }

    cycles
        .into_iter()
        .map(|((park_id, observed_at), rides)| ParkActivitySnapshot::from_rides(park_id, observed_at, rides))
        .collect()
}

#[derive(Debug, Default, Serialize)]
pub struct IngestSummary {
    pub ride_rows: usize,
    pub park_rows: usize,
    pub derived_park_rows: usize,
    pub rejected: usize,
    pub rejected_activity: usize,
}

/// Loads a ride snapshot CSV and, optionally, a park activity CSV.
///
/// Derived activity is rebuilt from every stored ride row of each cycle the
/// file touches, so a cycle split across files ends up with full counts.
#[tracing::instrument(skip(store, config))]
pub fn ingest_snapshot_files(
    store: &Store,
    rides_csv: &Path,
    activity_csv: Option<&Path>,
    config: &EngineConfig,
) -> Result<IngestSummary> {
    let batch = read_ride_snapshots(std::fs::File::open(rides_csv)?);
    let supplied = match activity_csv {
        Some(path) => read_park_activity(std::fs::File::open(path)?),
        None => ActivityBatch::default(),
    };

    let ride_rows = store.insert_ride_snapshots(&batch.snapshots)?;
    let park_rows = store.insert_park_activity(&supplied.activity)?;

    let touched: BTreeSet<(ParkId, DateTime<Utc>)> =
        batch.snapshots.iter().map(|s| (s.park_id, s.observed_at)).collect();
    let mut stored = Vec::new();
    for (park_id, at) in touched {
        stored.extend(store.park_ride_snapshots(park_id, at, at + Duration::seconds(1))?);
    }
    let derived = derive_park_activity(&stored, &supplied.activity, config.max_plausible_wait_minutes);

    let summary = IngestSummary {
        ride_rows,
        park_rows,
        derived_park_rows: store.insert_derived_park_activity(&derived)?,
        rejected: batch.rejected,
        rejected_activity: supplied.rejected,
    };
    info!(
        ride_rows = summary.ride_rows,
        park_rows = summary.park_rows,
        derived_park_rows = summary.derived_park_rows,
        rejected = summary.rejected,
        rejected_activity = summary.rejected_activity,
        "Snapshots ingested"
    );
    Ok(summary)
}

/// Parks, rides and tier assignments, as one JSON document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Catalog {
    #[serde(default)]
    pub parks: Vec<Park>,
    #[serde(default)]
    pub rides: Vec<Ride>,
    #[serde(default)]
    pub tiers: Vec<RideTier>,
}

impl Catalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[derive(Debug, Default, Serialize)]
pub struct CatalogSummary {
    pub parks: usize,
    pub rides: usize,
    pub tiers: usize,
    pub skipped_tiers: usize,
}

/// Upserts the catalog. Every park timezone must be a known IANA zone;
/// tiers outside 1..=3 are skipped.
pub fn ingest_catalog(store: &Store, catalog: &Catalog) -> Result<CatalogSummary> {
    for park in &catalog.parks {
        parse_timezone(&park.timezone)?;
    }

    let mut summary = CatalogSummary::default();
    for park in &catalog.parks {
        store.upsert_park(park)?;
        summary.parks += 1;
    }
    for ride in &catalog.rides {
        store.upsert_ride(ride)?;
        summary.rides += 1;
    }
    for tier in &catalog.tiers {
        if !(1..=3).contains(&tier.tier) {
            warn!(ride_id = tier.ride_id, tier = tier.tier, "Ignoring unknown tier");
            summary.skipped_tiers += 1;
            continue;
        }
        store.upsert_tier(tier)?;
        summary.tiers += 1;
    }
    debug!(?summary, "Catalog ingested");
    Ok(summary)
}
