//! Gzip CSV export of a date's raw snapshots, taken before cleanup.
//!
//! Ride rows use the same header as collector input, so an archive can be
//! fed back through `ingest` to rebuild a day.

use crate::analyzers::writetos3::ObjectSink;
use crate::error::{EngineError, Result};
use crate::ingest::SnapshotRow;
use crate::model::parse_timezone;
use crate::period::Period;
use crate::storage::Store;
use chrono::NaiveDate;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::io::Write;
use tracing::info;

/// Compressed CSV bodies of one timezone/date.
#[derive(Debug)]
pub struct RawExport {
    pub rides_csv_gz: Vec<u8>,
    pub activity_csv_gz: Vec<u8>,
    pub ride_rows: usize,
    pub activity_rows: usize,
}

fn gzip_csv<T: Serialize>(rows: &[T]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    let plain = writer.into_inner().map_err(|e| EngineError::Io(e.into_error()))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&plain)?;
    Ok(encoder.finish()?)
}

/// Exports the raw rows that cleanup of (`timezone`, `date`) would delete.
pub fn export_raw(store: &Store, timezone: &str, date: NaiveDate) -> Result<RawExport> {
    let tz = parse_timezone(timezone)?;
    let (start, end) = Period::Day(date).utc_bounds(tz)?;

    let mut rides = Vec::new();
    let mut activity = Vec::new();
    for park in store.parks_in_timezone(timezone)? {
        rides.extend(
            store
                .park_ride_snapshots(park.park_id, start, end)?
                .iter()
                .map(SnapshotRow::from),
        );
        activity.extend(store.park_activity(park.park_id, start, end)?);
    }

    Ok(RawExport {
        rides_csv_gz: gzip_csv(&rides)?,
        activity_csv_gz: gzip_csv(&activity)?,
        ride_rows: rides.len(),
        activity_rows: activity.len(),
    })
}

/// Object key prefix of an archived timezone/date.
pub fn archive_prefix(timezone: &str, date: NaiveDate) -> String {
    format!("raw/{timezone}/{}", Period::Day(date).key())
}

/// Uploads the raw rows of (`timezone`, `date`) to `sink`.
#[tracing::instrument(skip(store, sink), fields(timezone = %timezone, date = %date))]
pub async fn archive_raw(
    store: &Store,
    sink: &dyn ObjectSink,
    timezone: &str,
    date: NaiveDate,
) -> anyhow::Result<RawExport> {
    let export = export_raw(store, timezone, date)?;
    let prefix = archive_prefix(timezone, date);

    sink.put(&format!("{prefix}/rides.csv.gz"), export.rides_csv_gz.clone(), "application/gzip")
        .await?;
    sink.put(
        &format!("{prefix}/activity.csv.gz"),
        export.activity_csv_gz.clone(),
        "application/gzip",
    )
    .await?;

    info!(
        ride_rows = export.ride_rows,
        activity_rows = export.activity_rows,
        location = %sink.location(&prefix),
        "Raw snapshots archived"
    );
    Ok(export)
}
