use crate::analyzers::types::{ParkStats, RideStats};
use crate::analyzers::writetos3::{ObjectSink, write_json};
use crate::model::ParkId;
use crate::period::{Granularity, Period};
use crate::scheduler::RunStatus;
use crate::storage::Store;
use crate::trends::{TrendSet, trends_for};
use anyhow::bail;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct DayIndex {
    pub generated_at: DateTime<Utc>,
    pub date: NaiveDate,
    pub timezones_published: Vec<String>,
    /// Timezone groups without a SUCCESS run for the date.
    pub timezones_pending: Vec<String>,
    pub parks: usize,
    pub rides: usize,
}

#[derive(Debug, Serialize)]
struct DayTrends {
    period_key: String,
    previous_key: String,
    parks: TrendSet,
    rides: TrendSet,
}

/// Publishes a date's daily park and ride rows and its day-over-day trends.
///
/// Only timezone groups whose latest run for `date` is SUCCESS are
/// published; a date with no such group is refused.
#[tracing::instrument(skip(store, sink, now), fields(date = %date))]
pub async fn publish_day(
    store: &Store,
    sink: &dyn ObjectSink,
    date: NaiveDate,
    trend_threshold: f64,
    now: DateTime<Utc>,
) -> anyhow::Result<DayIndex> {
    let mut published = Vec::new();
    let mut pending = Vec::new();
    for timezone in store.timezones()? {
        let status = store.latest_run(&timezone, date)?.map(|r| r.status);
        if status == Some(RunStatus::Success) {
            published.push(timezone);
        } else {
            pending.push(timezone);
        }
    }
    if published.is_empty() {
        bail!("{date} is not yet aggregated");
    }

    let mut allowed: HashSet<ParkId> = HashSet::new();
    for timezone in &published {
        allowed.extend(store.parks_in_timezone(timezone)?.iter().map(|p| p.park_id));
    }

    let day = Period::Day(date);
    let key = day.key();
    let parks: Vec<ParkStats> = store
        .park_stats(Granularity::Day, &key)?
        .into_iter()
        .filter(|p| allowed.contains(&p.park_id))
        .collect();
    let rides: Vec<RideStats> = store
        .ride_stats(Granularity::Day, &key)?
        .into_iter()
        .filter(|r| allowed.contains(&r.park_id))
        .collect();

    let report = trends_for(store, day, trend_threshold)?;
    let ride_ids: HashSet<i64> = rides.iter().map(|r| r.ride_id).collect();
    let keep = |set: TrendSet, ids: &dyn Fn(i64) -> bool| TrendSet {
        improved: set.improved.into_iter().filter(|e| ids(e.entity_id)).collect(),
        declined: set.declined.into_iter().filter(|e| ids(e.entity_id)).collect(),
    };
    let trends = DayTrends {
        period_key: report.period_key,
        previous_key: report.previous_key,
        parks: keep(report.parks, &|id| allowed.contains(&id)),
        rides: keep(report.rides, &|id| ride_ids.contains(&id)),
    };

    let prefix = format!("aggregates/{key}");
    write_json(sink, &format!("{prefix}/parks.json"), &parks).await?;
    write_json(sink, &format!("{prefix}/rides.json"), &rides).await?;
    write_json(sink, &format!("{prefix}/trends.json"), &trends).await?;

    let index = DayIndex {
        generated_at: now,
        date,
        timezones_published: published,
        timezones_pending: pending,
        parks: parks.len(),
        rides: rides.len(),
    };
    write_json(sink, &format!("{prefix}/index.json"), &index).await?;

    info!(parks = index.parks, rides = index.rides, location = %sink.location(&prefix), "Published day");
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::writetos3::LocalDirSink;
    use crate::model::Park;
    use crate::scheduler::RunLogEntry;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 5, 12, 0, 0).unwrap()
    }

    fn store() -> Store {
        let store = Store::open_in_memory().unwrap();
        for (park_id, tz) in [(1, "America/New_York"), (2, "Asia/Tokyo")] {
            store
                .upsert_park(&Park {
                    park_id,
                    name: format!("Park {park_id}"),
                    timezone: tz.to_string(),
                    operator: String::new(),
                })
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_refuses_unaggregated_date() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let date = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();
        store
            .insert_run(&RunLogEntry::started("America/New_York", date, 1, now()).with_status(RunStatus::FailedRetryable))
            .unwrap();

        let err = publish_day(&store, &LocalDirSink::new(dir.path()), date, 5.0, now())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not yet aggregated"));
        assert!(!dir.path().join("aggregates").exists());
    }

    #[tokio::test]
    async fn test_publishes_successful_groups_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        let date = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();
        store
            .insert_run(&RunLogEntry::started("Asia/Tokyo", date, 1, now()).with_status(RunStatus::Success))
            .unwrap();

        let index = publish_day(&store, &LocalDirSink::new(dir.path()), date, 5.0, now())
            .await
            .unwrap();
        assert_eq!(index.timezones_published, vec!["Asia/Tokyo".to_string()]);
        assert_eq!(index.timezones_pending, vec!["America/New_York".to_string()]);
        for file in ["parks.json", "rides.json", "trends.json", "index.json"] {
            assert!(dir.path().join("aggregates/2024-07-04").join(file).exists());
        }
    }
}
