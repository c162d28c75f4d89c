use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use ride_downtime::analyzers::analyzer::aggregate_timezone_day;
use ride_downtime::analyzers::park::aggregate_park;
use ride_downtime::analyzers::types::RideStats;
use ride_downtime::classifier::{Classification, DowntimeRules, ParkState, StandardRules};
use ride_downtime::config::EngineConfig;
use ride_downtime::error::EngineError;
use ride_downtime::ingest::{Catalog, SnapshotRow, ingest_catalog, ingest_snapshot_files};
use ride_downtime::model::{Park, ParkActivitySnapshot, ParkType, Ride, RideStatusSnapshot, RideTier};
use ride_downtime::period::{Granularity, Period};
use ride_downtime::scheduler::{AttemptOutcome, RunStatus, attempt_aggregation, cleanup_raw};
use ride_downtime::session::detect_sessions;
use ride_downtime::storage::Store;
use ride_downtime::trends::trends_for;
use std::path::Path;
use std::sync::Arc;

const LA: &str = "America/Los_Angeles";

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// One park in `timezone` with the given (ride, tier) pairs.
fn load_catalog(store: &Store, timezone: &str, rides: &[(i64, u8)]) {
    let catalog = Catalog {
        parks: vec![Park {
            park_id: 1,
            name: "Harbor Park".to_string(),
            timezone: timezone.to_string(),
            operator: "Generic Parks".to_string(),
        }],
        rides: rides
            .iter()
            .map(|(ride_id, _)| Ride {
                ride_id: *ride_id,
                park_id: 1,
                name: format!("Ride {ride_id}"),
                active: true,
            })
            .collect(),
        tiers: rides
            .iter()
            .map(|(ride_id, tier)| RideTier {
                ride_id: *ride_id,
                tier: *tier,
            })
            .collect(),
    };
    ingest_catalog(store, &catalog).unwrap();
}

/// Ten-minute collection cycles from `start`; `open(ride, step)` decides each
/// observation.
fn cycles(
    rides: &[i64],
    start: DateTime<Utc>,
    steps: i64,
    open: impl Fn(i64, i64) -> bool,
) -> Vec<RideStatusSnapshot> {
    let mut out = Vec::new();
    for step in 0..=steps {
        for ride_id in rides {
            let up = open(*ride_id, step);
            out.push(RideStatusSnapshot {
                ride_id: *ride_id,
                park_id: 1,
                observed_at: start + Duration::minutes(step * 10),
                is_open: Some(up),
                wait_time: if up { Some(20) } else { None },
                status: None,
            });
        }
    }
    out
}

/// Writes the snapshots as collector CSV and ingests them, deriving park
/// activity from the rides.
fn ingest(store: &Store, dir: &Path, name: &str, snapshots: &[RideStatusSnapshot]) {
    let path = dir.join(name);
    let mut writer = csv::Writer::from_path(&path).unwrap();
    for s in snapshots {
        writer.serialize(SnapshotRow::from(s)).unwrap();
    }
    writer.flush().unwrap();
    let summary = ingest_snapshot_files(store, &path, None, &EngineConfig::default()).unwrap();
    assert_eq!(summary.ride_rows, snapshots.len());
    assert_eq!(summary.rejected, 0);
}

/// Ride 10 (tier 1) is down 11:00-12:00 local, ride 11 never opens and
/// ride 12 (tier 2) runs all day. 09:00-15:00 local in Los Angeles.
fn july_fourth(store: &Store, dir: &Path) {
    load_catalog(store, LA, &[(10, 1), (11, 3), (12, 2)]);
    let snapshots = cycles(&[10, 11, 12], utc(2024, 7, 4, 16, 0), 36, |ride, step| match ride {
        10 => !(12..18).contains(&step),
        11 => false,
        _ => true,
    });
    ingest(store, dir, "2024-07-04.csv", &snapshots);
}

fn run(store: &Arc<Store>, date: NaiveDate, force: bool) -> AttemptOutcome {
    block_on(attempt_aggregation(
        store.clone(),
        LA,
        date,
        utc(2024, 7, 6, 9, 0),
        &EngineConfig::default(),
        Arc::new(StandardRules),
        force,
    ))
    .unwrap()
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn ran(outcome: AttemptOutcome) -> ride_downtime::scheduler::RunSummary {
    match outcome {
        AttemptOutcome::Ran(summary) => summary,
        other => panic!("expected a run, got {other:?}"),
    }
}

#[test]
fn test_pipeline_from_csv_to_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    july_fourth(&store, dir.path());
    let date = day(2024, 7, 4);

    // Nothing aggregated yet: raw data must stay.
    assert!(matches!(
        cleanup_raw(&store, LA, date),
        Err(EngineError::CleanupRefused { .. })
    ));

    let summary = ran(run(&store, date, false));
    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.attempt, 1);
    assert_eq!((summary.rides_ok, summary.parks_ok), (3, 1));

    let rides = store.ride_stats(Granularity::Day, "2024-07-04").unwrap();
    assert_eq!(rides.iter().map(|r| r.ride_id).collect::<Vec<_>>(), vec![10, 12]);
    assert_eq!(rides[0].downtime_minutes, 60);
    assert_eq!(rides[0].uptime_percentage, 83.33);
    assert_eq!(rides[1].avg_wait, Some(20.0));

    // Tier-1 hour over tracked weight 3 + 2.
    let park = &store.park_stats(Granularity::Day, "2024-07-04").unwrap()[0];
    assert_eq!(park.shame_score, 0.6);
    assert_eq!(park.worst_ride_id, Some(10));
    assert_eq!(park.best_ride_id, Some(12));

    for (granularity, key) in [
        (Granularity::Week, "2024-W27"),
        (Granularity::Month, "2024-07"),
        (Granularity::Year, "2024"),
    ] {
        let rows = store.ride_stats(granularity, key).unwrap();
        assert_eq!(rows.len(), 2, "{key}");
        assert_eq!(rows[0].downtime_minutes, 60, "{key}");
        assert_eq!(store.park_stats(granularity, key).unwrap()[0].operating_minutes, 360);
    }

    // A second attempt is not needed and not made.
    assert!(matches!(run(&store, date, false), AttemptOutcome::AlreadySucceeded));

    let (ride_rows, park_rows) = cleanup_raw(&store, LA, date).unwrap();
    assert_eq!((ride_rows, park_rows), (111, 37));
    assert_eq!(store.ride_stats(Granularity::Day, "2024-07-04").unwrap().len(), 2);
}

#[test]
fn test_forced_rerun_after_cleanup_keeps_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    july_fourth(&store, dir.path());
    let date = day(2024, 7, 4);

    assert_eq!(ran(run(&store, date, false)).status, RunStatus::Success);
    cleanup_raw(&store, LA, date).unwrap();

    assert!(matches!(run(&store, date, true), AttemptOutcome::Cleaned));
    assert_eq!(store.runs_for(LA, date).unwrap().len(), 1);

    let rides = store.ride_stats(Granularity::Day, "2024-07-04").unwrap();
    assert_eq!(rides.len(), 2);
    assert_eq!(rides[0].downtime_minutes, 60);
    assert_eq!(store.park_stats(Granularity::Day, "2024-07-04").unwrap().len(), 1);
    assert_eq!(store.ride_stats(Granularity::Week, "2024-W27").unwrap().len(), 2);

    // Calling the aggregator directly is refused too.
    let direct = block_on(aggregate_timezone_day(
        store.clone(),
        LA,
        date,
        &EngineConfig::default(),
        Arc::new(StandardRules),
    ));
    assert!(matches!(direct, Err(EngineError::RawDataCleaned { .. })));
}

#[test]
fn test_forced_rerun_leaves_identical_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    july_fourth(&store, dir.path());
    let date = day(2024, 7, 4);

    let snapshot = |store: &Store| {
        let mut rows: Vec<RideStats> = Vec::new();
        for granularity in Granularity::ALL {
            if granularity == Granularity::Hour {
                for hour in Period::hours_of(date) {
                    rows.extend(store.ride_stats(granularity, &hour.key()).unwrap());
                }
            } else {
                let key = Period::containing(granularity, date).key();
                rows.extend(store.ride_stats(granularity, &key).unwrap());
            }
        }
        let parks = store.park_stats(Granularity::Day, "2024-07-04").unwrap();
        (rows, parks)
    };

    ran(run(&store, date, false));
    let first = snapshot(&store);
    let second_run = ran(run(&store, date, true));
    assert_eq!(second_run.attempt, 2);
    assert_eq!(second_run.status, RunStatus::Success);
    assert_eq!(first, snapshot(&store));
}

#[test]
fn test_every_row_respects_uptime_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    july_fourth(&store, dir.path());
    let date = day(2024, 7, 4);
    ran(run(&store, date, false));

    let mut keys: Vec<(Granularity, String)> = Period::hours_of(date)
        .map(|h| (Granularity::Hour, h.key()))
        .collect();
    for granularity in [Granularity::Day, Granularity::Week, Granularity::Month, Granularity::Year] {
        keys.push((granularity, Period::containing(granularity, date).key()));
    }

    let mut checked = 0;
    for (granularity, key) in keys {
        let parks = store.park_stats(granularity, &key).unwrap();
        for ride in store.ride_stats(granularity, &key).unwrap() {
            assert!((0.0..=100.0).contains(&ride.uptime_percentage));
            assert_eq!(ride.uptime_minutes + ride.downtime_minutes, ride.operating_minutes);
            let park = parks.iter().find(|p| p.park_id == ride.park_id).unwrap();
            assert!(ride.operating_minutes <= park.operating_minutes, "{key}");
            checked += 1;
        }
    }
    assert!(checked > 10);
}

#[tokio::test]
async fn test_idle_park_never_charges_downtime() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    load_catalog(&store, LA, &[(1, 1), (2, 2)]);

    // Every ride closes for an hour mid-session: the park goes idle.
    let snapshots = cycles(&[1, 2], utc(2024, 7, 4, 16, 0), 30, |_, step| !(10..16).contains(&step));
    ingest(&store, dir.path(), "idle.csv", &snapshots);

    aggregate_timezone_day(store.clone(), LA, day(2024, 7, 4), &EngineConfig::default(), Arc::new(StandardRules))
        .await
        .unwrap();

    for ride in store.ride_stats(Granularity::Day, "2024-07-04").unwrap() {
        assert_eq!(ride.downtime_minutes, 0);
        assert_eq!(ride.operating_minutes, 240);
        assert_eq!(ride.uptime_percentage, 100.0);
    }
    let park = &store.park_stats(Granularity::Day, "2024-07-04").unwrap()[0];
    assert_eq!(park.operating_minutes, 300);
    assert_eq!(park.shame_score, 0.0);
}

#[tokio::test]
async fn test_ride_that_never_operated_has_no_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    july_fourth(&store, dir.path());

    aggregate_timezone_day(store.clone(), LA, day(2024, 7, 4), &EngineConfig::default(), Arc::new(StandardRules))
        .await
        .unwrap();

    let date = day(2024, 7, 4);
    for hour in Period::hours_of(date) {
        let rows = store.ride_stats(Granularity::Hour, &hour.key()).unwrap();
        assert!(rows.iter().all(|r| r.ride_id != 11));
    }
    for granularity in [Granularity::Day, Granularity::Week, Granularity::Month, Granularity::Year] {
        let key = Period::containing(granularity, date).key();
        assert!(store.ride_stats(granularity, &key).unwrap().iter().all(|r| r.ride_id != 11));
    }
    // Not tracked, so its tier weight stays out of the score.
    let park = &store.park_stats(Granularity::Day, "2024-07-04").unwrap()[0];
    assert_eq!(park.rides_tracked, 2);
    assert_eq!(park.total_tier_weight, 5);
}

fn downtime_row(ride_id: i64, tier: u8, downtime_minutes: i64) -> RideStats {
    RideStats {
        ride_id,
        park_id: 1,
        period_key: "2024-07-04".to_string(),
        tier,
        operating_minutes: 600,
        uptime_minutes: 600 - downtime_minutes,
        downtime_minutes,
        uptime_percentage: (600 - downtime_minutes) as f64 / 6.0,
        avg_wait: None,
        min_wait: None,
        max_wait: None,
        wait_samples: 0,
        status_changes: 0,
        longest_downtime_minutes: downtime_minutes,
    }
}

#[test]
fn test_weighted_score_treats_equal_weight_products_alike() {
    // Ten rides of total weight 20: four tier 1, two tier 2, four tier 3.
    let portfolio = |down: &[(i64, i64)]| -> Vec<RideStats> {
        let tiers = [1, 1, 1, 1, 2, 2, 3, 3, 3, 3];
        tiers
            .iter()
            .enumerate()
            .map(|(i, tier)| {
                let ride_id = i as i64 + 1;
                let minutes = down.iter().find(|(id, _)| *id == ride_id).map_or(0, |(_, m)| *m);
                downtime_row(ride_id, *tier, minutes)
            })
            .collect()
    };

    // Park A: one tier-1 ride down eight hours.
    let a = aggregate_park(1, "2024-07-04", 600, &portfolio(&[(1, 480)])).unwrap().unwrap();
    // Park B: three tier-3 rides down eight hours each.
    let b = aggregate_park(1, "2024-07-04", 600, &portfolio(&[(7, 480), (8, 480), (9, 480)]))
        .unwrap()
        .unwrap();

    assert_eq!(a.total_tier_weight, 20);
    assert_eq!(a.shame_score, 1.2);
    assert_eq!(b.shame_score, 1.2);
    assert_eq!((a.rides_with_downtime, b.rides_with_downtime), (1, 3));
}

#[test]
fn test_trends_between_consecutive_days() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    july_fourth(&store, dir.path());
    let fifth = cycles(&[10, 11, 12], utc(2024, 7, 5, 16, 0), 36, |ride, _| ride != 11);
    ingest(&store, dir.path(), "2024-07-05.csv", &fifth);

    ran(run(&store, day(2024, 7, 4), false));
    ran(run(&store, day(2024, 7, 5), false));

    let report = trends_for(&store, Period::Day(day(2024, 7, 5)), 5.0).unwrap();
    assert_eq!(report.previous_key, "2024-07-04");

    // Ride 10 went from 83.33 to 100; ride 12 did not move.
    assert_eq!(report.rides.improved.len(), 1);
    assert_eq!(report.rides.improved[0].entity_id, 10);
    assert_eq!(report.rides.improved[0].delta, 16.67);
    assert!(report.rides.declined.is_empty());

    // Park average of about 91.7 -> 100 crosses the threshold; 10 points would not.
    let park_delta = report.parks.improved[0].delta;
    assert!(park_delta > 8.0 && park_delta < 8.5, "{park_delta}");
    let strict = trends_for(&store, Period::Day(day(2024, 7, 5)), 10.0).unwrap();
    assert!(strict.parks.improved.is_empty());
}

#[tokio::test]
async fn test_late_night_activity_splits_at_local_midnight() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    load_catalog(&store, LA, &[(1, 2)]);

    // 23:00 to 01:30 local on a UTC-8 winter night.
    let snapshots = cycles(&[1], utc(2024, 1, 16, 7, 0), 15, |_, _| true);
    ingest(&store, dir.path(), "late.csv", &snapshots);

    let tz: chrono_tz::Tz = LA.parse().unwrap();
    let activity: Vec<ParkActivitySnapshot> = store
        .park_activity(1, utc(2024, 1, 16, 0, 0), utc(2024, 1, 17, 0, 0))
        .unwrap();
    let sessions = detect_sessions(1, tz, &activity);
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].local_date, day(2024, 1, 15));
    assert_eq!(sessions[0].operating_minutes, 50);
    assert_eq!(sessions[1].local_date, day(2024, 1, 16));
    assert_eq!(sessions[1].operating_minutes, 90);

    let config = EngineConfig::default();
    for date in [day(2024, 1, 15), day(2024, 1, 16)] {
        aggregate_timezone_day(store.clone(), LA, date, &config, Arc::new(StandardRules))
            .await
            .unwrap();
    }
    assert_eq!(store.session(1, day(2024, 1, 15)).unwrap().unwrap().operating_minutes, 50);
    assert_eq!(store.session(1, day(2024, 1, 16)).unwrap().unwrap().operating_minutes, 90);
    assert_eq!(store.ride_stats(Granularity::Day, "2024-01-15").unwrap()[0].operating_minutes, 50);
    assert_eq!(store.ride_stats(Granularity::Day, "2024-01-16").unwrap()[0].operating_minutes, 90);
}

/// Rules whose classification blows up inside the worker.
struct ExplodingRules;

impl DowntimeRules for ExplodingRules {
    fn classify(&self, _: &RideStatusSnapshot, _: ParkState, _: ParkType) -> Classification {
        panic!("classifier unavailable");
    }

    fn has_operated(&self, _: &[Classification]) -> bool {
        false
    }
}

#[tokio::test]
async fn test_retries_until_terminal_then_stops() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open_in_memory().unwrap());
    july_fourth(&store, dir.path());
    let date = day(2024, 7, 4);
    let config = EngineConfig::default();
    let now = utc(2024, 7, 5, 9, 0);

    let mut statuses = Vec::new();
    for _ in 0..config.max_attempts() {
        let outcome = attempt_aggregation(store.clone(), LA, date, now, &config, Arc::new(ExplodingRules), false)
            .await
            .unwrap();
        let AttemptOutcome::Ran(summary) = outcome else {
            panic!("expected a run");
        };
        assert!(summary.error.is_some());
        statuses.push(summary.status);
    }
    assert_eq!(
        statuses,
        vec![RunStatus::FailedRetryable, RunStatus::FailedRetryable, RunStatus::FailedTerminal]
    );

    let next = attempt_aggregation(store.clone(), LA, date, now, &config, Arc::new(StandardRules), false)
        .await
        .unwrap();
    assert!(matches!(next, AttemptOutcome::Exhausted));
    assert_eq!(store.runs_for(LA, date).unwrap().len(), 3);

    // Failed dates keep their raw data and write no statistics.
    assert!(cleanup_raw(&store, LA, date).is_err());
    assert!(store.ride_stats(Granularity::Day, "2024-07-04").unwrap().is_empty());
}
