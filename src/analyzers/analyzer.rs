use crate::analyzers::aggregate::{RideWindow, aggregate_ride};
use crate::analyzers::park::aggregate_park;
use crate::analyzers::rollup::rollup_for_date;
use crate::analyzers::timeline::{build_timeline, implausibility};
use crate::analyzers::types::{ParkDayOutput, ParkStats, RideStats};
use crate::classifier::{DowntimeRules, ParkState};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{
    EntityKind, OperatingSession, Park, ParkId, ParkType, RideId, RideStatusSnapshot,
    StatusChangeEvent, parse_timezone,
};
use crate::period::Period;
use crate::session::detect_session;
use crate::storage::Store;
use crate::transitions::{PriorState, detect_transitions};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{Instrument, debug, info, warn};

/// Counts and per-entity failures of one timezone/date aggregation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DayReport {
    pub parks_ok: i64,
    pub parks_failed: i64,
    pub rides_ok: i64,
    pub rides_failed: i64,
    /// Observations excluded as implausible.
    pub rejected_rows: i64,
    pub failures: Vec<(EntityKind, i64, String)>,
}

impl DayReport {
    fn total(&self) -> i64 {
        self.parks_ok + self.parks_failed + self.rides_ok + self.rides_failed
    }

    fn failed(&self) -> i64 {
        self.parks_failed + self.rides_failed
    }
}

#[derive(Debug, Clone)]
struct HourWindow {
    key: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    session_minutes: i64,
}

/// Everything the per-ride workers of one park share.
#[derive(Debug)]
struct ParkContext {
    park_id: ParkId,
    park_type: ParkType,
    day_key: String,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    session: Option<OperatingSession>,
    park_states: BTreeMap<DateTime<Utc>, ParkState>,
    hours: Vec<HourWindow>,
}

impl ParkContext {
    fn load(store: &Store, park: &Park, tz: Tz, date: NaiveDate, config: &EngineConfig) -> Result<Self> {
        let (window_start, window_end) = Period::Day(date).utc_bounds(tz)?;
        let activity = store.park_activity(park.park_id, window_start, window_end)?;
        let session = detect_session(park.park_id, tz, date, &activity);

        let mut hours = Vec::new();
        if let Some(s) = &session {
            for hour in Period::hours_of(date) {
                let (start, end) = hour.utc_bounds(tz)?;
                let session_minutes = s.minutes_within(start, end);
                if session_minutes > 0 {
                    hours.push(HourWindow {
                        key: hour.key(),
                        start,
                        end,
                        session_minutes,
                    });
                }
            }
        }

        Ok(Self {
            park_id: park.park_id,
            park_type: config.park_type_for(&park.operator),
            day_key: Period::Day(date).key(),
            window_start,
            window_end,
            park_states: activity
                .iter()
                .map(|a| (a.observed_at, ParkState::from(a)))
                .collect(),
            session,
            hours,
        })
    }

    fn session_minutes(&self) -> i64 {
        self.session.as_ref().map_or(0, |s| s.operating_minutes)
    }
}

/// One ride's contribution to its park's daily output.
#[derive(Debug)]
struct RideDay {
    ride_id: RideId,
    events: Vec<StatusChangeEvent>,
    daily: Option<RideStats>,
    hourly: Vec<RideStats>,
    rejected: usize,
}

fn process_ride(
    store: &Store,
    ctx: &ParkContext,
    ride_id: RideId,
    tier: u8,
    rules: &dyn DowntimeRules,
    config: &EngineConfig,
) -> Result<RideDay> {
    let snapshots = store.ride_snapshots(ride_id, ctx.window_start, ctx.window_end)?;
    let plausible: Vec<RideStatusSnapshot> = snapshots
        .iter()
        .filter(|s| implausibility(s, config.max_plausible_wait_minutes).is_none())
        .cloned()
        .collect();

    let prior = store
        .last_status_change_before(ride_id, ctx.window_start)?
        .as_ref()
        .map(PriorState::from);
    let events = detect_transitions(ride_id, prior, &plausible);

    let timeline = build_timeline(
        ride_id,
        &snapshots,
        &ctx.park_states,
        ctx.session.as_ref(),
        ctx.park_type,
        rules,
        config,
    );

    let day = RideWindow {
        ride_id,
        park_id: ctx.park_id,
        tier,
        period_key: &ctx.day_key,
        start: ctx.window_start,
        end: ctx.window_end,
        session_minutes: ctx.session_minutes(),
    };
    let daily = aggregate_ride(&day, &timeline.intervals, &events, rules)?;

    let mut hourly = Vec::new();
    if daily.is_some() {
        for hour in &ctx.hours {
            let window = RideWindow {
                period_key: &hour.key,
                start: hour.start,
                end: hour.end,
                session_minutes: hour.session_minutes,
                ..day
            };
            if let Some(row) = aggregate_ride(&window, &timeline.intervals, &events, rules)? {
                hourly.push(row);
            }
        }
    }

    Ok(RideDay {
        ride_id,
        events,
        daily,
        hourly,
        rejected: timeline.rejected,
    })
}

/// Shared inputs of one timezone/date run.
struct RunInputs {
    store: Arc<Store>,
    tz: Tz,
    date: NaiveDate,
    tiers: HashMap<RideId, u8>,
    config: Arc<EngineConfig>,
    rules: Arc<dyn DowntimeRules>,
}

/// Aggregates every ride of one park and the park itself for the run's
/// date. Invariant violations are recorded in `report`; any other error
/// aborts.
async fn aggregate_park_day(run: &RunInputs, park: &Park, report: &mut DayReport) -> Result<ParkDayOutput> {
    let (store, config) = (&run.store, &run.config);
    let ctx = Arc::new(ParkContext::load(store, park, run.tz, run.date, config)?);
    let rides = store.rides_for_park(park.park_id)?;
    let semaphore = Arc::new(tokio::sync::Semaphore::new(config.worker_concurrency.max(1)));

    debug!(
        park_id = park.park_id,
        rides = rides.len(),
        has_session = ctx.session.is_some(),
        "Aggregating park"
    );

    let mut tasks = Vec::with_capacity(rides.len());
    for ride in &rides {
        let ride_id = ride.ride_id;
        let tier = run.tiers.get(&ride_id).copied().unwrap_or(config.default_tier);
        let (sem, store, ctx, rules, config) = (
            semaphore.clone(),
            store.clone(),
            ctx.clone(),
            run.rules.clone(),
            config.clone(),
        );

        let ride_span = tracing::info_span!("aggregate_ride", ride_id, park_id = park.park_id);
        let task = tokio::spawn(
            async move {
                let _permit = sem.acquire().await;
                let span = tracing::Span::current();
                tokio::task::spawn_blocking(move || {
                    span.in_scope(|| process_ride(&store, &ctx, ride_id, tier, rules.as_ref(), &config))
                })
                .await?
            }
            .instrument(ride_span),
        );
        tasks.push((ride_id, task));
    }

    let mut status_changes = Vec::new();
    let mut ride_daily = Vec::new();
    let mut ride_hourly = Vec::new();

    for (ride_id, task) in tasks {
        match task.await? {
            Ok(day) => {
                report.rides_ok += 1;
                report.rejected_rows += day.rejected as i64;
                status_changes.push((day.ride_id, day.events));
                ride_daily.extend(day.daily);
                ride_hourly.extend(day.hourly);
            }
            Err(e @ EngineError::InvariantViolation { .. }) => {
                warn!(ride_id, error = %e, "Ride failed invariant checks");
                report.rides_failed += 1;
                report.failures.push((EntityKind::Ride, ride_id, e.to_string()));
            }
            Err(e) => return Err(e),
        }
    }

    let mut park_failure: Option<EngineError> = None;
    let park_daily = match aggregate_park(park.park_id, &ctx.day_key, ctx.session_minutes(), &ride_daily) {
        Ok(row) => row,
        Err(e) => {
            park_failure = Some(e);
            None
        }
    };

    let mut by_hour: BTreeMap<&str, Vec<RideStats>> = BTreeMap::new();
    for row in &ride_hourly {
        by_hour.entry(row.period_key.as_str()).or_default().push(row.clone());
    }
    let mut park_hourly: Vec<ParkStats> = Vec::new();
    for hour in &ctx.hours {
        let Some(rows) = by_hour.get(hour.key.as_str()) else {
            continue;
        };
        match aggregate_park(park.park_id, &hour.key, hour.session_minutes, rows) {
            Ok(row) => park_hourly.extend(row),
            Err(e) => {
                park_failure.get_or_insert(e);
            }
        }
    }

    let (park_daily, park_hourly) = match park_failure {
        Some(e) => {
            warn!(park_id = park.park_id, error = %e, "Park failed invariant checks");
            report.parks_failed += 1;
            report.failures.push((EntityKind::Park, park.park_id, e.to_string()));
            (None, Vec::new())
        }
        None => {
            report.parks_ok += 1;
            (park_daily, park_hourly)
        }
    };

    Ok(ParkDayOutput {
        park_id: park.park_id,
        local_date: run.date,
        window_start: ctx.window_start,
        window_end: ctx.window_end,
        session: ctx.session.clone(),
        status_changes,
        ride_daily,
        ride_hourly,
        park_daily,
        park_hourly,
    })
}

/// Fails when strictly more than `ratio` of the run's entities failed.
pub fn check_systemic(report: &DayReport, ratio: f64) -> Result<()> {
    let (failed, total) = (report.failed(), report.total());
    if total > 0 && failed as f64 > ratio * total as f64 {
        return Err(EngineError::Systemic {
            failed: failed as usize,
            total: total as usize,
        });
    }
    Ok(())
}

/// Aggregates every park of a timezone group for one local date, then
/// refreshes the rollups that contain the date.
///
/// Nothing is written when the share of failed entities is above
/// `systemic_failure_ratio`; the run fails with [`EngineError::Systemic`].
#[tracing::instrument(skip(store, config, rules), fields(timezone = %timezone, date = %date))]
pub async fn aggregate_timezone_day(
    store: Arc<Store>,
    timezone: &str,
    date: NaiveDate,
    config: &EngineConfig,
    rules: Arc<dyn DowntimeRules>,
) -> Result<DayReport> {
    // Raw rows are gone after cleanup.
    if store.raw_cleaned(timezone, date)? {
        return Err(EngineError::RawDataCleaned {
            timezone: timezone.to_string(),
            date: date.to_string(),
        });
    }
    let parks = store.parks_in_timezone(timezone)?;
    let run = RunInputs {
        store: store.clone(),
        tz: parse_timezone(timezone)?,
        date,
        tiers: store.tiers()?,
        config: Arc::new(config.clone()),
        rules,
    };

    info!(parks = parks.len(), "Starting aggregation");

    let mut report = DayReport::default();
    let mut outputs = Vec::with_capacity(parks.len());
    for park in &parks {
        outputs.push(aggregate_park_day(&run, park, &mut report).await?);
    }

    check_systemic(&report, config.systemic_failure_ratio)?;

    for output in &outputs {
        store.save_park_day(output)?;
    }

    let park_ids: Vec<ParkId> = parks.iter().map(|p| p.park_id).collect();
    let rollups = rollup_for_date(&store, &park_ids, date)?;
    report.failures.extend(rollups.failures);

    info!(
        parks_ok = report.parks_ok,
        parks_failed = report.parks_failed,
        rides_ok = report.rides_ok,
        rides_failed = report.rides_failed,
        rejected_rows = report.rejected_rows,
        "Aggregation complete"
    );
    Ok(report)
}
