//! Attempt bookkeeping for timezone/date aggregation runs.
//!
//! Every attempt is a row in the run log and moves
//! `PENDING -> RUNNING -> {SUCCESS, FAILED_RETRYABLE, FAILED_TERMINAL}`.
//! No state is held in memory between calls: [`attempt_aggregation`] and
//! [`tick`] can be triggered by any external timer, any number of times.

use crate::analyzers::analyzer::{DayReport, aggregate_timezone_day};
use crate::classifier::DowntimeRules;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::model::{EntityKind, parse_timezone};
use crate::period::{Period, local_date, local_to_utc};
use crate::storage::Store;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    FailedRetryable,
    FailedTerminal,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Success => "SUCCESS",
            RunStatus::FailedRetryable => "FAILED_RETRYABLE",
            RunStatus::FailedTerminal => "FAILED_TERMINAL",
        }
    }

    /// No further attempt follows a final status.
    pub fn is_final(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::FailedTerminal)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (
                    RunStatus::Running,
                    RunStatus::Success | RunStatus::FailedRetryable | RunStatus::FailedTerminal
                )
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCESS" => Ok(RunStatus::Success),
            "FAILED_RETRYABLE" => Ok(RunStatus::FailedRetryable),
            "FAILED_TERMINAL" => Ok(RunStatus::FailedTerminal),
            other => Err(EngineError::Malformed(format!("unknown run status '{other}'"))),
        }
    }
}

/// One attempt in the aggregation run log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLogEntry {
    pub timezone: String,
    pub local_date: NaiveDate,
    pub attempt: u32,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rides_ok: i64,
    pub rides_failed: i64,
    pub parks_ok: i64,
    pub parks_failed: i64,
    pub rejected_rows: i64,
    pub error: Option<String>,
}

impl RunLogEntry {
    pub fn pending(timezone: &str, local_date: NaiveDate, attempt: u32, now: DateTime<Utc>) -> Self {
        Self {
            timezone: timezone.to_string(),
            local_date,
            attempt,
            status: RunStatus::Pending,
            started_at: now,
            finished_at: None,
            rides_ok: 0,
            rides_failed: 0,
            parks_ok: 0,
            parks_failed: 0,
            rejected_rows: 0,
            error: None,
        }
    }

    pub fn started(timezone: &str, local_date: NaiveDate, attempt: u32, now: DateTime<Utc>) -> Self {
        Self::pending(timezone, local_date, attempt, now).with_status(RunStatus::Running)
    }

    pub fn with_status(self, status: RunStatus) -> Self {
        Self { status, ..self }
    }

    /// Moves to `next`, refusing any edge outside the run state machine.
    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Closes a run left open after the last budgeted attempt, e.g. a
    /// process killed mid-run. Bypasses the state machine: the row
    /// may be PENDING, RUNNING or FAILED_RETRYABLE.
    pub fn abandon(&mut self, now: DateTime<Utc>) {
        let reason = format!("attempt {} abandoned while {}", self.attempt, self.status);
        self.error = Some(match self.error.take() {
            Some(last) => format!("{reason}: {last}"),
            None => reason,
        });
        self.status = RunStatus::FailedTerminal;
        self.finished_at.get_or_insert(now);
    }

    fn record_counts(&mut self, report: &DayReport) {
        self.rides_ok = report.rides_ok;
        self.rides_failed = report.rides_failed;
        self.parks_ok = report.parks_ok;
        self.parks_failed = report.parks_failed;
        self.rejected_rows = report.rejected_rows;
    }
}

/// An entity whose computation failed an invariant during an attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityFailure {
    pub timezone: String,
    pub local_date: NaiveDate,
    pub attempt: u32,
    pub entity_kind: EntityKind,
    pub entity_id: i64,
    pub reason: String,
}

/// Per-attempt summary for operations tooling.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub timezone: String,
    pub local_date: NaiveDate,
    pub attempt: u32,
    pub status: RunStatus,
    pub rides_ok: i64,
    pub rides_failed: i64,
    pub parks_ok: i64,
    pub parks_failed: i64,
    pub rejected_rows: i64,
    pub duration_secs: Option<i64>,
    pub error: Option<String>,
}

impl From<&RunLogEntry> for RunSummary {
    fn from(run: &RunLogEntry) -> Self {
        Self {
            timezone: run.timezone.clone(),
            local_date: run.local_date,
            attempt: run.attempt,
            status: run.status,
            rides_ok: run.rides_ok,
            rides_failed: run.rides_failed,
            parks_ok: run.parks_ok,
            parks_failed: run.parks_failed,
            rejected_rows: run.rejected_rows,
            duration_secs: run.finished_at.map(|f| (f - run.started_at).num_seconds()),
            error: run.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// The latest attempt already succeeded; nothing was run.
    AlreadySucceeded,
    /// The attempt budget is spent; nothing was run.
    Exhausted,
    /// Another attempt holds the lock for this timezone/date.
    Locked,
    /// Raw snapshots were deleted after a success; stored statistics stand.
    Cleaned,
    Ran(RunSummary),
}

/// Runs one aggregation attempt for `timezone`/`date` and logs it.
///
/// A date whose latest attempt is final is skipped unless `force` is set;
/// forced runs recompute a finished date and are never refused for budget.
/// A date whose raw snapshots were cleaned up is never recomputed.
#[tracing::instrument(skip(store, config, rules), fields(timezone = %timezone, date = %date))]
pub async fn attempt_aggregation(
    store: Arc<Store>,
    timezone: &str,
    date: NaiveDate,
    now: DateTime<Utc>,
    config: &EngineConfig,
    rules: Arc<dyn DowntimeRules>,
    force: bool,
) -> Result<AttemptOutcome> {
    if let Some(outcome) = settled(&store, timezone, date, force)? {
        return Ok(outcome);
    }

    if !store.try_acquire_lock(timezone, date, now, config.lock_ttl_minutes)? {
        info!("Aggregation already running, skipping");
        return Ok(AttemptOutcome::Locked);
    }

    let result = attempt_locked(&store, timezone, date, now, config, rules, force).await;
    let released = store.release_lock(timezone, date);
    let outcome = result?;
    released?;
    Ok(outcome)
}

/// The outcome for a date that needs no attempt, if any.
fn settled(store: &Store, timezone: &str, date: NaiveDate, force: bool) -> Result<Option<AttemptOutcome>> {
    if !force {
        match store.latest_run(timezone, date)?.map(|r| r.status) {
            Some(RunStatus::Success) => return Ok(Some(AttemptOutcome::AlreadySucceeded)),
            Some(RunStatus::FailedTerminal) => return Ok(Some(AttemptOutcome::Exhausted)),
            _ => {}
        }
    }
    if store.raw_cleaned(timezone, date)? {
        warn!("Raw snapshots already cleaned up, refusing to recompute");
        return Ok(Some(AttemptOutcome::Cleaned));
    }
    Ok(None)
}

/// Everything after the lock is taken. The run log is read again here so
/// two racing callers never number the same attempt.
async fn attempt_locked(
    store: &Arc<Store>,
    timezone: &str,
    date: NaiveDate,
    now: DateTime<Utc>,
    config: &EngineConfig,
    rules: Arc<dyn DowntimeRules>,
    force: bool,
) -> Result<AttemptOutcome> {
    if let Some(outcome) = settled(store, timezone, date, force)? {
        return Ok(outcome);
    }

    let latest = store.latest_run(timezone, date)?;
    let attempt = latest.as_ref().map_or(1, |r| r.attempt + 1);
    if attempt > config.max_attempts() && !force {
        // Holding the lock means no live attempt owns this row.
        if let Some(mut stuck) = latest {
            let was = stuck.status;
            stuck.abandon(now);
            store.update_run(&stuck)?;
            error!(
                attempt = stuck.attempt,
                was = %was,
                operator_attention = true,
                "Attempt budget spent without a final status, marked terminal"
            );
        }
        return Ok(AttemptOutcome::Exhausted);
    }

    let mut run = RunLogEntry::pending(timezone, date, attempt, now);
    execute_attempt(store, &mut run, config, rules).await?;
    Ok(AttemptOutcome::Ran(RunSummary::from(&run)))
}

async fn execute_attempt(
    store: &Arc<Store>,
    run: &mut RunLogEntry,
    config: &EngineConfig,
    rules: Arc<dyn DowntimeRules>,
) -> Result<()> {
    store.insert_run(run)?;
    run.transition(RunStatus::Running)?;
    store.update_run(run)?;
    info!(attempt = run.attempt, "Aggregation attempt started");

    let clock = std::time::Instant::now();
    let result = aggregate_timezone_day(store.clone(), &run.timezone, run.local_date, config, rules).await;
    run.finished_at = Some(run.started_at + Duration::from_std(clock.elapsed()).unwrap_or_else(|_| Duration::zero()));

    match result {
        Ok(report) => {
            for (entity_kind, entity_id, reason) in &report.failures {
                store.record_entity_failure(&EntityFailure {
                    timezone: run.timezone.clone(),
                    local_date: run.local_date,
                    attempt: run.attempt,
                    entity_kind: *entity_kind,
                    entity_id: *entity_id,
                    reason: reason.clone(),
                })?;
            }
            run.record_counts(&report);
            run.transition(RunStatus::Success)?;
            info!(
                attempt = run.attempt,
                rides_ok = run.rides_ok,
                rides_failed = run.rides_failed,
                "Aggregation attempt succeeded"
            );
        }
        Err(e) => {
            run.error = Some(e.to_string());
            if run.attempt < config.max_attempts() {
                run.transition(RunStatus::FailedRetryable)?;
                warn!(
                    attempt = run.attempt,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Aggregation attempt failed, will retry"
                );
            } else {
                run.transition(RunStatus::FailedTerminal)?;
                error!(
                    attempt = run.attempt,
                    error = %e,
                    retryable = e.is_retryable(),
                    operator_attention = true,
                    "Aggregation failed terminally"
                );
            }
        }
    }

    store.update_run(run)
}

/// The date an attempt is due for in timezone group `tz` at `now`, if any.
///
/// The target is the group's local yesterday; attempt `n` becomes due
/// `attempt_offsets_minutes[n - 1]` minutes after local midnight. A date
/// whose budget is spent but whose latest run never finished stays due so
/// the next attempt can close it.
pub fn due_attempt(
    store: &Store,
    timezone: &str,
    tz: Tz,
    now: DateTime<Utc>,
    config: &EngineConfig,
) -> Result<Option<NaiveDate>> {
    let today = local_date(tz, now);
    let Some(target) = today.pred_opt() else {
        return Ok(None);
    };

    let midnight = local_to_utc(tz, today.and_time(NaiveTime::MIN))?;
    let minutes = (now - midnight).num_minutes();
    let due = config
        .attempt_offsets_minutes
        .iter()
        .filter(|offset| **offset <= minutes)
        .count() as u32;

    let latest = store.latest_run(timezone, target)?;
    let (made, finished) = latest.map_or((0, false), |r| (r.attempt, r.status.is_final()));

    let stuck = made >= config.max_attempts();
    Ok((!finished && (made < due || stuck)).then_some(target))
}

#[derive(Debug, Clone, Serialize)]
pub struct TickResult {
    pub timezone: String,
    pub local_date: NaiveDate,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

/// Runs every attempt that is due at `now`, at most one per timezone group.
///
/// A failing group is logged and does not stop the others.
pub async fn tick(
    store: Arc<Store>,
    now: DateTime<Utc>,
    config: &EngineConfig,
    rules: Arc<dyn DowntimeRules>,
) -> Result<Vec<TickResult>> {
    let mut results = Vec::new();
    for timezone in store.timezones()? {
        let tz = match parse_timezone(&timezone) {
            Ok(tz) => tz,
            Err(e) => {
                error!(timezone = %timezone, error = %e, "Skipping timezone group");
                continue;
            }
        };
        let Some(date) = due_attempt(&store, &timezone, tz, now, config)? else {
            continue;
        };

        match attempt_aggregation(store.clone(), &timezone, date, now, config, rules.clone(), false).await {
            Ok(outcome) => results.push(TickResult {
                timezone,
                local_date: date,
                outcome,
            }),
            Err(e) => error!(timezone = %timezone, date = %date, error = %e, "Attempt bookkeeping failed"),
        }
    }
    Ok(results)
}

/// Deletes the raw snapshots of every park in `timezone` for its local
/// `date`. Refused unless the latest attempt for the pair is SUCCESS.
#[tracing::instrument(skip(store), fields(timezone = %timezone, date = %date))]
pub fn cleanup_raw(store: &Store, timezone: &str, date: NaiveDate) -> Result<(usize, usize)> {
    let tz = parse_timezone(timezone)?;
    let (start, end) = Period::Day(date).utc_bounds(tz)?;
    let parks: Vec<i64> = store
        .parks_in_timezone(timezone)?
        .iter()
        .map(|p| p.park_id)
        .collect();

    let (ride_rows, park_rows) = store.delete_raw_snapshots(timezone, date, &parks, start, end)?;
    info!(ride_rows, park_rows, "Raw snapshots deleted");
    Ok((ride_rows, park_rows))
}
