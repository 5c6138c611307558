//! Periodic jobs.
//!
//! A tick compares the current time against the last recorded tick
//! (`app.cron.time`). Every job whose period boundary was crossed gets a
//! task named after the job and the boundary, so concurrent or repeated
//! ticks for the same boundary enqueue it once.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::registry::{CronAction, CronJob, Registry};
use super::task::{Enqueued, TaskError};
use super::Runtime;
use crate::lease::LeaseGuard;
use crate::store::StoreError;

/// Task function that executes a cron job.
pub const CRON_FUNC: &str = "app.cron";
/// Meta key holding the last tick time.
pub const CRON_TIME_KEY: &str = "app.cron.time";
/// The built-in record version sweep.
pub const UPDATE_JOB: &str = "app.update";

/// How long one cron execution may hold its job lease.
pub const CRON_LEASE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    /// The job made progress but stopped early; run it again soon.
    #[error("job has more work to do")]
    MoreWork,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<StoreError> for CronError {
    fn from(err: StoreError) -> Self {
        Self::Failed(err.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct CronArgs {
    pub(crate) job: String,
}

/// Outcome of the most recent execution of a job, kept for the status dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronRun {
    pub at: DateTime<Utc>,
    pub outcome: String,
}

/// What one [`Registry::tick`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub previous: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    /// False when the recorded tick time was not behind the clock.
    pub advanced: bool,
    pub enqueued: Vec<String>,
    pub already_pending: Vec<String>,
}

/// Meta key recording the last run of `job`.
#[must_use]
pub fn last_run_key(job: &str) -> String {
    format!("app.cron.run.{job}")
}

fn slot(at: DateTime<Utc>, period: Duration) -> i64 {
    let secs = i64::try_from(period.as_secs()).unwrap_or(i64::MAX).max(1);
    at.timestamp().div_euclid(secs)
}

fn crossed(previous: Option<DateTime<Utc>>, now: DateTime<Utc>, period: Duration) -> bool {
    previous.is_none_or(|prev| slot(prev, period) != slot(now, period))
}

/// Task name for `job` at the boundary containing `now`.
#[must_use]
pub fn task_name(job: &str, now: DateTime<Utc>, period: Duration) -> String {
    format!("{CRON_FUNC}.{job}.{}", slot(now, period))
}

impl<C: Runtime> Registry<C> {
    /// Record the tick and enqueue every job whose period boundary was
    /// crossed since the previous tick. `force` enqueues every job.
    ///
    /// # Errors
    ///
    /// Returns an error if the tick time cannot be read or written. Enqueue
    /// failures for individual jobs are logged.
    pub fn tick(&self, ctx: &C, force: bool) -> Result<TickReport, StoreError> {
        let store = ctx.store();
        let (previous, now, advanced) = store.transaction(|tx| {
            let now = tx.now();
            let previous = tx.read_meta::<DateTime<Utc>>(CRON_TIME_KEY)?;
            if previous.is_some_and(|prev| prev >= now) {
                return Ok::<_, StoreError>((previous, now, false));
            }
            tx.write_meta(CRON_TIME_KEY, &now)?;
            Ok((previous, now, true))
        })?;

        let mut report = TickReport {
            previous,
            now,
            advanced,
            enqueued: Vec::new(),
            already_pending: Vec::new(),
        };
        for job in &self.crons {
            if !(force || (advanced && crossed(previous, now, job.period))) {
                continue;
            }
            let name = task_name(&job.name, now, job.period);
            let args = CronArgs {
                job: job.name.clone(),
            };
            match self.enqueue(ctx, &name, CRON_FUNC, &args) {
                Ok(Enqueued::Queued) => report.enqueued.push(name),
                Ok(Enqueued::AlreadyPending) => report.already_pending.push(name),
                Err(err) => error!(job = %job.name, error = %err, "cron enqueue failed"),
            }
        }
        if !report.enqueued.is_empty() {
            info!(count = report.enqueued.len(), "cron jobs enqueued");
        }
        Ok(report)
    }

    /// Run a cron job in the foreground under its lease.
    ///
    /// # Errors
    ///
    /// Returns the job's error, or a store error if `name` is unknown.
    pub fn run_cron_now(&self, ctx: &C, name: &str) -> Result<(), CronError> {
        let job = self.cron_job(name).ok_or_else(|| StoreError::NotFound {
            kind: "CronJob".to_string(),
            key: name.to_string(),
        })?;
        let _lease = LeaseGuard::acquire_or_busy(ctx.store(), &job_lease(name), CRON_LEASE)?;
        self.run_job(ctx, job)
    }

    pub(crate) fn exec_cron(&self, ctx: &C, args: serde_json::Value) -> Result<(), TaskError> {
        let args: CronArgs = serde_json::from_value(args)
            .map_err(|err| TaskError::Failed(anyhow::anyhow!("bad cron arguments: {err}")))?;
        let Some(job) = self.cron_job(&args.job) else {
            warn!(job = %args.job, "cron job no longer registered");
            return Ok(());
        };
        let store = ctx.store();
        let Some(_lease) = LeaseGuard::acquire(store, &job_lease(&job.name), CRON_LEASE) else {
            info!(job = %job.name, "cron job already running");
            return Ok(());
        };

        let result = self.run_job(ctx, job);
        let outcome = match &result {
            Ok(()) => "ok".to_string(),
            Err(CronError::MoreWork) => "more work".to_string(),
            Err(CronError::Failed(err)) => format!("failed: {err:#}"),
        };
        let run = CronRun {
            at: store.now(),
            outcome,
        };
        if let Err(err) = store.write_meta(&last_run_key(&job.name), &run) {
            warn!(job = %job.name, error = %err, "recording cron run failed");
        }

        match result {
            Ok(()) => Ok(()),
            Err(CronError::MoreWork) => {
                info!(job = %job.name, "cron job has more work");
                Err(TaskError::Retry)
            }
            Err(CronError::Failed(err)) => {
                // The next period retries; the task itself is done.
                error!(job = %job.name, error = %format!("{err:#}"), "cron job failed");
                Ok(())
            }
        }
    }

    fn run_job(&self, ctx: &C, job: &CronJob<C>) -> Result<(), CronError> {
        match &job.action {
            CronAction::Func(run) => run(ctx),
            CronAction::Scan(scan) => self.dispatch_scan(ctx, scan),
            CronAction::Update => self.dispatch_updates(ctx),
        }
    }
}

/// Lease serializing executions of one cron job.
#[must_use]
pub fn job_lease(job: &str) -> String {
    format!("{CRON_FUNC}.{job}")
}
