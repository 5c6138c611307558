//! Persisted task queue.
//!
//! A task is a named row in `tasks`. Enqueueing a name that is already
//! pending is a no-op, so deterministic names collapse duplicate work.
//! Execution removes the row on success and reschedules it with backoff on
//! failure until the function's retry limit is spent.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::registry::Registry;
use super::{RetryPolicy, Runtime};
use crate::clock;
use crate::error::ErrorCode;
use crate::lease::LeaseGuard;
use crate::store::{Store, StoreError};

/// Upper bound on one task execution; also the per-name execution lease.
pub const TASK_EXEC_LEASE: Duration = Duration::from_secs(15 * 60);

const DUE_BATCH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Run again after the retry delay.
    #[error("task asked to be retried")]
    Retry,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    AlreadyPending,
}

/// One row of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingTask {
    pub name: String,
    pub func: String,
    pub args: serde_json::Value,
    pub attempts: u32,
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Summary of one [`Registry::run_pending`] drain.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct WorkReport {
    pub succeeded: usize,
    pub retried: usize,
    pub dropped: usize,
    /// Skipped because another worker holds the task's execution lease.
    pub busy: usize,
    /// Earliest `not_before` still in the queue after the drain.
    pub next_due: Option<DateTime<Utc>>,
}

impl WorkReport {
    #[must_use]
    pub const fn executed(&self) -> usize {
        self.succeeded + self.retried + self.dropped
    }
}

enum Outcome {
    Done,
    Retried,
    Dropped,
    Busy,
}

/// Add a task unless one with the same name is already pending.
///
/// A pending row older than `retention` is treated as abandoned and
/// replaced.
///
/// # Errors
///
/// Returns an error if the arguments cannot be encoded or the write fails.
pub fn enqueue<A: Serialize + ?Sized>(
    store: &Store,
    name: &str,
    func: &str,
    args: &A,
    retention: Duration,
) -> Result<Enqueued, StoreError> {
    let args = serde_json::to_string(args)?;
    store.transaction(|tx| {
        let now = tx.now();
        let conn = store.conn();
        let created: Option<i64> = conn
            .query_row(
                "SELECT created_at_us FROM tasks WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(created) = created {
            let cutoff = clock::before(now, retention).timestamp_micros();
            if created > cutoff {
                return Ok(Enqueued::AlreadyPending);
            }
            warn!(task = name, "replacing abandoned task");
        }
        conn.execute(
            "INSERT OR REPLACE INTO tasks
                (name, func, args_json, attempts, not_before_us, created_at_us, last_error)
             VALUES (?1, ?2, ?3, 0, ?4, ?4, NULL)",
            params![name, func, args, now.timestamp_micros()],
        )?;
        Ok(Enqueued::Queued)
    })
}

/// Every queued task, soonest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list(store: &Store, limit: usize) -> Result<Vec<PendingTask>, StoreError> {
    select(
        store,
        "SELECT name, func, args_json, attempts, not_before_us, created_at_us, last_error
         FROM tasks ORDER BY not_before_us, name LIMIT ?1",
        params![i64::try_from(limit).unwrap_or(i64::MAX)],
    )
}

/// Number of queued tasks and how many of them are due now.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn counts(store: &Store) -> Result<(u64, u64), StoreError> {
    let now = store.now().timestamp_micros();
    let (total, due): (i64, i64) = store.conn().query_row(
        "SELECT COUNT(*), COALESCE(SUM(not_before_us <= ?1), 0) FROM tasks",
        params![now],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((
        u64::try_from(total).unwrap_or(0),
        u64::try_from(due).unwrap_or(0),
    ))
}

/// Remove a queued task by name. Returns whether it existed.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub fn remove(store: &Store, name: &str) -> Result<bool, StoreError> {
    Ok(store
        .conn()
        .execute("DELETE FROM tasks WHERE name = ?1", params![name])?
        > 0)
}

/// The queued task called `name`, if any.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(store: &Store, name: &str) -> Result<Option<PendingTask>, StoreError> {
    Ok(select(
        store,
        "SELECT name, func, args_json, attempts, not_before_us, created_at_us, last_error
         FROM tasks WHERE name = ?1",
        params![name],
    )?
    .pop())
}

/// One page of due tasks, skipping the first `offset`.
fn due(store: &Store, now: DateTime<Utc>, offset: usize) -> Result<Vec<PendingTask>, StoreError> {
    select(
        store,
        "SELECT name, func, args_json, attempts, not_before_us, created_at_us, last_error
         FROM tasks WHERE not_before_us <= ?1 ORDER BY not_before_us, name LIMIT ?2 OFFSET ?3",
        params![
            now.timestamp_micros(),
            i64::try_from(DUE_BATCH).unwrap_or(i64::MAX),
            i64::try_from(offset).unwrap_or(i64::MAX)
        ],
    )
}

fn next_not_before(store: &Store) -> Result<Option<DateTime<Utc>>, StoreError> {
    let us: Option<i64> = store
        .conn()
        .query_row("SELECT MIN(not_before_us) FROM tasks", [], |row| row.get(0))?;
    Ok(us.and_then(DateTime::from_timestamp_micros))
}

fn select(
    store: &Store,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<PendingTask>, StoreError> {
    let mut stmt = store.conn().prepare_cached(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(name, func, args, attempts, not_before, created, last_error)| {
            let args = serde_json::from_str(&args).map_err(|source| StoreError::Decode {
                kind: "Task".to_string(),
                key: name.clone(),
                source,
            })?;
            Ok(PendingTask {
                name,
                func,
                args,
                attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
                not_before: from_micros(not_before),
                created_at: from_micros(created),
                last_error,
            })
        })
        .collect()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl<C: Runtime> Registry<C> {
    /// Queue `func(args)` under `name`. See [`enqueue`].
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments cannot be encoded or the write fails.
    pub fn enqueue<A: Serialize + ?Sized>(
        &self,
        ctx: &C,
        name: &str,
        func: &str,
        args: &A,
    ) -> Result<Enqueued, StoreError> {
        enqueue(ctx.store(), name, func, args, self.retention)
    }

    /// Execute due tasks until the queue has nothing due or `deadline`
    /// passes.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue itself cannot be read or updated;
    /// task failures are recorded on the task.
    pub fn run_pending(&self, ctx: &C, deadline: DateTime<Utc>) -> Result<WorkReport, StoreError> {
        let store = ctx.store();
        let mut report = WorkReport::default();
        // Each task runs at most once per drain.
        let mut visited: HashSet<String> = HashSet::new();
        // Busy tasks keep their place in the queue; a page of nothing but
        // visited tasks moves on to the next page.
        let mut offset = 0;

        'drain: loop {
            let now = store.now();
            if now >= deadline {
                debug!("work deadline reached");
                break;
            }
            let batch = due(store, now, offset)?;
            let full = batch.len() == DUE_BATCH;
            let mut progressed = false;
            for task in batch {
                if !visited.insert(task.name.clone()) {
                    continue;
                }
                if store.now() >= deadline {
                    break 'drain;
                }
                progressed = true;
                match self.execute(ctx, task)? {
                    Outcome::Done => report.succeeded += 1,
                    Outcome::Retried => report.retried += 1,
                    Outcome::Dropped => report.dropped += 1,
                    Outcome::Busy => report.busy += 1,
                }
            }
            if progressed {
                offset = 0;
            } else if full {
                offset += DUE_BATCH;
            } else {
                break;
            }
        }

        report.next_due = next_not_before(store)?;
        Ok(report)
    }

    /// Run one task now, regardless of its `not_before`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no such task is queued.
    pub fn run_task_now(&self, ctx: &C, name: &str) -> Result<WorkReport, StoreError> {
        let store = ctx.store();
        let task = get(store, name)?.ok_or_else(|| StoreError::NotFound {
                kind: "Task".to_string(),
                key: name.to_string(),
            })?;
        let mut report = WorkReport::default();
        match self.execute(ctx, task)? {
            Outcome::Done => report.succeeded = 1,
            Outcome::Retried => report.retried = 1,
            Outcome::Dropped => report.dropped = 1,
            Outcome::Busy => report.busy = 1,
        }
        report.next_due = next_not_before(store)?;
        Ok(report)
    }

    fn execute(&self, ctx: &C, task: PendingTask) -> Result<Outcome, StoreError> {
        let store = ctx.store();
        let lease = format!("TaskExec.{}", task.name);
        let Some(_guard) = LeaseGuard::acquire(store, &lease, TASK_EXEC_LEASE) else {
            debug!(task = %task.name, "task already executing elsewhere");
            return Ok(Outcome::Busy);
        };

        let Some((policy, result)) = self.dispatch(ctx, &task) else {
            error!(
                task = %task.name,
                func = %task.func,
                code = ErrorCode::UnknownTaskFunc.code(),
                "unknown task function; dropping task"
            );
            remove(store, &task.name)?;
            return Ok(Outcome::Dropped);
        };

        match result {
            Ok(()) => {
                debug!(task = %task.name, "task done");
                remove(store, &task.name)?;
                Ok(Outcome::Done)
            }
            Err(err) => self.reschedule(store, &task, policy, &err),
        }
    }

    fn dispatch(
        &self,
        ctx: &C,
        task: &PendingTask,
    ) -> Option<(RetryPolicy, Result<(), TaskError>)> {
        let args = task.args.clone();
        match task.func.as_str() {
            super::cron::CRON_FUNC => Some((RetryPolicy::CRON, self.exec_cron(ctx, args))),
            super::scan::SCAN_FUNC => Some((RetryPolicy::SCAN, self.exec_scan(ctx, args))),
            super::update::UPDATE_FUNC => Some((RetryPolicy::CRON, self.exec_update(ctx, args))),
            other => self
                .tasks
                .get(other)
                .map(|func| (func.policy, (func.run)(ctx, args))),
        }
    }

    fn reschedule(
        &self,
        store: &Store,
        task: &PendingTask,
        policy: RetryPolicy,
        err: &TaskError,
    ) -> Result<Outcome, StoreError> {
        let attempts = task.attempts.saturating_add(1);
        let message = match err {
            TaskError::Retry => "retry requested".to_string(),
            TaskError::Failed(e) => format!("{e:#}"),
        };
        if attempts >= policy.limit {
            warn!(task = %task.name, attempts, error = %message, "task retry limit reached; dropping");
            remove(store, &task.name)?;
            return Ok(Outcome::Dropped);
        }

        let delay = policy.delay_for_attempt(task.attempts);
        let not_before = clock::after(store.now(), delay);
        match err {
            TaskError::Retry => info!(task = %task.name, attempts, ?delay, "task rescheduled"),
            TaskError::Failed(_) => {
                warn!(task = %task.name, attempts, ?delay, error = %message, "task failed; will retry");
            }
        }
        store.conn().execute(
            "UPDATE tasks SET attempts = ?2, not_before_us = ?3, last_error = ?4 WHERE name = ?1",
            params![task.name, attempts, not_before.timestamp_micros(), message],
        )?;
        Ok(Outcome::Retried)
    }
}
