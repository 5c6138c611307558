//! Background version sweep.
//!
//! Reads upgrade records in memory only. This sweep rewrites records stored
//! below their kind's current version, one kind per task, in chunks.

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::Runtime;
use super::cron::CronError;
use super::registry::Registry;
use super::task::{Enqueued, TaskError};
use crate::lease::LeaseGuard;
use crate::store::Store;

/// Task function that sweeps one kind.
pub const UPDATE_FUNC: &str = "app.update";

/// Records rewritten per task execution.
pub const UPDATE_CHUNK: usize = 1000;

/// Upper bound on the stale-record count reported by the status dump.
pub const STATUS_COUNT_LIMIT: usize = 100_000;

pub const UPDATE_LEASE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct UpdateArgs {
    pub(crate) kind: String,
}

/// Rewrite up to `limit` stale records of `kind`.
///
/// Returns `(rewritten, failed, more)` where `more` means the chunk was full.
///
/// # Errors
///
/// Returns an error if the stale keys cannot be listed.
pub fn sweep_kind(
    store: &Store,
    kind: &str,
    limit: usize,
) -> Result<(usize, usize, bool), crate::store::StoreError> {
    let Some(version) = store.kinds().version_of(kind) else {
        return Ok((0, 0, false));
    };
    let keys = store.stale_keys(kind, version, limit)?;
    let mut rewritten = 0;
    let mut failed = 0;
    for key in &keys {
        match store.rewrite(kind, key) {
            Ok(()) => rewritten += 1,
            Err(err) => {
                failed += 1;
                error!(kind, key = %key, error = %err, "record upgrade failed");
            }
        }
    }
    Ok((rewritten, failed, keys.len() == limit && rewritten > 0))
}

impl<C: Runtime> Registry<C> {
    pub(crate) fn dispatch_updates(&self, ctx: &C) -> Result<(), CronError> {
        for (kind, _) in ctx.store().kinds().list() {
            let task = format!("{UPDATE_FUNC}.{kind}");
            let args = UpdateArgs {
                kind: kind.to_string(),
            };
            match self.enqueue(ctx, &task, UPDATE_FUNC, &args)? {
                Enqueued::Queued => debug!(kind, "version sweep queued"),
                Enqueued::AlreadyPending => {}
            }
        }
        Ok(())
    }

    pub(crate) fn exec_update(&self, ctx: &C, args: serde_json::Value) -> Result<(), TaskError> {
        let args: UpdateArgs = serde_json::from_value(args)
            .map_err(|err| TaskError::Failed(anyhow::anyhow!("bad update arguments: {err}")))?;
        let store = ctx.store();
        let lease = format!("{UPDATE_FUNC}.{}", args.kind);
        let Some(_guard) = LeaseGuard::acquire(store, &lease, UPDATE_LEASE) else {
            debug!(kind = %args.kind, "version sweep already running");
            return Ok(());
        };
        let (rewritten, failed, more) = sweep_kind(store, &args.kind, UPDATE_CHUNK)?;
        if rewritten > 0 || failed > 0 {
            info!(kind = %args.kind, rewritten, failed, "records upgraded");
        }
        if more {
            return Err(TaskError::Retry);
        }
        Ok(())
    }
}

/// Stale record counts per kind, one line each.
///
/// # Errors
///
/// Returns an error if a count query fails.
pub fn status_lines(store: &Store) -> anyhow::Result<String> {
    let mut out = String::new();
    for (kind, version) in store.kinds().list() {
        let stale = store.stale_keys(kind, version, STATUS_COUNT_LIMIT)?.len();
        writeln!(out, "{kind}: {stale} remaining to update to version {version}")?;
    }
    Ok(out)
}
