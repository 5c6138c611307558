//! Scan-and-dispatch: a periodic query fans out one task per matching
//! record. The per-record lease `scan.<kind>.<key>` keeps a manual run and
//! a background run of the same record from overlapping.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::Runtime;
use super::cron::CronError;
use super::registry::Registry;
use super::task::{Enqueued, TaskError};
use crate::lease::LeaseGuard;

/// Task function that runs one scan handler on one record.
pub const SCAN_FUNC: &str = "app.scandata";
/// Cron jobs for scans are named `app.scan.<scan>`.
pub const SCAN_JOB_PREFIX: &str = "app.scan";

/// Most keys dispatched by one scan run.
pub const SCAN_LIMIT: usize = 100_000;

/// Lease held while any scan handler works on one record.
pub const SCAN_LEASE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ScanArgs {
    pub(crate) scan: String,
    pub(crate) kind: String,
    pub(crate) key: String,
}

/// Lease name for work on one record.
#[must_use]
pub fn scan_lease(kind: &str, key: &str) -> String {
    format!("scan.{kind}.{key}")
}

impl<C: Runtime> Registry<C> {
    pub(crate) fn dispatch_scan(&self, ctx: &C, name: &str) -> Result<(), CronError> {
        let scan = self
            .scans
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("scan {name} is not registered"))?;
        let kind = scan.query.kind_name();
        let keys = ctx.store().keys(&scan.query, SCAN_LIMIT)?;
        if keys.len() == SCAN_LIMIT {
            warn!(scan = name, limit = SCAN_LIMIT, "scan hit its key limit");
        }

        let mut queued = 0_usize;
        for key in &keys {
            let args = ScanArgs {
                scan: name.to_string(),
                kind: kind.to_string(),
                key: key.clone(),
            };
            let task = format!("{SCAN_FUNC}.{name}.{kind}.{key}");
            match self.enqueue(ctx, &task, SCAN_FUNC, &args) {
                Ok(Enqueued::Queued) => queued += 1,
                Ok(Enqueued::AlreadyPending) => {}
                Err(err) => error!(scan = name, key = %key, error = %err, "scan enqueue failed"),
            }
        }
        info!(scan = name, matched = keys.len(), queued, "scan dispatched");
        Ok(())
    }

    pub(crate) fn exec_scan(&self, ctx: &C, args: serde_json::Value) -> Result<(), TaskError> {
        let args: ScanArgs = serde_json::from_value(args)
            .map_err(|err| TaskError::Failed(anyhow::anyhow!("bad scan arguments: {err}")))?;
        let Some(scan) = self.scans.get(&args.scan) else {
            warn!(scan = %args.scan, "scan no longer registered");
            return Ok(());
        };
        let lease = scan_lease(&args.kind, &args.key);
        let Some(_guard) = LeaseGuard::acquire(ctx.store(), &lease, SCAN_LEASE) else {
            debug!(lease = %lease, "record busy; the next scan will pick it up");
            return Ok(());
        };
        if let Err(err) = (scan.handler)(ctx, &args.kind, &args.key) {
            // Not retried: a record that still matches is found again next period.
            error!(
                scan = %args.scan,
                kind = %args.kind,
                key = %args.key,
                error = %format!("{err:#}"),
                "scan handler failed"
            );
        }
        Ok(())
    }

    /// Run scan `name`'s handler on one record now, under the record lease.
    ///
    /// # Errors
    ///
    /// Fails if the scan is unknown, the record is busy, or the handler fails.
    pub fn run_scan_now(&self, ctx: &C, name: &str, key: &str) -> anyhow::Result<()> {
        let scan = self
            .scans
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("scan {name} is not registered"))?;
        let kind = scan.query.kind_name();
        let _guard = LeaseGuard::acquire_or_busy(ctx.store(), &scan_lease(kind, key), SCAN_LEASE)?;
        (scan.handler)(ctx, kind, key)
    }
}
