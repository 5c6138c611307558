//! Incremental CL search and the CL merge.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::client::{ReviewService, SearchQuery, trim_fraction};
use super::{AXES, CL_COUNT_KEY, Cl, ReviewTodo, checkpoint_key};
use crate::config::ReviewConfig;
use crate::jobs::CronError;
use crate::store::{Record, Store, StoreError};

/// Cron job name of the search loader.
pub const LOAD_JOB: &str = "codereview.load";

/// Merge freshly fetched `cl` into the store.
///
/// Only server-owned fields are copied over the stored record; messages
/// and the submitted flag only when `cl.messages_loaded`. A copy without
/// messages resets `messages_loaded` unless its modification time matches
/// the stored one. A changed patch set list clears `patch_sets_loaded`.
/// A dead `cl` only tombstones the stored record. When `checkpoint` is given, the meta key is set to the
/// value in the same transaction.
///
/// # Errors
///
/// [`StoreError::Stale`] when the stored copy is newer than `cl`, or any
/// store failure. Nothing is written on error.
pub fn write_cl(store: &Store, cl: &Cl, checkpoint: Option<(&str, &str)>) -> Result<(), StoreError> {
    let result = store.transaction(|tx| {
        let stored = tx.try_get::<Cl>(&cl.cl)?;
        if stored.is_none() {
            tx.bump_counter(CL_COUNT_KEY, 1)?;
        }
        let mut old = stored.unwrap_or_default();
        old.cl.clone_from(&cl.cl);

        if cl.dead {
            old.dead = true;
        } else {
            old.dead = false;
            if old.modified > cl.modified {
                return Err(StoreError::Stale {
                    kind: Cl::KIND.to_string(),
                    key: cl.cl.clone(),
                    stored: old.modified,
                    incoming: cl.modified,
                });
            }
            old.desc.clone_from(&cl.desc);
            old.owner.clone_from(&cl.owner);
            old.owner_email.clone_from(&cl.owner_email);
            // The search boundary is inclusive, so the newest CL comes back
            // on every pass; an unchanged copy keeps its loaded thread.
            let unchanged = old.modified == cl.modified;
            old.created = cl.created;
            old.modified = cl.modified;
            old.messages_loaded = cl.messages_loaded || (unchanged && old.messages_loaded);
            if cl.messages_loaded {
                old.messages.clone_from(&cl.messages);
                old.submitted = cl.submitted;
            }
            old.reviewers.clone_from(&cl.reviewers);
            old.cc.clone_from(&cl.cc);
            old.closed = cl.closed;
            if old.patch_sets != cl.patch_sets {
                old.patch_sets.clone_from(&cl.patch_sets);
                old.patch_sets_loaded = false;
            }
        }

        tx.put(&cl.cl, &mut old)?;
        if let Some((key, value)) = checkpoint {
            tx.write_meta(key, value)?;
        }
        Ok(())
    });
    if let Err(err) = &result {
        warn!(cl = %cl.cl, code = %err.code(), error = %err, "storing CL failed");
    }
    result
}

/// Outcome of one loader pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub pages: usize,
    pub merged: usize,
    pub failed: usize,
}

/// Starting point of one axis: an interrupted pass, else the checkpoint.
fn resume_point(
    store: &Store,
    cfg: &ReviewConfig,
    dev: bool,
    axis: &str,
    group: &str,
) -> Result<(String, String), StoreError> {
    if let Some(todo) = store.try_get::<ReviewTodo>(&ReviewTodo::key(axis, group))? {
        return Ok((todo.modified_after, todo.cursor));
    }
    let stored = store.read_meta::<String>(&checkpoint_key(axis, group))?;
    let mtime = match stored {
        Some(at) => at,
        // Keeps an empty development store from fetching all of history.
        None if dev => cfg.dev_start.clone(),
        None => String::new(),
    };
    Ok((trim_fraction(&mtime).to_string(), String::new()))
}

/// Pull every CL modified since the checkpoints, for each group and axis.
///
/// # Errors
///
/// [`CronError::MoreWork`] when `deadline` passed with pages left; the
/// position is saved as a [`ReviewTodo`] and the next run resumes there.
/// A failing search only ends that axis; a failing merge only skips that CL.
pub fn load(
    store: &Store,
    service: &dyn ReviewService,
    cfg: &ReviewConfig,
    dev: bool,
    deadline: DateTime<Utc>,
) -> Result<LoadReport, CronError> {
    let mut report = LoadReport::default();
    for group in &cfg.groups {
        for axis in AXES {
            if load_axis(store, service, cfg, dev, axis, group, deadline, &mut report)? {
                info!(axis, group = %group, "more to do; rescheduling");
                return Err(CronError::MoreWork);
            }
        }
    }
    info!(pages = report.pages, merged = report.merged, failed = report.failed, "codereview load done");
    Ok(report)
}

/// Returns whether the deadline interrupted the pass.
#[allow(clippy::too_many_arguments)]
fn load_axis(
    store: &Store,
    service: &dyn ReviewService,
    cfg: &ReviewConfig,
    dev: bool,
    axis: &str,
    group: &str,
    deadline: DateTime<Utc>,
    report: &mut LoadReport,
) -> Result<bool, StoreError> {
    let mtime_key = checkpoint_key(axis, group);
    let todo_key = ReviewTodo::key(axis, group);
    let address = format!("{group}@{}", cfg.group_domain);
    let (modified_after, mut cursor) = resume_point(store, cfg, dev, axis, group)?;

    loop {
        let query = SearchQuery {
            axis,
            group: &address,
            modified_after: &modified_after,
            cursor: &cursor,
            limit: cfg.page_size,
        };
        let page = match service.search(&query) {
            Ok(page) => page,
            Err(err) => {
                error!(axis, group, code = %err.code(), error = %err, "codereview search failed");
                return Ok(false);
            }
        };
        report.pages += 1;
        info!(axis, group, found = page.results.len(), "codereview search page");
        if page.results.is_empty() {
            store.delete(ReviewTodo::KIND, &todo_key)?;
            return Ok(false);
        }
        cursor = page.cursor;

        for jcl in &page.results {
            match write_cl(store, &jcl.to_cl(), Some((&mtime_key, &jcl.modified))) {
                Ok(()) => report.merged += 1,
                Err(_) => report.failed += 1,
            }
        }

        if page.results.len() < cfg.page_size {
            info!(axis, group, "codereview search up to date");
            store.delete(ReviewTodo::KIND, &todo_key)?;
            return Ok(false);
        }

        if store.now() > deadline {
            let mut todo = ReviewTodo {
                dv: 0,
                axis: axis.to_string(),
                group: group.to_string(),
                modified_after,
                cursor,
            };
            store.put(&todo_key, &mut todo)?;
            return Ok(true);
        }
    }
}
