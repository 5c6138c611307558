//! Time-windowed issue polling and the issue merge.

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use super::{FeedQuery, Issue, IssueTracker};
use crate::config::TrackerConfig;
use crate::error::ErrorCode;
use crate::jobs::CronError;
use crate::remote::FetchError;
use crate::store::{Record, Store, StoreError};

/// Cron job name of the issue poller.
pub const LOAD_JOB: &str = "issue.load";

/// Meta key of the poll checkpoint.
pub const ISSUE_MTIME_KEY: &str = "issue.mtime";

/// Meta counter of distinct issues ever stored.
pub const ISSUE_COUNT_KEY: &str = "issue.count";

/// Narrowest window the poller will still try to shrink.
pub const MIN_WINDOW: Duration = Duration::seconds(2);

/// Checkpoint margin behind the end of an empty window ending now.
pub const EMPTY_WINDOW_MARGIN: Duration = Duration::minutes(1);

/// Checkpoint margin behind the end of a shrunk window, so updates sharing
/// the boundary second are fetched again.
pub const SHRUNK_WINDOW_MARGIN: Duration = Duration::seconds(1);

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("more than {max} updates between {start} and {end}; window cannot shrink further")]
    WindowExhausted {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        max: usize,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::WindowExhausted { .. } => ErrorCode::WindowExhausted,
            Self::Fetch(err) => err.code(),
            Self::Store(err) => err.code(),
        }
    }
}

/// Merge a freshly fetched issue: copy the tracker's fields over the
/// stored record, counting first sightings.
///
/// # Errors
///
/// [`StoreError::Stale`] when the stored copy is newer, or any store
/// failure. Nothing is written on error.
pub fn write_issue(store: &Store, issue: &Issue) -> Result<(), StoreError> {
    let key = issue.id.to_string();
    let result = store.transaction(|tx| {
        let stored = tx.try_get::<Issue>(&key)?;
        if stored.is_none() {
            tx.bump_counter(ISSUE_COUNT_KEY, 1)?;
        }
        let mut old = stored.unwrap_or_default();
        if old.modified > issue.modified {
            return Err(StoreError::Stale {
                kind: Issue::KIND.to_string(),
                key: key.clone(),
                stored: old.modified,
                incoming: issue.modified,
            });
        }
        old.id = issue.id;
        old.summary.clone_from(&issue.summary);
        old.status.clone_from(&issue.status);
        old.duplicate = issue.duplicate;
        old.owner.clone_from(&issue.owner);
        old.cc.clone_from(&issue.cc);
        old.label.clone_from(&issue.label);
        old.comment.clone_from(&issue.comment);
        old.state.clone_from(&issue.state);
        old.created = issue.created;
        old.modified = issue.modified;
        old.stars = issue.stars;
        old.closed_date = issue.closed_date;
        tx.put(&key, &mut old)
    });
    if let Err(err) = &result {
        warn!(issue = issue.id, code = %err.code(), error = %err, "storing issue failed");
    }
    result
}

/// Outcome of one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub shrinks: u32,
    pub merged: usize,
    pub skipped: usize,
    pub checkpoint: DateTime<Utc>,
    /// The window was narrowed; the rest of the range is still unread.
    pub more: bool,
}

fn initial_checkpoint(cfg: &TrackerConfig, dev: bool, now: DateTime<Utc>) -> DateTime<Utc> {
    if dev {
        i64::try_from(cfg.dev_window_hours)
            .ok()
            .and_then(Duration::try_hours)
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(cfg.start)
    } else {
        cfg.start
    }
}

/// Narrowed window end: a tenth of a window over an hour, else half.
#[must_use]
pub fn shrink(start: DateTime<Utc>, end: DateTime<Utc>) -> DateTime<Utc> {
    let width = end - start;
    if width > Duration::hours(1) {
        start + width / 10
    } else {
        start + width / 2
    }
}

/// One poll of the tracker from the checkpoint up to now.
///
/// A saturated result page narrows the window and fetches again before
/// anything is merged. Once a page is complete, each issue's comments are
/// fetched and the issue merged; the checkpoint then advances to the
/// latest modification seen, or to just before the narrowed window end.
///
/// # Errors
///
/// A failing search leaves the checkpoint alone and returns
/// [`SyncError::Fetch`]; a window that cannot shrink below [`MIN_WINDOW`]
/// returns [`SyncError::WindowExhausted`].
pub fn poll(
    store: &Store,
    tracker: &dyn IssueTracker,
    cfg: &TrackerConfig,
    dev: bool,
) -> Result<PollReport, SyncError> {
    let now = store.now();
    let start = store
        .read_meta::<DateTime<Utc>>(ISSUE_MTIME_KEY)?
        .unwrap_or_else(|| initial_checkpoint(cfg, dev, now));
    let mut end = now;
    let mut shrinks = 0;

    let issues = loop {
        let query = FeedQuery {
            can: "all".to_string(),
            query: String::new(),
            updated_min: start,
            updated_max: end,
            max_results: cfg.max_results,
        };
        let found = tracker.search(&query).inspect_err(|err| {
            error!(window_start = %start, window_end = %end, code = %err.code(), error = %err, "issue search failed");
        })?;

        if found.is_empty() {
            info!(window_start = %start, window_end = %end, "no issue updates");
            // A narrowed window lies wholly in the past and always ends
            // after `start`.
            let checkpoint = if shrinks > 0 {
                end
            } else {
                (end - EMPTY_WINDOW_MARGIN).max(start)
            };
            store.write_meta(ISSUE_MTIME_KEY, &checkpoint)?;
            return Ok(PollReport {
                window_start: start,
                window_end: end,
                shrinks,
                checkpoint,
                more: shrinks > 0,
                ..PollReport::default()
            });
        }
        if found.len() < cfg.max_results {
            info!(window_start = %start, window_end = %end, found = found.len(), "issue updates");
            break found;
        }

        warn!(window_start = %start, window_end = %end, found = found.len(), "too many issue updates");
        if end - start <= MIN_WINDOW {
            return Err(SyncError::WindowExhausted {
                start,
                end,
                max: cfg.max_results,
            });
        }
        end = shrink(start, end);
        shrinks += 1;
        info!(window_start = %start, window_end = %end, "window shortened");
    };

    let mut report = PollReport {
        window_start: start,
        window_end: end,
        shrinks,
        more: shrinks > 0,
        ..PollReport::default()
    };
    let mut latest = start;
    let mut first_skipped: Option<DateTime<Utc>> = None;
    for mut issue in issues {
        match tracker.comments(&issue.id.to_string()) {
            Ok(comments) => issue.comment.extend(comments),
            Err(err) => {
                warn!(issue = issue.id, code = %err.code(), error = %err, "loading issue comments failed");
                report.skipped += 1;
                first_skipped = Some(first_skipped.map_or(issue.modified, |t| t.min(issue.modified)));
                continue;
            }
        }
        match write_issue(store, &issue) {
            Ok(()) => report.merged += 1,
            Err(StoreError::Stale { .. }) => report.skipped += 1,
            Err(err) => return Err(err.into()),
        }
        latest = latest.max(issue.modified);
    }

    let mut checkpoint = if shrinks > 0 {
        (end - SHRUNK_WINDOW_MARGIN).max(start)
    } else {
        latest
    };
    // Issues whose details failed are fetched again next time.
    if let Some(skipped) = first_skipped {
        checkpoint = checkpoint.min(skipped - SHRUNK_WINDOW_MARGIN).max(start);
    }
    store.write_meta(ISSUE_MTIME_KEY, &checkpoint)?;
    report.checkpoint = checkpoint;
    info!(
        merged = report.merged,
        skipped = report.skipped,
        checkpoint = %checkpoint,
        "issue load done"
    );
    Ok(report)
}

/// The `issue.load` cron job.
///
/// # Errors
///
/// [`CronError::MoreWork`] when the window was narrowed; other failures
/// wait for the next period.
pub fn load(
    store: &Store,
    tracker: &dyn IssueTracker,
    cfg: &TrackerConfig,
    dev: bool,
) -> Result<(), CronError> {
    match poll(store, tracker, cfg, dev) {
        Ok(report) if report.more => Err(CronError::MoreWork),
        Ok(_) => Ok(()),
        Err(err) => {
            error!(code = %err.code(), error = %err, "issue load failed");
            Err(CronError::Failed(err.into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::DataKinds;
    use crate::tracker::{Comment, register_kinds};
    use std::sync::{Arc, Mutex};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_399_996_800 + secs, 0).expect("valid timestamp")
    }

    fn setup(now: DateTime<Utc>) -> Store {
        let mut kinds = DataKinds::default();
        register_kinds(&mut kinds).expect("kinds");
        Store::open_in_memory(Arc::new(kinds), Arc::new(ManualClock::new(now))).expect("store")
    }

    fn cfg(max_results: usize) -> TrackerConfig {
        TrackerConfig {
            max_results,
            start: at(0),
            ..TrackerConfig::default()
        }
    }

    fn issue(id: i64, modified: DateTime<Utc>) -> Issue {
        Issue {
            id,
            modified,
            summary: format!("pkg{id}: broken"),
            state: "open".to_string(),
            ..Issue::default()
        }
    }

    /// Answers each search with `respond(window)`.
    struct Feed<F> {
        respond: F,
        windows: Mutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
        broken_comments: Vec<i64>,
    }

    impl<F> Feed<F>
    where
        F: Fn(DateTime<Utc>, DateTime<Utc>) -> Vec<Issue> + Send + Sync,
    {
        fn new(respond: F) -> Self {
            Self {
                respond,
                windows: Mutex::new(Vec::new()),
                broken_comments: Vec::new(),
            }
        }
    }

    impl<F> IssueTracker for Feed<F>
    where
        F: Fn(DateTime<Utc>, DateTime<Utc>) -> Vec<Issue> + Send + Sync,
    {
        fn search(&self, q: &FeedQuery) -> Result<Vec<Issue>, FetchError> {
            self.windows.lock().expect("lock").push((q.updated_min, q.updated_max));
            Ok((self.respond)(q.updated_min, q.updated_max))
        }

        fn comments(&self, id: &str) -> Result<Vec<Comment>, FetchError> {
            if self.broken_comments.iter().any(|b| b.to_string() == id) {
                return Err(FetchError::Decode {
                    url: id.to_string(),
                    message: "truncated".to_string(),
                });
            }
            Ok(vec![Comment {
                author: "rsc".to_string(),
                text: format!("comment on {id}"),
                ..Comment::default()
            }])
        }

        fn post_comment(&self, _: &str, _: &str) -> Result<(), FetchError> {
            Ok(())
        }
    }

    #[test]
    fn complete_page_merges_and_advances_to_latest() -> anyhow::Result<()> {
        let store = setup(at(3600));
        store.write_meta(ISSUE_MTIME_KEY, &at(0))?;
        let feed = Feed::new(|_, _| vec![issue(1, at(1)), issue(2, at(2)), issue(3, at(5))]);

        let report = poll(&store, &feed, &cfg(500), false)?;
        assert_eq!(report.merged, 3);
        assert!(!report.more);
        assert_eq!(store.read_meta::<DateTime<Utc>>(ISSUE_MTIME_KEY)?, Some(at(5)));
        assert_eq!(store.read_meta::<i64>(ISSUE_COUNT_KEY)?, Some(3));

        let stored: Issue = store.get("3")?;
        assert_eq!(stored.comment.len(), 1);
        assert_eq!(stored.dir, "pkg3");
        assert!(stored.active);
        Ok(())
    }

    #[test]
    fn saturated_page_shrinks_before_merging() -> anyhow::Result<()> {
        let store = setup(at(1800));
        store.write_meta(ISSUE_MTIME_KEY, &at(0))?;
        let feed = Feed::new(|start: DateTime<Utc>, end: DateTime<Utc>| {
            if end - start > Duration::minutes(20) {
                (0..4).map(|i| issue(i, at(i))).collect()
            } else {
                vec![issue(9, at(9))]
            }
        });

        let report = poll(&store, &feed, &cfg(4), false)?;
        let windows = feed.windows.lock().expect("lock").clone();
        assert_eq!(windows, vec![(at(0), at(1800)), (at(0), at(900))]);
        assert_eq!(report.shrinks, 1);
        assert!(report.more);
        assert_eq!(report.merged, 1);
        assert!(store.try_get::<Issue>("0")?.is_none());
        assert_eq!(
            store.read_meta::<DateTime<Utc>>(ISSUE_MTIME_KEY)?,
            Some(at(899))
        );

        store.write_meta(ISSUE_MTIME_KEY, &at(0))?;
        assert!(matches!(load(&store, &feed, &cfg(4), false), Err(CronError::MoreWork)));
        Ok(())
    }

    #[test]
    fn wide_windows_shrink_by_ten() {
        assert_eq!(shrink(at(0), at(36_000)), at(3600));
        assert_eq!(shrink(at(0), at(3600)), at(1800));
        assert_eq!(shrink(at(0), at(3)), at(1) + Duration::milliseconds(500));
    }

    #[test]
    fn endless_saturation_ends_in_an_error() -> anyhow::Result<()> {
        let store = setup(at(86_400 * 30));
        store.write_meta(ISSUE_MTIME_KEY, &at(0))?;
        let feed = Feed::new(|_, _| (0..3).map(|i| issue(i, at(i))).collect());

        let err = poll(&store, &feed, &cfg(3), false).expect_err("exhausted");
        assert!(matches!(err, SyncError::WindowExhausted { .. }));
        assert_eq!(err.code(), ErrorCode::WindowExhausted);
        let windows = feed.windows.lock().expect("lock").len();
        assert!(windows < 64, "{windows} fetches");
        assert_eq!(store.read_meta::<DateTime<Utc>>(ISSUE_MTIME_KEY)?, Some(at(0)));
        assert!(store.try_get::<Issue>("0")?.is_none());
        Ok(())
    }

    #[test]
    fn empty_window_moves_checkpoint_near_now() -> anyhow::Result<()> {
        let store = setup(at(7200));
        let feed = Feed::new(|_, _| Vec::new());
        let report = poll(&store, &feed, &cfg(500), false)?;
        assert_eq!(feed.windows.lock().expect("lock")[0], (at(0), at(7200)));
        assert_eq!(report.checkpoint, at(7140));
        assert_eq!(store.read_meta::<DateTime<Utc>>(ISSUE_MTIME_KEY)?, Some(at(7140)));
        Ok(())
    }

    #[test]
    fn empty_narrowed_window_still_advances() -> anyhow::Result<()> {
        let store = setup(at(40));
        store.write_meta(ISSUE_MTIME_KEY, &at(0))?;
        let feed = Feed::new(|_, end: DateTime<Utc>| {
            if end >= at(30) {
                (0..2).map(|i| issue(i, at(30))).collect()
            } else {
                Vec::new()
            }
        });

        let report = poll(&store, &feed, &cfg(2), false)?;
        assert_eq!(report.shrinks, 1);
        assert!(report.more);
        assert_eq!(report.checkpoint, at(20));
        assert_eq!(store.read_meta::<DateTime<Utc>>(ISSUE_MTIME_KEY)?, Some(at(20)));
        Ok(())
    }

    #[test]
    fn dev_mode_starts_from_a_recent_window() -> anyhow::Result<()> {
        let store = setup(at(86_400 * 10));
        let feed = Feed::new(|_, _| Vec::new());
        poll(&store, &feed, &cfg(500), true)?;
        assert_eq!(feed.windows.lock().expect("lock")[0].0, at(86_400 * 9));
        Ok(())
    }

    #[test]
    fn failed_detail_holds_checkpoint_before_that_issue() -> anyhow::Result<()> {
        let store = setup(at(3600));
        store.write_meta(ISSUE_MTIME_KEY, &at(0))?;
        let mut feed = Feed::new(|_, _| vec![issue(1, at(10)), issue(2, at(20)), issue(3, at(30))]);
        feed.broken_comments = vec![2];

        let report = poll(&store, &feed, &cfg(500), false)?;
        assert_eq!(report.merged, 2);
        assert_eq!(report.skipped, 1);
        assert!(store.try_get::<Issue>("2")?.is_none());
        assert_eq!(store.read_meta::<DateTime<Utc>>(ISSUE_MTIME_KEY)?, Some(at(19)));
        Ok(())
    }

    #[test]
    fn stale_issue_is_rejected() -> anyhow::Result<()> {
        let store = setup(at(3600));
        write_issue(&store, &issue(1, at(10)))?;
        let mut older = issue(1, at(9));
        older.summary = "rewound".to_string();
        let err = write_issue(&store, &older).expect_err("stale");
        assert!(matches!(err, StoreError::Stale { .. }));
        assert_eq!(store.get::<Issue>("1")?.summary, "pkg1: broken");
        assert_eq!(store.read_meta::<i64>(ISSUE_COUNT_KEY)?, Some(1));
        Ok(())
    }

    #[test]
    fn failing_search_keeps_checkpoint() -> anyhow::Result<()> {
        struct Down;
        impl IssueTracker for Down {
            fn search(&self, _: &FeedQuery) -> Result<Vec<Issue>, FetchError> {
                Err(FetchError::Status {
                    url: "feed".to_string(),
                    status: 503,
                    body: String::new(),
                })
            }
            fn comments(&self, _: &str) -> Result<Vec<Comment>, FetchError> {
                Ok(Vec::new())
            }
            fn post_comment(&self, _: &str, _: &str) -> Result<(), FetchError> {
                Ok(())
            }
        }
        let store = setup(at(3600));
        store.write_meta(ISSUE_MTIME_KEY, &at(0))?;
        assert!(matches!(poll(&store, &Down, &cfg(500), false), Err(SyncError::Fetch(_))));
        assert!(matches!(load(&store, &Down, &cfg(500), false), Err(CronError::Failed(_))));
        assert_eq!(store.read_meta::<DateTime<Utc>>(ISSUE_MTIME_KEY)?, Some(at(0)));
        Ok(())
    }
}
