//! Issue-tracker domain: issues mirrored from the tracker's Atom feeds.

pub mod atom;
pub mod http;
pub mod load;

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dash::desc_dir;
use crate::remote::FetchError;
use crate::review::derive::summary_line;
use crate::store::{DataKinds, KindSpec, Query, Record, Store};

pub use http::HttpTracker;
pub use load::{ISSUE_COUNT_KEY, ISSUE_MTIME_KEY, LOAD_JOB, SyncError, write_issue};

/// Current layout version of [`Issue`].
pub const ISSUE_VERSION: u32 = 3;

/// An issue on the tracker. The initial report is `comment[0]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Issue {
    pub dv: u32,

    pub id: i64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Single line; newlines in the tracker's title become spaces.
    pub summary: String,
    pub status: String,
    /// Issue this one duplicates, when `status` is `Duplicate`.
    pub duplicate: i64,
    pub owner: String,
    pub cc: Vec<String>,
    pub label: Vec<String>,
    pub comment: Vec<Comment>,
    /// `open` or `closed`.
    pub state: String,
    pub stars: i64,
    pub closed_date: Option<DateTime<Utc>>,

    // Derived.
    pub title: String,
    pub active: bool,
    pub dir: String,
}

impl Record for Issue {
    const KIND: &'static str = "Issue";

    fn data_version(&self) -> u32 {
        self.dv
    }

    fn set_data_version(&mut self, version: u32) {
        self.dv = version;
    }
}

/// One comment, with the field changes it made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Comment {
    pub author: String,
    pub time: DateTime<Utc>,
    pub summary: String,
    pub status: String,
    pub duplicate: i64,
    pub owner: String,
    /// Comma-separated cc changes.
    pub cc: String,
    /// Comma-separated label changes.
    pub label: String,
    pub text: String,
}

/// Recompute the derived fields of `issue`.
pub fn derive_issue(issue: &mut Issue) {
    issue.title = summary_line(&issue.summary);
    issue.active = issue.state == "open";
    issue.dir = desc_dir(&issue.summary);
}

/// A time-windowed feed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedQuery {
    /// `all` or `open`.
    pub can: String,
    pub query: String,
    pub updated_min: DateTime<Utc>,
    pub updated_max: DateTime<Utc>,
    pub max_results: usize,
}

/// The issue tracker.
pub trait IssueTracker: Send + Sync {
    /// Issues updated within the query window, each with its initial report
    /// as the only comment.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] on transport, status or parse failure.
    fn search(&self, query: &FeedQuery) -> Result<Vec<Issue>, FetchError>;

    /// Every comment after the initial report, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] on transport, status or parse failure.
    fn comments(&self, id: &str) -> Result<Vec<Comment>, FetchError>;

    /// Add a comment to issue `id`.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] unless the tracker created the comment.
    fn post_comment(&self, id: &str, text: &str) -> Result<(), FetchError>;
}

/// Register the tracker record kinds.
///
/// # Errors
///
/// Fails if the kind is already registered.
pub fn register_kinds(kinds: &mut DataKinds) -> anyhow::Result<()> {
    kinds.register(
        KindSpec::<Issue>::new(ISSUE_VERSION)
            .migration(3, |issue: &mut Issue| {
                issue.summary = issue.summary.replace('\n', " ");
                Ok(())
            })
            .derive(|issue: &mut Issue, _| derive_issue(issue)),
    )?;
    Ok(())
}

/// Open issues carrying `label`.
#[must_use]
pub fn open_with_label(label: &str) -> Query {
    Query::kind(Issue::KIND)
        .eq("state", "open")
        .contains("label", label)
}

/// Tracker section of the status dump.
///
/// # Errors
///
/// Returns an error if a meta read fails.
pub fn status(store: &Store) -> anyhow::Result<String> {
    let mut out = String::new();
    let count = store.read_meta::<i64>(ISSUE_COUNT_KEY)?.unwrap_or(0);
    writeln!(out, "{count} issues total")?;
    match store.read_meta::<DateTime<Utc>>(ISSUE_MTIME_KEY)? {
        Some(at) => writeln!(out, "issue modifications up to {}", at.to_rfc3339())?,
        None => writeln!(out, "issue modifications never loaded")?,
    }
    Ok(out)
}
