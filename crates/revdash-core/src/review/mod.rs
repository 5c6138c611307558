//! Code-review domain: CL records mirrored from the review server, their
//! derived review state, and the jobs that keep them current.

pub mod client;
pub mod derive;
pub mod edit;
pub mod followup;
pub mod http;
pub mod load;
pub mod reviewers;

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ReviewConfig;
use crate::store::{DataKinds, KindSpec, Query, Record, Store};
pub use client::{Comment, Credentials, ReviewService, SearchPage, SearchQuery, Session};
pub use derive::ClDeriver;
pub use reviewers::{CLOSE, ReviewerDirectory};

/// Current layout version of [`Cl`].
pub const CL_VERSION: u32 = 20;

/// Meta counter of distinct CLs ever stored.
pub const CL_COUNT_KEY: &str = "codereview.count";

/// Search axes: CLs where a group is a reviewer, and where it is cc'd.
pub const AXES: [&str; 2] = ["reviewer", "cc"];

/// A change list as mirrored from the review server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cl {
    pub dv: u32,

    // Mirrored from the review server; the merge in `load` copies these.
    pub cl: String,
    pub desc: String,
    pub owner: String,
    pub owner_email: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub reviewers: Vec<String>,
    pub cc: Vec<String>,
    pub closed: bool,
    pub submitted: bool,
    pub patch_sets: Vec<String>,

    // Owned locally.
    /// Removed from the server.
    pub dead: bool,
    pub messages_loaded: bool,
    /// Patch sets have been stored as [`Patch`] records.
    pub patch_sets_loaded: bool,
    /// Repository, learned from patch sets or the mail text.
    pub repo: String,
    /// Files in the latest patch set, capped.
    pub files: Vec<String>,
    pub more_files: bool,
    pub files_modified: DateTime<Utc>,
    /// Lines added plus removed in the latest patch set.
    pub delta: i64,
    /// Issues already told about this CL.
    pub mailed_issue: Vec<String>,

    // Derived on every read and write.
    pub has_reviewers: bool,
    pub mailed: bool,
    pub summary: String,
    pub active: bool,
    pub primary_reviewer: String,
    pub needs_review: bool,
    pub lgtm: Vec<String>,
    pub notlgtm: Vec<String>,
    /// Issue numbers mentioned in the description.
    pub desc_issue: Vec<String>,
    pub need_mail_issue: Vec<String>,
}

impl Record for Cl {
    const KIND: &'static str = "CL";

    fn data_version(&self) -> u32 {
        self.dv
    }

    fn set_data_version(&mut self, version: u32) {
        self.dv = version;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    pub sender: String,
    pub text: String,
    pub time: DateTime<Utc>,
}

/// One uploaded patch set, keyed `<cl>/<patch set>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Patch {
    pub dv: u32,
    pub cl: String,
    pub patch_set: String,
    pub files: Vec<PatchFile>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub owner: String,
    pub num_comments: i64,
    pub message: String,
}

impl Patch {
    #[must_use]
    pub fn key(cl: &str, patch_set: &str) -> String {
        format!("{cl}/{patch_set}")
    }
}

impl Record for Patch {
    const KIND: &'static str = "Patch";

    fn data_version(&self) -> u32 {
        self.dv
    }

    fn set_data_version(&mut self, version: u32) {
        self.dv = version;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchFile {
    pub name: String,
    pub status: String,
    pub num_chunks: i64,
    pub no_base_file: bool,
    pub property_changes: String,
    pub num_added: i64,
    pub num_removed: i64,
    pub id: String,
    pub is_binary: bool,
}

/// Search pass interrupted by the work deadline, keyed `<axis>.<group>`.
///
/// The next pass resumes from `cursor` instead of the checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewTodo {
    pub dv: u32,
    pub axis: String,
    pub group: String,
    pub modified_after: String,
    pub cursor: String,
}

impl ReviewTodo {
    #[must_use]
    pub fn key(axis: &str, group: &str) -> String {
        format!("{axis}.{group}")
    }
}

impl Record for ReviewTodo {
    const KIND: &'static str = "ReviewTodo";

    fn data_version(&self) -> u32 {
        self.dv
    }

    fn set_data_version(&mut self, version: u32) {
        self.dv = version;
    }
}

/// Register the review record kinds, deriving CLs with `deriver`.
///
/// # Errors
///
/// Fails if a kind is already registered.
pub fn register_kinds(kinds: &mut DataKinds, deriver: Arc<ClDeriver>) -> anyhow::Result<()> {
    kinds.register(
        KindSpec::<Cl>::new(CL_VERSION).derive(move |cl: &mut Cl, now| deriver.derive(cl, now)),
    )?;
    kinds.register(KindSpec::<Patch>::new(1))?;
    kinds.register(KindSpec::<ReviewTodo>::new(1))?;
    Ok(())
}

/// Meta key holding the search checkpoint for one axis and group.
#[must_use]
pub fn checkpoint_key(axis: &str, group: &str) -> String {
    format!("codereview.mtime.{axis}.{group}")
}

/// Scan predicate: CLs whose message thread is not loaded.
#[must_use]
pub fn messages_unloaded() -> Query {
    Query::kind(Cl::KIND).eq("messages_loaded", false)
}

/// Scan predicate: CLs whose patch sets are not loaded.
#[must_use]
pub fn patches_unloaded() -> Query {
    Query::kind(Cl::KIND).eq("patch_sets_loaded", false)
}

/// Scan predicate: active CLs mentioning issues that were not told yet.
#[must_use]
pub fn needs_issue_mail() -> Query {
    Query::kind(Cl::KIND).eq("active", true).non_empty("need_mail_issue")
}

const STATUS_LIMIT: usize = 20_000;

/// Review section of the status dump.
///
/// # Errors
///
/// Returns an error if a meta read or count query fails.
pub fn status(store: &Store, cfg: &ReviewConfig) -> anyhow::Result<String> {
    let mut out = String::new();
    for group in &cfg.groups {
        for axis in AXES {
            let key = checkpoint_key(axis, group);
            let at = store.read_meta::<String>(&key)?.unwrap_or_default();
            writeln!(out, "{at} last update for {key}")?;
        }
    }
    let total = store.read_meta::<i64>(CL_COUNT_KEY)?.unwrap_or(0);
    writeln!(out, "{total} CLs total")?;
    writeln!(
        out,
        "{} with PatchSetsLoaded = false",
        store.count(&patches_unloaded(), STATUS_LIMIT)?
    )?;
    writeln!(
        out,
        "{} with MessagesLoaded = false",
        store.count(&messages_unloaded(), STATUS_LIMIT)?
    )?;
    writeln!(
        out,
        "{} search passes in progress",
        store.count(&Query::kind(ReviewTodo::KIND), STATUS_LIMIT)?
    )?;
    let pending = Query::kind(Cl::KIND)
        .eq("closed", false)
        .eq("submitted", false)
        .eq("has_reviewers", true);
    writeln!(out, "{} pending CLs", store.count(&pending, STATUS_LIMIT)?)?;
    writeln!(
        out,
        "{} CLs need issue mails",
        store.count(&needs_issue_mail(), STATUS_LIMIT)?
    )?;
    Ok(out)
}
