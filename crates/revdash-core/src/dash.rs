//! Dashboard assembly: open release issues and active CLs grouped by the
//! directory they are about.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, bail};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::review::{Cl, ReviewerDirectory};
use crate::store::{DataKinds, KindSpec, Query, Record, Store, StoreError};
use crate::tracker::{Issue, open_with_label};

/// Most records of each kind read for one dashboard.
pub const CHUNK: usize = 1000;

/// Description prefixes accepted as a group even when no file is there.
pub const GLOBAL_DIRS: [&str; 2] = ["all", "build"];

/// Group name for items with no directory at all.
pub const UNKNOWN_DIR: &str = "?";

const FIRST_LINE_LEN: usize = 50;

/// CLs untouched this long are flagged old.
const OLD_DAYS: i64 = 7;

/// Per-user dashboard preferences, keyed by the user's address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPref {
    pub dv: u32,
    /// Directories collapsed on this user's dashboard, sorted.
    pub muted: Vec<String>,
}

impl Record for UserPref {
    const KIND: &'static str = "UserPref";

    fn data_version(&self) -> u32 {
        self.dv
    }

    fn set_data_version(&mut self, version: u32) {
        self.dv = version;
    }
}

/// # Errors
///
/// Fails if the kind is already registered.
pub fn register_kinds(kinds: &mut DataKinds) -> anyhow::Result<()> {
    kinds.register(KindSpec::<UserPref>::new(1))?;
    Ok(())
}

/// Directory named by a `dir: text` description, or empty.
///
/// Only the part before the first `,` counts, and it may not contain
/// spaces.
#[must_use]
pub fn desc_dir(desc: &str) -> String {
    let Some((head, _)) = desc.trim().split_once(':') else {
        return String::new();
    };
    let head = head.split_once(',').map_or(head, |(first, _)| first.trim());
    if head.contains(' ') {
        return String::new();
    }
    head.to_string()
}

/// Sort key putting directories of other repositories (`go.net/...`) last.
fn dir_key(dir: &str) -> String {
    if dir.contains('.') {
        format!("\u{7f}{dir}")
    } else {
        dir.to_string()
    }
}

/// Mute `dir` for `user`. Returns whether anything changed.
///
/// # Errors
///
/// Fails on an empty user or directory, or a store failure.
pub fn mute(store: &Store, user: &str, dir: &str) -> anyhow::Result<bool> {
    set_muted(store, user, dir, true)
}

/// Unmute `dir` for `user`. Returns whether anything changed.
///
/// # Errors
///
/// Fails on an empty user or directory, or a store failure.
pub fn unmute(store: &Store, user: &str, dir: &str) -> anyhow::Result<bool> {
    set_muted(store, user, dir, false)
}

fn set_muted(store: &Store, user: &str, dir: &str, muted: bool) -> anyhow::Result<bool> {
    if user.is_empty() {
        bail!("missing user");
    }
    if dir.is_empty() {
        bail!("missing dir");
    }
    let changed = store.transaction(|tx| {
        let mut pref = tx.try_get::<UserPref>(user)?.unwrap_or_default();
        let present = pref.muted.iter().any(|d| d == dir);
        if present == muted {
            return Ok::<_, StoreError>(false);
        }
        if muted {
            pref.muted.push(dir.to_string());
            pref.muted.sort();
        } else {
            pref.muted.retain(|d| d != dir);
        }
        tx.put(user, &mut pref)?;
        Ok(true)
    })?;
    Ok(changed)
}

/// One CL as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClEntry {
    pub cl: Cl,
    /// Primary reviewer, or the default group when nobody is assigned.
    pub reviewer: String,
    pub status: String,
    /// Waiting on the viewer.
    pub todo: bool,
    /// Untouched for a week.
    pub old: bool,
}

/// An issue with the CLs that fix it, or a lone CL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Item {
    pub bug: Option<Issue>,
    pub cls: Vec<ClEntry>,
    pub todo: bool,
}

impl Item {
    fn summary(&self) -> &str {
        match (&self.bug, self.cls.first()) {
            (Some(bug), _) => &bug.summary,
            (None, Some(entry)) => &entry.cl.summary,
            (None, None) => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub dir: String,
    pub muted: bool,
    pub todo: bool,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dashboard {
    /// Reviewer identity of the viewer, empty when anonymous or unknown.
    pub user: String,
    pub groups: Vec<Group>,
}

/// Everything the dashboard needs besides the store.
#[derive(Debug, Clone)]
pub struct DashContext<'a> {
    pub config: &'a Config,
    pub reviewers: &'a ReviewerDirectory,
}

/// Issue numbers a CL says it fixes.
fn fixed_issues(fixes: &Regex, desc: &str) -> Vec<i64> {
    fixes
        .captures_iter(desc)
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .filter(|n| *n > 0)
        .collect()
}

/// Group of an item: a global or matching description prefix, else the
/// most frequent directory, else the description prefix.
fn item_dir(item: &Item, main_repo: &str) -> String {
    if let Some(entry) = item.cls.first() {
        let dirs = entry.cl.dirs(main_repo);
        let desc = desc_dir(&entry.cl.summary);
        if GLOBAL_DIRS.contains(&desc.as_str()) || dirs.contains(&desc) {
            return desc;
        }
        if let Some(first) = dirs.into_iter().next() {
            return first;
        }
        return desc;
    }
    if let Some(bug) = &item.bug {
        let dir = desc_dir(&bug.summary);
        if !dir.is_empty() {
            return dir;
        }
    }
    UNKNOWN_DIR.to_string()
}

fn short_name(email: &str) -> &str {
    email.split_once('@').map_or(email, |(local, _)| local)
}

/// First line of `text`, cut to fifty bytes with an ellipsis.
fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.len() <= FIRST_LINE_LEN {
        return line.to_string();
    }
    let mut end = FIRST_LINE_LEN;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

fn short_list(emails: &[String]) -> String {
    emails
        .iter()
        .map(|e| short_name(e))
        .collect::<Vec<_>>()
        .join(",")
}

/// One-line review status: approvals, reviewer, size, location and the
/// last message.
#[must_use]
pub fn cl_status(cl: &Cl, main_repo: &str) -> String {
    let mut out = format!(
        "LGTM: {} / NOT LGTM: {} / R={} / delta {} / repo {} / dirs {}",
        short_list(&cl.lgtm),
        short_list(&cl.notlgtm),
        short_name(&cl.primary_reviewer),
        cl.delta,
        cl.repo,
        cl.dirs(main_repo).join(" "),
    );
    if let Some(last) = cl.messages.last() {
        out.push_str(&format!(
            " / last update: {} by {} [{}]",
            last.time.format("%Y-%m-%d %H:%M:%S"),
            short_name(&last.sender),
            first_line(&last.text),
        ));
    }
    out
}

/// Build the dashboard as seen by `user` (an address), or anonymously.
///
/// # Errors
///
/// Fails if records cannot be loaded.
pub fn assemble(store: &Store, ctx: &DashContext<'_>, user: Option<&str>) -> anyhow::Result<Dashboard> {
    let fixes = Regex::new(r"Fixes issue (\d+)").context("compiling issue pattern")?;
    let main_repo = &ctx.config.review.main_repo;
    let default_group = ctx.reviewers.default_group();
    let me = user
        .and_then(|u| ctx.reviewers.is_reviewer(u))
        .unwrap_or("")
        .to_string();
    let now = store.now();

    let cls: Vec<Cl> = store
        .load_all::<Cl>(&Query::kind(Cl::KIND).eq("active", true), CHUNK)
        .context("loading CLs")?
        .into_iter()
        .map(|(_, cl)| cl)
        // Read-time derivation may have aged some out.
        .filter(|cl| cl.active)
        .collect();
    let bugs: Vec<Issue> = store
        .load_all::<Issue>(&open_with_label(&ctx.config.dashboard.release_label), CHUNK)
        .context("loading issues")?
        .into_iter()
        .map(|(_, issue)| issue)
        .collect();

    let is_me = |who: &str| who == me || who == default_group;
    let entry = |cl: Cl| {
        let reviewer = if cl.primary_reviewer.is_empty() {
            default_group.to_string()
        } else {
            cl.primary_reviewer.clone()
        };
        let todo = if cl.needs_review {
            is_me(&reviewer)
        } else {
            is_me(&cl.owner_email)
        };
        ClEntry {
            status: cl_status(&cl, main_repo),
            old: now - cl.modified > Duration::days(OLD_DAYS),
            reviewer,
            todo,
            cl,
        }
    };

    let mut items: Vec<Item> = bugs
        .into_iter()
        .map(|bug| Item {
            bug: Some(bug),
            cls: Vec::new(),
            todo: false,
        })
        .collect();
    let by_bug: HashMap<i64, usize> = items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| item.bug.as_ref().map(|b| (b.id, i)))
        .collect();

    for cl in cls {
        let targets: Vec<usize> = fixed_issues(&fixes, &cl.desc)
            .into_iter()
            .filter_map(|id| by_bug.get(&id).copied())
            .collect();
        if targets.is_empty() {
            items.push(Item {
                bug: None,
                cls: vec![entry(cl)],
                todo: false,
            });
            continue;
        }
        for i in targets {
            items[i].cls.push(entry(cl.clone()));
        }
    }

    let pref = match user {
        Some(u) if !u.is_empty() => store.try_get::<UserPref>(u)?.unwrap_or_default(),
        _ => UserPref::default(),
    };

    let mut groups: BTreeMap<String, Group> = BTreeMap::new();
    for mut item in items {
        item.todo = item.cls.iter().any(|c| c.todo);
        let dir = item_dir(&item, main_repo);
        let group = groups.entry(dir_key(&dir)).or_insert_with(|| Group {
            muted: pref.muted.contains(&dir),
            dir,
            todo: false,
            items: Vec::new(),
        });
        group.todo |= item.todo;
        group.items.push(item);
    }
    for group in groups.values_mut() {
        group.items.sort_by(|a, b| a.summary().cmp(b.summary()));
    }

    Ok(Dashboard {
        user: me,
        groups: groups.into_values().collect(),
    })
}

/// Age of `at` in days, to one decimal.
#[must_use]
pub fn since(now: DateTime<Utc>, at: DateTime<Utc>) -> String {
    let hours = (now - at).num_hours();
    format!("{}.{} days ago", hours / 24, (hours % 24) * 10 / 24)
}
