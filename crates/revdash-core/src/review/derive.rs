//! Review state derived from a CL's raw fields.
//!
//! Primary reviewer priority:
//! 1. if submitted, the first LGTM
//! 2. the last explicit `R=` line
//! 3. the target of the initial review request
//! 4. the first reviewer-class responder other than the owner

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use super::reviewers::{CLOSE, ReviewerDirectory};
use super::{Cl, Message};
use crate::config::ReviewConfig;

/// Max bytes in a CL summary line.
pub const SUMMARY_LEN: usize = 100;

/// CLs untouched for longer than this are not active.
pub const ACTIVE_WINDOW_DAYS: i64 = 365;

/// Marker the server appends when a CL is committed.
pub const SUBMITTED_MARKER: &str = "*** Submitted as";

/// Penalty keeping `test` from being picked as the most frequent directory.
const TEST_DIR_PENALTY: i64 = 10_000;

/// Compiled message and description patterns.
#[derive(Debug, Clone)]
pub struct Patterns {
    reviewer: Regex,
    lgtm: Regex,
    notlgtm: Regex,
    hello: Regex,
    hello_repo: Regex,
    hello_repo_hosted: Regex,
    ptal: Regex,
    issue: Regex,
    diff: Regex,
    diff_hosted: Regex,
    diff_hosted_sub: Regex,
}

impl Patterns {
    /// # Errors
    ///
    /// Returns an error if a pattern fails to compile.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            reviewer: Regex::new(r"(?m)^(?:TB)?R=([\w\-.]+)\b")?,
            lgtm: Regex::new(r"(?im)^LGTM")?,
            notlgtm: Regex::new(r"(?im)^NOT LGTM")?,
            hello: Regex::new(
                r"(?m)Hello ([\w\-.]+)[ ,@][^\n]*\s+^I'd like you to review this change",
            )?,
            hello_repo: Regex::new(
                r"(?m)Hello[^\n]+\n\nI'd like you to review this change to\nhttps?://(?:[^/]*@)?(code\.google\.com/[pr]/[a-z0-9_.\-]+)",
            )?,
            hello_repo_hosted: Regex::new(
                r"(?m)Hello[^\n]+\n\nI'd like you to review this change to\nhttps?://(?:[^/]*@)?([a-z0-9_\-]+)\.googlecode\.com",
            )?,
            ptal: Regex::new(r"(?im)^(PTAL|Please take a(nother)? look|I'd like you to review this change)")?,
            issue: Regex::new(r"(?i)\bissue ([0-9]+)\b")?,
            diff: Regex::new(
                r"diff -r [0-9a-f]+ https?://(?:[^/]*@)?(code\.google\.com/[pr]/[a-z0-9_.\-]+)",
            )?,
            diff_hosted: Regex::new(
                r"diff -r [0-9a-f]+ https?://(?:[^/]*@)?([a-z0-9_\-]+)\.googlecode\.com",
            )?,
            diff_hosted_sub: Regex::new(
                r"diff -r [0-9a-f]+ https?://(?:[^/]*@)?([a-z0-9_\-]+)\.([a-z0-9_\-]+)\.googlecode\.com",
            )?,
        })
    }

    /// Repository named by a patch set's `diff -r <hash> <url>` line.
    #[must_use]
    pub fn repo_from_diff(&self, message: &str) -> Option<String> {
        if let Some(m) = self.diff.captures(message) {
            return Some(m[1].to_string());
        }
        if let Some(m) = self.diff_hosted.captures(message) {
            return Some(format!("code.google.com/p/{}", &m[1]));
        }
        self.diff_hosted_sub
            .captures(message)
            .map(|m| format!("code.google.com/p/{}.{}", &m[2], &m[1]))
    }
}

/// Recomputes derived CL fields. Registered as the `CL` kind's derive hook.
#[derive(Debug, Clone)]
pub struct ClDeriver {
    patterns: Patterns,
    reviewers: ReviewerDirectory,
    repo_host_prefix: String,
    main_repo: String,
}

#[derive(Default)]
struct Thread {
    lgtm: BTreeSet<String>,
    notlgtm: BTreeSet<String>,
    initial: Option<String>,
    first_responder: Option<String>,
    explicit: Option<String>,
}

impl ClDeriver {
    /// # Errors
    ///
    /// Returns an error if a pattern fails to compile.
    pub fn new(
        reviewers: ReviewerDirectory,
        repo_host_prefix: impl Into<String>,
        main_repo: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: Patterns::new()?,
            reviewers,
            repo_host_prefix: repo_host_prefix.into(),
            main_repo: main_repo.into(),
        })
    }

    /// # Errors
    ///
    /// Returns an error if a pattern fails to compile.
    pub fn from_config(cfg: &ReviewConfig) -> Result<Self, regex::Error> {
        Self::new(
            ReviewerDirectory::from_config(cfg),
            cfg.repo_host_prefix.clone(),
            cfg.main_repo.clone(),
        )
    }

    #[must_use]
    pub const fn patterns(&self) -> &Patterns {
        &self.patterns
    }

    #[must_use]
    pub const fn reviewers(&self) -> &ReviewerDirectory {
        &self.reviewers
    }

    /// Recompute every derived field of `cl` as of `now`.
    pub fn derive(&self, cl: &mut Cl, now: DateTime<Utc>) {
        self.parse_messages(cl);
        cl.has_reviewers = !cl.reviewers.is_empty();

        if cl.dead {
            cl.messages_loaded = true;
            cl.patch_sets_loaded = true;
        }

        cl.active = cl.messages_loaded
            && cl.patch_sets_loaded
            && cl.mailed
            && cl.has_reviewers
            && !cl.closed
            && !cl.submitted
            && !cl.dead
            && now.signed_duration_since(cl.modified) < Duration::days(ACTIVE_WINDOW_DAYS)
            && cl.primary_reviewer != CLOSE;

        cl.desc_issue = self
            .patterns
            .issue
            .captures_iter(&cl.desc)
            .map(|m| m[1].to_string())
            .collect();
        cl.desc_issue.sort();
        cl.mailed_issue.sort();

        cl.need_mail_issue.clear();
        if cl.active {
            let mut seen: BTreeSet<&str> = cl.mailed_issue.iter().map(String::as_str).collect();
            for issue in &cl.desc_issue {
                if seen.insert(issue.as_str()) {
                    cl.need_mail_issue.push(issue.clone());
                }
            }
            cl.need_mail_issue.sort();
        }

        if let Some(rest) = cl.repo.strip_prefix(&self.repo_host_prefix) {
            if rest == self.main_repo || rest.starts_with(&format!("{}.", self.main_repo)) {
                cl.repo = rest.to_string();
            }
        }

        cl.summary = summary_line(&cl.desc);
    }

    fn parse_messages(&self, cl: &mut Cl) {
        let p = &self.patterns;
        let owner = self.reviewers.is_reviewer(&cl.owner_email).map(str::to_string);
        let mut t = Thread::default();

        cl.mailed = false;
        cl.submitted = false;
        for m in &cl.messages {
            if self.reviewers.is_reviewer(&m.sender).is_some() {
                if p.notlgtm.is_match(&m.text) {
                    t.notlgtm.insert(m.sender.clone());
                    t.lgtm.remove(&m.sender);
                } else if p.lgtm.is_match(&m.text) {
                    t.lgtm.insert(m.sender.clone());
                    t.notlgtm.remove(&m.sender);
                }
            }
            if let Some(hello) = p.hello.captures(&m.text) {
                cl.mailed = true;
                if let Some(who) = self.reviewers.expand(&hello[1]) {
                    t.initial = Some(who.to_string());
                }
            }
            if cl.repo.is_empty() {
                if let Some(r) = p.hello_repo.captures(&m.text) {
                    cl.repo = r[1].to_string();
                }
            }
            if cl.repo.is_empty() {
                if let Some(r) = p.hello_repo_hosted.captures(&m.text) {
                    cl.repo = format!("code.google.com/p/{}", &r[1]);
                }
            }
            if m.text.contains(SUBMITTED_MARKER) {
                cl.submitted = true;
            }
            if let Some(r) = p.reviewer.captures(&m.text) {
                let named = &r[1];
                if named == CLOSE {
                    t.explicit = Some(CLOSE.to_string());
                } else if self.reviewers.is_group(named) {
                    t.explicit = Some(self.reviewers.default_group().to_string());
                } else if let Some(who) = self.reviewers.expand(named) {
                    t.explicit = Some(who.to_string());
                }
            }
            if t.first_responder.is_none() {
                if let Some(who) = self.reviewers.is_reviewer(&m.sender) {
                    if m.sender != cl.owner_email && owner.as_deref() != Some(who) {
                        t.first_responder = Some(who.to_string());
                    }
                }
            }
        }

        cl.lgtm = t.lgtm.into_iter().collect();
        cl.notlgtm = t.notlgtm.into_iter().collect();

        cl.primary_reviewer = match (cl.submitted, cl.lgtm.first()) {
            (true, Some(first)) => first.clone(),
            _ => t
                .explicit
                .or(t.initial)
                .or(t.first_responder)
                .unwrap_or_default(),
        };
        if !cl.primary_reviewer.is_empty() && cl.primary_reviewer == self.reviewers.default_group() {
            cl.primary_reviewer.clear();
        }

        cl.needs_review = if cl.submitted {
            cl.lgtm.is_empty()
        } else {
            needs_review(&cl.messages, &cl.primary_reviewer, &p.ptal)
        };
    }
}

// A PTAL asks for review; a later message from the primary reviewer answers it.
fn needs_review(messages: &[Message], primary: &str, ptal: &Regex) -> bool {
    let mut needs = false;
    for m in messages {
        if ptal.is_match(&m.text) {
            needs = true;
        }
        if m.sender == primary {
            needs = false;
        }
    }
    needs
}

/// First line of `desc`, trimmed and capped at [`SUMMARY_LEN`] bytes.
#[must_use]
pub fn summary_line(desc: &str) -> String {
    let line = desc.trim().lines().next().unwrap_or("");
    let mut end = line.len().min(SUMMARY_LEN);
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    line[..end].to_string()
}

impl Cl {
    /// Directories this CL might be said to be about, most likely first.
    ///
    /// Files are counted by their parent directory; `src/pkg/` and `src/`
    /// are dropped, and CLs outside `main_repo` are prefixed with their
    /// repository name.
    #[must_use]
    pub fn dirs(&self, main_repo: &str) -> Vec<String> {
        let prefix = if self.repo.is_empty() || self.repo == main_repo {
            String::new()
        } else {
            format!("{}/", self.repo)
        };

        let mut counts: BTreeMap<String, i64> = BTreeMap::new();
        for file in &self.files {
            let parent = file.rfind('/').map_or("", |i| &file[..i]);
            let trimmed = parent.strip_prefix("src/pkg/").unwrap_or(parent);
            let trimmed = trimmed.strip_prefix("src/").unwrap_or(trimmed);
            let trimmed = if trimmed == "src" { "" } else { trimmed };
            let mut name = format!("{prefix}{trimmed}");
            if name.is_empty() {
                name = "build".to_string();
            }
            *counts.entry(name).or_default() += 1;
        }
        if let Some(n) = counts.get_mut("test") {
            *n -= TEST_DIR_PENALTY;
        }

        let mut dirs: Vec<(String, i64)> = counts.into_iter().collect();
        dirs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        dirs.into_iter().map(|(name, _)| name).collect()
    }
}
