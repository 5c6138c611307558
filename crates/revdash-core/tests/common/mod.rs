//! Shared fixtures: in-process review server and issue tracker, a manual
//! clock, and an application wired to them.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use revdash_core::App;
use revdash_core::clock::ManualClock;
use revdash_core::config::{Config, ReviewConfig, TrackerConfig};
use revdash_core::jobs::Registry;
use revdash_core::remote::FetchError;
use revdash_core::review::client::{JsonCl, JsonFile, JsonMessage, JsonPatch};
use revdash_core::review::{Comment, Credentials, ReviewService, SearchPage, SearchQuery, Session};
use revdash_core::runtime;
use revdash_core::store::Store;
use revdash_core::tracker::{self, FeedQuery, Issue, IssueTracker};

/// 2014-05-13 16:00:00 UTC plus `secs`.
pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_399_996_800 + secs, 0).expect("valid timestamp")
}

/// Review server timestamp text for `at(secs)`.
pub fn server_time(secs: i64) -> String {
    at(secs).format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

pub const GROUP: &str = "golang-codereviews";
pub const GROUP_ADDRESS: &str = "golang-codereviews@googlegroups.com";

pub const HELLO: &str = "Hello gri@golang.org (cc: golang-codereviews@googlegroups.com),\n\n\
I'd like you to review this change to\nhttps://code.google.com/p/go/\n";

pub fn config() -> Config {
    Config {
        review: ReviewConfig {
            groups: vec![GROUP.to_string()],
            committers: vec![
                "gri@golang.org".to_string(),
                "rsc@golang.org".to_string(),
                "adg@golang.org".to_string(),
            ],
            page_size: 10,
            ..ReviewConfig::default()
        },
        tracker: TrackerConfig {
            start: at(-3600),
            max_results: 10,
            ..TrackerConfig::default()
        },
        ..Config::default()
    }
}

#[derive(Debug, Default)]
struct ReviewState {
    cls: BTreeMap<i64, JsonCl>,
    patches: BTreeMap<(i64, i64), JsonPatch>,
    published: Vec<(String, Comment)>,
    searches: usize,
}

/// Review server keeping CLs in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeReview {
    state: Arc<Mutex<ReviewState>>,
}

impl FakeReview {
    pub fn add_cl(&self, cl: JsonCl) {
        self.state.lock().expect("lock").cls.insert(cl.issue, cl);
    }

    pub fn add_patch(&self, patch: JsonPatch) {
        self.state
            .lock()
            .expect("lock")
            .patches
            .insert((patch.issue, patch.patch_set), patch);
    }

    pub fn published(&self) -> Vec<(String, Comment)> {
        self.state.lock().expect("lock").published.clone()
    }

    pub fn searches(&self) -> usize {
        self.state.lock().expect("lock").searches
    }
}

impl ReviewService for FakeReview {
    fn search(&self, q: &SearchQuery<'_>) -> Result<SearchPage, FetchError> {
        let mut state = self.state.lock().expect("lock");
        state.searches += 1;
        let mut matching: Vec<JsonCl> = state
            .cls
            .values()
            .filter(|cl| {
                let list = if q.axis == "cc" { &cl.cc } else { &cl.reviewers };
                list.iter().any(|r| r == q.group) && cl.modified.as_str() >= q.modified_after
            })
            .map(|cl| JsonCl {
                messages: Vec::new(),
                ..cl.clone()
            })
            .collect();
        matching.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.issue.cmp(&b.issue)));
        let offset: usize = q.cursor.parse().unwrap_or(0);
        let results: Vec<JsonCl> = matching.into_iter().skip(offset).take(q.limit).collect();
        Ok(SearchPage {
            cursor: (offset + results.len()).to_string(),
            results,
        })
    }

    fn issue(&self, cl: &str) -> Result<JsonCl, FetchError> {
        let id: i64 = cl.parse().unwrap_or(-1);
        self.state
            .lock()
            .expect("lock")
            .cls
            .get(&id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound { url: cl.to_string() })
    }

    fn patch_set(&self, cl: &str, patch_set: &str) -> Result<JsonPatch, FetchError> {
        let key = (cl.parse().unwrap_or(-1), patch_set.parse().unwrap_or(-1));
        self.state
            .lock()
            .expect("lock")
            .patches
            .get(&key)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                url: format!("{cl}/{patch_set}"),
            })
    }

    fn login(&self, _: &Credentials) -> Result<Session, FetchError> {
        Ok(Session {
            cookie: "session".to_string(),
        })
    }

    fn publish(&self, _: &Session, cl: &str, comment: &Comment) -> Result<(), FetchError> {
        self.state
            .lock()
            .expect("lock")
            .published
            .push((cl.to_string(), comment.clone()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    issues: Vec<Issue>,
    comments: BTreeMap<String, Vec<tracker::Comment>>,
    posts: Vec<(String, String)>,
    windows: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Issue tracker keeping issues in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl FakeTracker {
    pub fn add_issue(&self, issue: Issue) {
        self.state.lock().expect("lock").issues.push(issue);
    }

    pub fn posts(&self) -> Vec<(String, String)> {
        self.state.lock().expect("lock").posts.clone()
    }

    /// Every `[updated_min, updated_max]` searched, in order.
    pub fn windows(&self) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
        self.state.lock().expect("lock").windows.clone()
    }
}

impl IssueTracker for FakeTracker {
    fn search(&self, q: &FeedQuery) -> Result<Vec<Issue>, FetchError> {
        let mut state = self.state.lock().expect("lock");
        state.windows.push((q.updated_min, q.updated_max));
        let mut found: Vec<Issue> = state
            .issues
            .iter()
            .filter(|i| q.updated_min <= i.modified && i.modified <= q.updated_max)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.modified);
        found.truncate(q.max_results);
        Ok(found)
    }

    fn comments(&self, id: &str) -> Result<Vec<tracker::Comment>, FetchError> {
        Ok(self
            .state
            .lock()
            .expect("lock")
            .comments
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    fn post_comment(&self, id: &str, text: &str) -> Result<(), FetchError> {
        self.state
            .lock()
            .expect("lock")
            .posts
            .push((id.to_string(), text.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub app: App,
    pub registry: Registry<App>,
    pub clock: Arc<ManualClock>,
    pub review: FakeReview,
    pub tracker: FakeTracker,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config())
    }

    pub fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::new(at(0)));
        let review = FakeReview::default();
        let tracker = FakeTracker::default();
        let app = App::in_memory(
            config,
            clock.clone(),
            Box::new(review.clone()),
            Box::new(tracker.clone()),
        )
        .expect("app");
        let registry = runtime::registry(app.config(), revdash_core::jobs::Runtime::store(&app).kinds())
            .expect("registry");
        Self {
            app,
            registry,
            clock,
            review,
            tracker,
        }
    }

    pub fn store(&self) -> &Store {
        revdash_core::jobs::Runtime::store(&self.app)
    }

    /// One external trigger: tick, then drain the queue.
    pub fn round(&self) {
        self.registry.tick(&self.app, false).expect("tick");
        let report = self
            .registry
            .run_pending(&self.app, self.app.deadline())
            .expect("work");
        assert_eq!(report.dropped, 0, "no task should be dropped: {report:?}");
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(chrono::Duration::minutes(minutes));
    }
}

/// A mailed CL waiting for gri, touching `files` in patch set 1001.
pub fn mailed_cl(issue: i64, desc: &str, modified: i64) -> JsonCl {
    JsonCl {
        issue,
        desc: desc.to_string(),
        owner: "dev".to_string(),
        owner_email: "dev@example.com".to_string(),
        created: server_time(modified - 60),
        modified: server_time(modified),
        messages: vec![JsonMessage {
            sender: "dev@example.com".to_string(),
            text: HELLO.to_string(),
            date: server_time(modified),
        }],
        reviewers: vec!["gri@golang.org".to_string(), GROUP_ADDRESS.to_string()],
        cc: Vec::new(),
        closed: false,
        patch_sets: vec![1001],
    }
}

pub fn patch(issue: i64, patch_set: i64, files: &[&str]) -> JsonPatch {
    JsonPatch {
        files: files
            .iter()
            .map(|name| {
                (
                    (*name).to_string(),
                    JsonFile {
                        status: "M".to_string(),
                        num_added: 3,
                        num_removed: 1,
                        ..JsonFile::default()
                    },
                )
            })
            .collect(),
        created: server_time(0),
        owner: "dev".to_string(),
        patch_set,
        issue,
        message: String::new(),
        modified: server_time(0),
        ..JsonPatch::default()
    }
}

pub fn issue(id: i64, summary: &str, modified: DateTime<Utc>, labels: &[&str]) -> Issue {
    Issue {
        id,
        created: modified,
        modified,
        summary: summary.to_string(),
        status: "Accepted".to_string(),
        state: "open".to_string(),
        label: labels.iter().map(|l| (*l).to_string()).collect(),
        ..Issue::default()
    }
}
