//! The assembled application: store, configuration and remote services,
//! plus the registry of everything that runs in the background.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::{self, Clock, SystemClock};
use crate::config::Config;
use crate::dash::{self, DashContext, Dashboard};
use crate::jobs::{Registry, RegistryBuilder, RetryPolicy, Runtime, TaskError};
use crate::review::followup::{LOADMSG_SCAN, LOADPATCH_SCAN, MAIL_SCAN};
use crate::review::http::HttpReviewService;
use crate::review::{self, ClDeriver, ReviewService, ReviewerDirectory};
use crate::store::{DataKinds, Store};
use crate::tracker::{self, HttpTracker, IssueTracker};

/// Task function assigning a reviewer in the background.
pub const SET_REVIEWER_FUNC: &str = "codereview.setreviewer";

const REVIEW_LOAD_PERIOD: Duration = Duration::from_secs(60);
const ISSUE_LOAD_PERIOD: Duration = Duration::from_secs(5 * 60);
const LOAD_SCAN_PERIOD: Duration = Duration::from_secs(60);
const MAIL_SCAN_PERIOD: Duration = Duration::from_secs(15 * 60);

/// Arguments of [`SET_REVIEWER_FUNC`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetReviewerArgs {
    pub cl: String,
    pub who: String,
    pub by: String,
}

/// Every record kind with its migrations and derive hooks, and the CL
/// deriver they share.
///
/// # Errors
///
/// Fails if a pattern does not compile or a kind is registered twice.
pub fn data_kinds(config: &Config) -> anyhow::Result<(Arc<DataKinds>, Arc<ClDeriver>)> {
    let deriver = Arc::new(ClDeriver::from_config(&config.review).context("compiling CL patterns")?);
    let mut kinds = DataKinds::default();
    review::register_kinds(&mut kinds, Arc::clone(&deriver))?;
    tracker::register_kinds(&mut kinds)?;
    dash::register_kinds(&mut kinds)?;
    Ok((Arc::new(kinds), deriver))
}

/// Execution context for jobs and operator commands.
pub struct App {
    store: Store,
    config: Config,
    deriver: Arc<ClDeriver>,
    review: Box<dyn ReviewService>,
    tracker: Box<dyn IssueTracker>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("store", &self.store)
            .field("dev", &self.config.dev)
            .finish_non_exhaustive()
    }
}

impl Runtime for App {
    fn store(&self) -> &Store {
        &self.store
    }
}

impl App {
    /// Open the configured store and talk to the real services.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be opened or migrated.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let (kinds, deriver) = data_kinds(&config)?;
        let path = &config.store.path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = Store::open(path, kinds, Arc::new(SystemClock))?;
        let review = Box::new(HttpReviewService::new(&config.review.base_url));
        let tracker = Box::new(HttpTracker::from_config(&config.tracker));
        Ok(Self::new(store, config, deriver, review, tracker))
    }

    /// Assemble from parts; `store` must have been opened with the kinds
    /// from [`data_kinds`] for the same `deriver`.
    #[must_use]
    pub fn new(
        store: Store,
        config: Config,
        deriver: Arc<ClDeriver>,
        review: Box<dyn ReviewService>,
        tracker: Box<dyn IssueTracker>,
    ) -> Self {
        Self {
            store,
            config,
            deriver,
            review,
            tracker,
        }
    }

    /// In-memory store on `clock` with the given services.
    ///
    /// # Errors
    ///
    /// Fails if the kinds or the store cannot be set up.
    pub fn in_memory(
        config: Config,
        clock: Arc<dyn Clock>,
        review: Box<dyn ReviewService>,
        tracker: Box<dyn IssueTracker>,
    ) -> anyhow::Result<Self> {
        let (kinds, deriver) = data_kinds(&config)?;
        let store = Store::open_in_memory(kinds, clock)?;
        Ok(Self::new(store, config, deriver, review, tracker))
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn review(&self) -> &dyn ReviewService {
        self.review.as_ref()
    }

    #[must_use]
    pub fn tracker(&self) -> &dyn IssueTracker {
        self.tracker.as_ref()
    }

    #[must_use]
    pub fn deriver(&self) -> &ClDeriver {
        &self.deriver
    }

    #[must_use]
    pub fn reviewers(&self) -> &ReviewerDirectory {
        self.deriver.reviewers()
    }

    /// When loaders should stop and ask for more work.
    #[must_use]
    pub fn deadline(&self) -> DateTime<Utc> {
        clock::after(self.store.now(), self.config.scheduler.work_deadline())
    }

    /// Re-merge one CL now.
    ///
    /// # Errors
    ///
    /// Fails if the CL is busy or cannot be loaded.
    pub fn refresh_cl(&self, cl: &str) -> anyhow::Result<()> {
        review::edit::refresh_cl(&self.store, self.review(), cl)
    }

    /// Assign a reviewer on the review server and re-merge the CL.
    ///
    /// # Errors
    ///
    /// Fails on bad input, missing credentials or a rejected comment.
    pub fn set_reviewer(&self, cl: &str, who: &str, by: &str) -> anyhow::Result<()> {
        review::edit::set_reviewer(&self.store, self.review(), self.reviewers(), cl, who, by)
    }

    /// The dashboard as seen by `user`.
    ///
    /// # Errors
    ///
    /// Fails if records cannot be loaded.
    pub fn dashboard(&self, user: Option<&str>) -> anyhow::Result<Dashboard> {
        let ctx = DashContext {
            config: &self.config,
            reviewers: self.reviewers(),
        };
        dash::assemble(&self.store, &ctx, user)
    }
}

/// Register the loaders, scans, tasks and status sections.
///
/// # Errors
///
/// Fails on a duplicate registration or a scan over an unknown kind.
pub fn registry(config: &Config, kinds: &DataKinds) -> anyhow::Result<Registry<App>> {
    let mut b = RegistryBuilder::<App>::new(config.scheduler.task_retention());

    b.cron(review::load::LOAD_JOB, REVIEW_LOAD_PERIOD, |app: &App| {
        let cfg = &app.config;
        review::load::load(&app.store, app.review(), &cfg.review, cfg.dev, app.deadline()).map(|_| ())
    })?;
    b.cron(tracker::LOAD_JOB, ISSUE_LOAD_PERIOD, |app: &App| {
        tracker::load::load(&app.store, app.tracker(), &app.config.tracker, app.config.dev)
    })?;

    b.scan(LOADMSG_SCAN, LOAD_SCAN_PERIOD, review::messages_unloaded(), |app: &App, _, key| {
        review::followup::load_messages(&app.store, app.review(), key)
    })?;
    b.scan(LOADPATCH_SCAN, LOAD_SCAN_PERIOD, review::patches_unloaded(), |app: &App, _, key| {
        review::followup::load_patches(&app.store, app.review(), app.deriver.patterns(), key)
    })?;
    b.scan(MAIL_SCAN, MAIL_SCAN_PERIOD, review::needs_issue_mail(), |app: &App, _, key| {
        review::followup::mail_issues(&app.store, app.tracker(), &app.config.review.base_url, key)
    })?;

    b.task(SET_REVIEWER_FUNC, RetryPolicy::DEFAULT, |app: &App, args: SetReviewerArgs| {
        app.set_reviewer(&args.cl, &args.who, &args.by)
            .map_err(TaskError::Failed)
    })?;

    b.status("codereview", |app: &App| review::status(&app.store, &app.config.review));
    b.status("issue loading", |app: &App| tracker::status(&app.store));

    let names: Vec<&str> = kinds.list().into_iter().map(|(kind, _)| kind).collect();
    let registry = b.build(&names)?;
    info!(jobs = registry.cron_jobs().len(), "registry built");
    Ok(registry)
}
