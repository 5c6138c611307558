//! Registration of cron jobs, task functions, scans and status sections.
//!
//! Everything is registered once through a [`RegistryBuilder`] and frozen
//! into a [`Registry`]. Handlers receive the runtime context `C` by
//! reference instead of capturing it, so the same registry can serve any
//! number of store handles.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::de::DeserializeOwned;

use super::cron::{CRON_FUNC, CronError, UPDATE_JOB};
use super::scan::SCAN_FUNC;
use super::task::TaskError;
use super::update::UPDATE_FUNC;
use super::{RetryPolicy, Runtime};
use crate::error::ErrorCode;
use crate::store::Query;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("{what} {name:?} registered twice")]
    Duplicate { what: &'static str, name: String },

    #[error("record kind {kind}: migration to {version} is out of order (current version {current})")]
    MigrationOrder {
        kind: &'static str,
        version: u32,
        current: u32,
    },

    #[error("{what} {name:?}: period must be at least one second")]
    BadPeriod { what: &'static str, name: String },

    #[error("scan {scan:?} queries unregistered record kind {kind}")]
    UnknownKind { scan: String, kind: String },
}

impl RegistryError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::DuplicateRegistration
    }
}

pub(crate) type CronFn<C> = Box<dyn Fn(&C) -> Result<(), CronError> + Send + Sync>;
pub(crate) type TaskFn<C> = Box<dyn Fn(&C, serde_json::Value) -> Result<(), TaskError> + Send + Sync>;
pub(crate) type ScanFn<C> = Box<dyn Fn(&C, &str, &str) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type StatusFn<C> = Box<dyn Fn(&C) -> anyhow::Result<String> + Send + Sync>;

pub(crate) enum CronAction<C> {
    Func(CronFn<C>),
    Scan(String),
    Update,
}

pub(crate) struct CronJob<C> {
    pub(crate) name: String,
    pub(crate) period: Duration,
    pub(crate) action: CronAction<C>,
}

pub(crate) struct TaskFunc<C> {
    pub(crate) policy: RetryPolicy,
    pub(crate) run: TaskFn<C>,
}

pub(crate) struct Scan<C> {
    pub(crate) name: String,
    pub(crate) query: Query,
    pub(crate) handler: ScanFn<C>,
}

pub(crate) struct StatusEntry<C> {
    pub(crate) heading: String,
    pub(crate) render: StatusFn<C>,
}

/// Frozen set of background work.
pub struct Registry<C> {
    pub(crate) crons: Vec<CronJob<C>>,
    pub(crate) tasks: BTreeMap<String, TaskFunc<C>>,
    pub(crate) scans: BTreeMap<String, Scan<C>>,
    pub(crate) status: Vec<StatusEntry<C>>,
    pub(crate) retention: Duration,
}

impl<C> std::fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("crons", &self.cron_names())
            .field("tasks", &self.tasks.keys().collect::<Vec<_>>())
            .field("scans", &self.scans.keys().collect::<Vec<_>>())
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl<C> Registry<C> {
    /// Cron job names with their periods, in registration order.
    #[must_use]
    pub fn cron_jobs(&self) -> Vec<(&str, Duration)> {
        self.crons
            .iter()
            .map(|job| (job.name.as_str(), job.period))
            .collect()
    }

    fn cron_names(&self) -> Vec<&str> {
        self.crons.iter().map(|job| job.name.as_str()).collect()
    }

    pub(crate) fn cron_job(&self, name: &str) -> Option<&CronJob<C>> {
        self.crons.iter().find(|job| job.name == name)
    }

    /// How long a finished or abandoned task name stays reserved.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        self.retention
    }
}

/// Collects registrations and rejects duplicates.
pub struct RegistryBuilder<C> {
    inner: Registry<C>,
    cron_names: HashSet<String>,
}

impl<C: Runtime> RegistryBuilder<C> {
    /// Start a registry holding only the built-in record version sweep.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        let mut builder = Self {
            inner: Registry {
                crons: Vec::new(),
                tasks: BTreeMap::new(),
                scans: BTreeMap::new(),
                status: Vec::new(),
                retention,
            },
            cron_names: HashSet::new(),
        };
        builder.push_cron(UPDATE_JOB, Duration::from_secs(5 * 60), CronAction::Update);
        builder
    }

    /// Register a periodic job. Its name must be unique among cron jobs.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate name or a sub-second period.
    pub fn cron(
        &mut self,
        name: &str,
        period: Duration,
        run: impl Fn(&C) -> Result<(), CronError> + Send + Sync + 'static,
    ) -> Result<&mut Self, RegistryError> {
        self.check_cron(name, period)?;
        self.push_cron(name, period, CronAction::Func(Box::new(run)));
        Ok(self)
    }

    /// Register a task function taking typed JSON arguments.
    ///
    /// # Errors
    ///
    /// Fails if `name` is already taken (including the built-in functions).
    pub fn task<A: DeserializeOwned + 'static>(
        &mut self,
        name: &str,
        policy: RetryPolicy,
        run: impl Fn(&C, A) -> Result<(), TaskError> + Send + Sync + 'static,
    ) -> Result<&mut Self, RegistryError> {
        if [CRON_FUNC, SCAN_FUNC, UPDATE_FUNC].contains(&name) || self.inner.tasks.contains_key(name) {
            return Err(RegistryError::Duplicate {
                what: "task function",
                name: name.to_string(),
            });
        }
        let func = name.to_string();
        let run: TaskFn<C> = Box::new(move |ctx, args| {
            let args = serde_json::from_value::<A>(args).map_err(|err| {
                TaskError::Failed(anyhow::anyhow!("task {func}: bad arguments: {err}"))
            })?;
            run(ctx, args)
        });
        self.inner
            .tasks
            .insert(name.to_string(), TaskFunc { policy, run });
        Ok(self)
    }

    /// Register a scan: every `period`, each record matching `query` gets
    /// its own `handler` task.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate scan name, a sub-second period, or a query on a
    /// kind the store does not know.
    pub fn scan(
        &mut self,
        name: &str,
        period: Duration,
        query: Query,
        handler: impl Fn(&C, &str, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Result<&mut Self, RegistryError> {
        if self.inner.scans.contains_key(name) {
            return Err(RegistryError::Duplicate {
                what: "scan",
                name: name.to_string(),
            });
        }
        let job = format!("{}.{name}", super::scan::SCAN_JOB_PREFIX);
        self.check_cron(&job, period)?;
        self.push_cron(&job, period, CronAction::Scan(name.to_string()));
        self.inner.scans.insert(
            name.to_string(),
            Scan {
                name: name.to_string(),
                query,
                handler: Box::new(handler),
            },
        );
        Ok(self)
    }

    /// Add a section to the operator status dump, after the built-in ones.
    pub fn status(
        &mut self,
        heading: &str,
        render: impl Fn(&C) -> anyhow::Result<String> + Send + Sync + 'static,
    ) -> &mut Self {
        self.push_status(heading, render);
        self
    }

    /// Verify every scan targets a known record kind and freeze.
    ///
    /// # Errors
    ///
    /// Fails if a scan's kind is not in `known_kinds`.
    pub fn build(self, known_kinds: &[&str]) -> Result<Registry<C>, RegistryError> {
        for scan in self.inner.scans.values() {
            let kind = scan.query.kind_name();
            if !known_kinds.contains(&kind) {
                return Err(RegistryError::UnknownKind {
                    scan: scan.name.clone(),
                    kind: kind.to_string(),
                });
            }
        }
        Ok(self.inner)
    }

    fn check_cron(&self, name: &str, period: Duration) -> Result<(), RegistryError> {
        if self.cron_names.contains(name) {
            return Err(RegistryError::Duplicate {
                what: "cron job",
                name: name.to_string(),
            });
        }
        if period.as_secs() == 0 {
            return Err(RegistryError::BadPeriod {
                what: "cron job",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn push_cron(&mut self, name: &str, period: Duration, action: CronAction<C>) {
        self.cron_names.insert(name.to_string());
        self.inner.crons.push(CronJob {
            name: name.to_string(),
            period,
            action,
        });
    }

    fn push_status(
        &mut self,
        heading: &str,
        render: impl Fn(&C) -> anyhow::Result<String> + Send + Sync + 'static,
    ) {
        self.inner.status.push(StatusEntry {
            heading: heading.to_string(),
            render: Box::new(render),
        });
    }
}
