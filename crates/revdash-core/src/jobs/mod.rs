//! Background scheduling: cron jobs, the persisted task queue, scans and
//! the record version sweep.
//!
//! Nothing here runs threads. An external trigger calls
//! [`Registry::tick`] to enqueue due work and [`Registry::run_pending`] to
//! execute it; all coordination goes through the store.

pub mod cron;
pub mod registry;
pub mod scan;
pub mod status;
pub mod task;
pub mod update;

use std::time::Duration;

use crate::store::{Store, StoreError};

pub use cron::{CronError, TickReport};
pub use registry::{Registry, RegistryBuilder, RegistryError};
pub use status::StatusSection;
pub use task::{Enqueued, TaskError, WorkReport};

/// Execution context handed to every job and task handler.
pub trait Runtime {
    fn store(&self) -> &Store;
}

impl Runtime for Store {
    fn store(&self) -> &Store {
        self
    }
}

/// Bounded exponential backoff for task retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which the task is dropped.
    pub limit: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Cron executions: "more work" must come back quickly.
    pub const CRON: Self = Self {
        limit: 1000,
        min_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(10),
    };

    /// Per-record scan work.
    pub const SCAN: Self = Self {
        limit: 10,
        min_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(3600),
    };

    pub const DEFAULT: Self = Self {
        limit: 5,
        min_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(60),
    };

    /// Delay before retry number `attempt` (0-indexed):
    /// `min_backoff * 2^attempt`, capped at `max_backoff`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.min_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        Self::Failed(err.into())
    }
}
