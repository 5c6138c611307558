//! revdash-core library.
//!
//! A versioned record store in SQLite with leases, a cron and task
//! scheduler driven by external ticks, and the loaders that keep code
//! review and issue tracker data fresh for the dashboard.

pub mod clock;
pub mod config;
pub mod dash;
pub mod error;
pub mod jobs;
pub mod lease;
pub mod meta;
pub mod remote;
pub mod review;
pub mod runtime;
pub mod store;
pub mod tracker;

/// # Conventions
///
/// - **Errors**: typed `thiserror` enums at module seams, `anyhow::Result`
///   in handlers and the CLI.
/// - **Logging**: `tracing` macros with an `error!`-level `code` field for
///   anything an operator may need to act on.
pub use runtime::App;
