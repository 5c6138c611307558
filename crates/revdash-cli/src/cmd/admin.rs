//! `revdash break-lock` and `revdash meta`: operator escape hatches.

use std::path::Path;

use clap::{Args, Subcommand};
use revdash_core::jobs::Runtime;
use revdash_core::lease;
use serde::Serialize;
use tracing::warn;

use super::open_app;
use crate::output::{OutputMode, render, render_success};

#[derive(Args, Debug)]
pub struct BreakLockArgs {
    /// Lease name, for example `app.update` or `scan.CL.5012043`.
    pub name: String,
}

#[derive(Subcommand, Debug)]
pub enum MetaCommand {
    /// Print a metadata value as JSON.
    Get { key: String },
    /// Store a JSON value.
    Set {
        key: String,
        /// JSON text; bare words are stored as strings.
        value: String,
    },
    /// Remove a value.
    Delete { key: String },
}

#[derive(Debug, Serialize)]
struct BrokenLock {
    name: String,
    held_until: Option<String>,
}

/// Execute `revdash break-lock`.
pub fn run_break_lock(args: &BreakLockArgs, output: OutputMode, config: Option<&Path>) -> anyhow::Result<()> {
    let app = open_app(config)?;
    let store = app.store();
    let held = lease::held_until(store, &args.name)?;
    if held.is_some() {
        warn!(lease = %args.name, "breaking held lease");
    }
    lease::release(store, &args.name);
    let report = BrokenLock {
        name: args.name.clone(),
        held_until: held.map(|at| at.to_rfc3339()),
    };
    render(output, &report, |r, w| match &r.held_until {
        Some(until) => writeln!(w, "released {} (was held until {until})", r.name),
        None => writeln!(w, "{} was not held", r.name),
    })
}

fn parse_value(text: &str) -> serde_json::Value {
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
}

/// Execute `revdash meta`.
pub fn run_meta(command: &MetaCommand, output: OutputMode, config: Option<&Path>) -> anyhow::Result<()> {
    let app = open_app(config)?;
    let store = app.store();
    match command {
        MetaCommand::Get { key } => {
            let Some(value) = store.read_meta_raw(key)? else {
                anyhow::bail!("no meta value {key}");
            };
            render(output, &value, |v, w| {
                serde_json::to_writer_pretty(&mut *w, v)?;
                writeln!(w)
            })
        }
        MetaCommand::Set { key, value } => {
            store.write_meta(key, &parse_value(value))?;
            render_success(output, &format!("set {key}"))
        }
        MetaCommand::Delete { key } => {
            let message = if store.delete_meta(key)? {
                format!("deleted {key}")
            } else {
                format!("{key} was not set")
            };
            render_success(output, &message)
        }
    }
}
