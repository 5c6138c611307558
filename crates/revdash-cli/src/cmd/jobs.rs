//! `revdash tick`, `revdash work` and `revdash run`: drive the scheduler.
//!
//! An external timer calls `tick` to enqueue due cron jobs and `work` to
//! drain the queue. `run` does both in a loop for hosts without a timer.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use clap::Args;
use revdash_core::clock;
use revdash_core::jobs::{Runtime, TickReport, WorkReport};
use serde::Serialize;
use tracing::{info, warn};

use super::{Session, open_session};
use crate::output::{OutputMode, pretty_kv, pretty_section, render, render_mode};

#[derive(Args, Debug, Default)]
pub struct TickArgs {
    /// Enqueue every cron job, due or not.
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug, Default)]
pub struct WorkArgs {}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Stop after this many rounds instead of looping forever.
    #[arg(long)]
    pub rounds: Option<u64>,

    /// Seconds between rounds; defaults to the configured run interval.
    #[arg(long)]
    pub interval: Option<u64>,
}

fn write_tick(report: &TickReport, w: &mut dyn Write) -> std::io::Result<()> {
    if !report.advanced {
        writeln!(w, "tick: clock has not advanced past the last tick")?;
    }
    for name in &report.enqueued {
        writeln!(w, "queued   {name}")?;
    }
    for name in &report.already_pending {
        writeln!(w, "pending  {name}")?;
    }
    Ok(())
}

fn write_tick_pretty(report: &TickReport, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, "Tick")?;
    pretty_kv(w, "now", report.now.to_rfc3339())?;
    pretty_kv(
        w,
        "previous",
        report
            .previous
            .map_or_else(|| "never".to_string(), |at| at.to_rfc3339()),
    )?;
    pretty_kv(w, "queued", report.enqueued.len().to_string())?;
    pretty_kv(w, "pending", report.already_pending.len().to_string())?;
    write_tick(report, w)
}

fn write_work(report: &WorkReport, w: &mut dyn Write) -> std::io::Result<()> {
    writeln!(
        w,
        "succeeded={} retried={} dropped={} busy={}",
        report.succeeded, report.retried, report.dropped, report.busy
    )?;
    if let Some(next) = report.next_due {
        writeln!(w, "next due {}", next.to_rfc3339())?;
    }
    Ok(())
}

fn work(session: &Session) -> anyhow::Result<WorkReport> {
    let app = &session.app;
    let deadline = clock::after(
        app.store().now(),
        app.config().scheduler.invocation_ceiling(),
    );
    Ok(session.registry.run_pending(app, deadline)?)
}

/// Execute `revdash tick`.
pub fn run_tick(args: &TickArgs, output: OutputMode, config: Option<&Path>) -> anyhow::Result<()> {
    let session = open_session(config)?;
    let report = session.registry.tick(&session.app, args.force)?;
    render_mode(output, &report, write_tick, write_tick_pretty)
}

/// Execute `revdash work`.
pub fn run_work(_args: &WorkArgs, output: OutputMode, config: Option<&Path>) -> anyhow::Result<()> {
    let session = open_session(config)?;
    let report = work(&session)?;
    render(output, &report, write_work)
}

#[derive(Debug, Serialize)]
struct Round {
    round: u64,
    tick: TickReport,
    work: WorkReport,
}

/// Execute `revdash run`.
pub fn run_loop(args: &RunArgs, output: OutputMode, config: Option<&Path>) -> anyhow::Result<()> {
    let session = open_session(config)?;
    let interval = Duration::from_secs(
        args.interval
            .unwrap_or(session.app.config().scheduler.run_interval_secs)
            .max(1),
    );
    info!(interval_secs = interval.as_secs(), "scheduler loop started");

    let mut round = 0;
    loop {
        round += 1;
        match session
            .registry
            .tick(&session.app, false)
            .map_err(anyhow::Error::from)
            .and_then(|tick| Ok((tick, work(&session)?)))
        {
            Ok((tick, work)) => {
                let report = Round { round, tick, work };
                render(output, &report, |r, w| {
                    write!(w, "round {}: ", r.round)?;
                    write_work(&r.work, w)
                })?;
            }
            // A bad round should not end the loop; the next tick retries.
            Err(err) => warn!(round, error = %err, "scheduler round failed"),
        }
        if args.rounds.is_some_and(|limit| round >= limit) {
            return Ok(());
        }
        std::thread::sleep(interval);
    }
}
