//! `revdash dash`, `revdash mute` and `revdash unmute`.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use clap::Args;
use revdash_core::dash::{self, Dashboard, Item};
use revdash_core::jobs::Runtime;

use super::open_app;
use crate::output::{OutputMode, pretty_rule, render_mode, render_success};

#[derive(Args, Debug, Default)]
pub struct DashArgs {
    /// View as this address; todo flags and muted groups follow it.
    #[arg(long)]
    pub user: Option<String>,

    /// Show the items of muted groups too.
    #[arg(long)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct MuteArgs {
    /// Directory group to mute or unmute.
    pub dir: String,

    /// Address whose preferences change.
    #[arg(long)]
    pub user: String,
}

fn mark(todo: bool) -> &'static str {
    if todo { "*" } else { " " }
}

fn write_item(w: &mut dyn Write, item: &Item, now: DateTime<Utc>) -> std::io::Result<()> {
    if let Some(bug) = &item.bug {
        writeln!(
            w,
            "  {} issue {:<6} {} [{}]",
            mark(item.todo),
            bug.id,
            bug.title,
            bug.owner
        )?;
    }
    let indent = if item.bug.is_some() { "    " } else { "  " };
    for entry in &item.cls {
        let cl = &entry.cl;
        writeln!(
            w,
            "{indent}{} CL {:<8} {} ({}, {}{})",
            mark(entry.todo),
            cl.cl,
            cl.summary,
            cl.owner,
            dash::since(now, cl.modified),
            if entry.old { ", old" } else { "" }
        )?;
    }
    Ok(())
}

fn write_dash(board: &Dashboard, w: &mut dyn Write, now: DateTime<Utc>, all: bool) -> std::io::Result<()> {
    for group in &board.groups {
        let muted = if group.muted { " (muted)" } else { "" };
        writeln!(w, "{}{} {}{muted}", mark(group.todo), group.dir, group.items.len())?;
        if group.muted && !all {
            continue;
        }
        for item in &group.items {
            write_item(w, item, now)?;
        }
    }
    Ok(())
}

fn write_dash_pretty(
    board: &Dashboard,
    w: &mut dyn Write,
    now: DateTime<Utc>,
    all: bool,
    main_repo: &str,
) -> std::io::Result<()> {
    if !board.user.is_empty() {
        writeln!(w, "Dashboard for {}", board.user)?;
        pretty_rule(w)?;
    }
    for group in &board.groups {
        writeln!(w)?;
        let muted = if group.muted { "  [muted]" } else { "" };
        writeln!(w, "{} {}{muted}", mark(group.todo), group.dir)?;
        pretty_rule(w)?;
        if group.muted && !all {
            continue;
        }
        for item in &group.items {
            write_item(w, item, now)?;
            for entry in &item.cls {
                writeln!(w, "        {}", dash::cl_status(&entry.cl, main_repo))?;
            }
        }
    }
    Ok(())
}

/// Execute `revdash dash`.
pub fn run_dash(args: &DashArgs, output: OutputMode, config: Option<&Path>) -> anyhow::Result<()> {
    let app = open_app(config)?;
    let board = app.dashboard(args.user.as_deref())?;
    let now = app.store().now();
    let main_repo = app.config().review.main_repo.clone();
    render_mode(
        output,
        &board,
        |b, w| write_dash(b, w, now, args.all),
        |b, w| write_dash_pretty(b, w, now, args.all, &main_repo),
    )
}

/// Execute `revdash mute` (or `unmute` when `muted` is false).
pub fn run_mute(args: &MuteArgs, muted: bool, output: OutputMode, config: Option<&Path>) -> anyhow::Result<()> {
    let app = open_app(config)?;
    let changed = if muted {
        dash::mute(app.store(), &args.user, &args.dir)?
    } else {
        dash::unmute(app.store(), &args.user, &args.dir)?
    };
    let verb = if muted { "muted" } else { "unmuted" };
    let message = if changed {
        format!("{verb} {} for {}", args.dir, args.user)
    } else {
        format!("{} already {verb} for {}", args.dir, args.user)
    };
    render_success(output, &message)
}
