//! `revdash refresh` and `revdash set-reviewer`.

use std::path::Path;

use clap::Args;
use revdash_core::jobs::Enqueued;
use revdash_core::runtime::{SET_REVIEWER_FUNC, SetReviewerArgs as TaskArgs};

use super::{open_app, open_session};
use crate::output::{OutputMode, render_success};

#[derive(Args, Debug)]
pub struct RefreshArgs {
    /// CL number.
    pub cl: String,
}

#[derive(Args, Debug)]
pub struct SetReviewerArgs {
    /// CL number.
    pub cl: String,

    /// Reviewer: a known short name, a full address, or "close".
    pub who: String,

    /// Address of the person making the assignment.
    #[arg(long)]
    pub by: String,

    /// Queue the assignment as a background task instead of running it now.
    #[arg(long)]
    pub queue: bool,
}

/// Execute `revdash refresh`.
pub fn run_refresh(args: &RefreshArgs, output: OutputMode, config: Option<&Path>) -> anyhow::Result<()> {
    let app = open_app(config)?;
    app.refresh_cl(&args.cl)?;
    render_success(output, &format!("refreshed CL {}", args.cl))
}

/// Execute `revdash set-reviewer`.
pub fn run_set_reviewer(
    args: &SetReviewerArgs,
    output: OutputMode,
    config: Option<&Path>,
) -> anyhow::Result<()> {
    if !args.queue {
        let app = open_app(config)?;
        app.set_reviewer(&args.cl, &args.who, &args.by)?;
        return render_success(output, &format!("CL {}: reviewer set to {}", args.cl, args.who));
    }

    let session = open_session(config)?;
    let task = TaskArgs {
        cl: args.cl.clone(),
        who: args.who.clone(),
        by: args.by.clone(),
    };
    let name = format!("{SET_REVIEWER_FUNC}.{}.{}", args.cl, args.who);
    let message = match session
        .registry
        .enqueue(&session.app, &name, SET_REVIEWER_FUNC, &task)?
    {
        Enqueued::Queued => format!("queued {name}"),
        Enqueued::AlreadyPending => format!("{name} is already pending"),
    };
    render_success(output, &message)
}
