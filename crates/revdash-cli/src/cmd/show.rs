//! `revdash show`: display one stored record.
//!
//! Records are read through the store, so migrations and derived fields
//! are current.

use std::io::Write;
use std::path::Path;

use clap::{Args, ValueEnum};
use revdash_core::jobs::Runtime;
use revdash_core::review::{Cl, Patch};
use revdash_core::tracker::Issue;
use serde::Serialize;

use super::open_app;
use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render_error, render_mode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecordKind {
    Cl,
    Issue,
    Patch,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub kind: RecordKind,

    /// Record key: CL number, issue number, or `<cl>/<patch set>`.
    pub key: String,
}

fn write_json<T: Serialize>(value: &T, w: &mut dyn Write) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut *w, value)?;
    writeln!(w)
}

fn write_cl(cl: &Cl, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, &format!("CL {}", cl.cl))?;
    pretty_kv(w, "summary", &cl.summary)?;
    pretty_kv(w, "owner", &cl.owner_email)?;
    pretty_kv(w, "modified", cl.modified.to_rfc3339())?;
    pretty_kv(w, "active", cl.active.to_string())?;
    pretty_kv(w, "reviewer", &cl.primary_reviewer)?;
    pretty_kv(w, "needs review", cl.needs_review.to_string())?;
    pretty_kv(w, "lgtm", cl.lgtm.join(", "))?;
    pretty_kv(w, "not lgtm", cl.notlgtm.join(", "))?;
    pretty_kv(w, "repo", &cl.repo)?;
    pretty_kv(w, "files", cl.files.len().to_string())?;
    pretty_kv(w, "patch sets", cl.patch_sets.join(" "))?;
    pretty_kv(w, "messages", cl.messages.len().to_string())?;
    pretty_kv(w, "issues", cl.desc_issue.join(" "))?;
    pretty_kv(w, "to mail", cl.need_mail_issue.join(" "))
}

fn write_issue(issue: &Issue, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, &format!("Issue {}", issue.id))?;
    pretty_kv(w, "title", &issue.title)?;
    pretty_kv(w, "status", format!("{} ({})", issue.status, issue.state))?;
    pretty_kv(w, "owner", &issue.owner)?;
    pretty_kv(w, "labels", issue.label.join(" "))?;
    pretty_kv(w, "modified", issue.modified.to_rfc3339())?;
    pretty_kv(w, "comments", issue.comment.len().to_string())?;
    pretty_kv(w, "dir", &issue.dir)
}

fn write_patch(patch: &Patch, w: &mut dyn Write) -> std::io::Result<()> {
    pretty_section(w, &format!("Patch {}", Patch::key(&patch.cl, &patch.patch_set)))?;
    pretty_kv(w, "owner", &patch.owner)?;
    pretty_kv(w, "modified", patch.modified.to_rfc3339())?;
    pretty_kv(w, "message", &patch.message)?;
    for file in &patch.files {
        writeln!(w, "  {:<2} {} +{} -{}", file.status, file.name, file.num_added, file.num_removed)?;
    }
    Ok(())
}

fn not_found(output: OutputMode, what: &str, key: &str) -> anyhow::Result<()> {
    render_error(
        output,
        &CliError::with_details(
            format!("{what} {key} not found"),
            "run `revdash tick` and `revdash work` to load data",
            "E2001",
        ),
    )?;
    anyhow::bail!("{what} {key} not found")
}

/// Execute `revdash show`.
pub fn run_show(args: &ShowArgs, output: OutputMode, config: Option<&Path>) -> anyhow::Result<()> {
    let app = open_app(config)?;
    let store = app.store();
    match args.kind {
        RecordKind::Cl => match store.try_get::<Cl>(&args.key)? {
            Some(cl) => render_mode(output, &cl, write_json, write_cl),
            None => not_found(output, "CL", &args.key),
        },
        RecordKind::Issue => match store.try_get::<Issue>(&args.key)? {
            Some(issue) => render_mode(output, &issue, write_json, write_issue),
            None => not_found(output, "issue", &args.key),
        },
        RecordKind::Patch => match store.try_get::<Patch>(&args.key)? {
            Some(patch) => render_mode(output, &patch, write_json, write_patch),
            None => not_found(output, "patch", &args.key),
        },
    }
}
