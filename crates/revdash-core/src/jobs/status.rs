//! Operator status dump.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::Runtime;
use super::cron::{CRON_TIME_KEY, CronRun, last_run_key};
use super::registry::Registry;
use super::task;

const QUEUE_LISTING: usize = 20;

/// One titled block of the status dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSection {
    pub heading: String,
    pub body: String,
}

impl<C: Runtime> Registry<C> {
    /// Built-in sections (cron, task queue, data versions) followed by the
    /// registered ones. A section that fails renders its error instead.
    #[must_use]
    pub fn status_report(&self, ctx: &C) -> Vec<StatusSection> {
        let mut out = vec![
            section("cron", self.cron_status(ctx)),
            section("task queue", queue_status(ctx)),
            section("data versions", super::update::status_lines(ctx.store())),
        ];
        out.extend(
            self.status
                .iter()
                .map(|entry| section(&entry.heading, (entry.render)(ctx))),
        );
        out
    }

    fn cron_status(&self, ctx: &C) -> anyhow::Result<String> {
        let store = ctx.store();
        let mut out = String::new();
        match store.read_meta::<DateTime<Utc>>(CRON_TIME_KEY)? {
            Some(at) => writeln!(out, "last tick: {}", at.to_rfc3339())?,
            None => writeln!(out, "last tick: never")?,
        }
        for (name, period) in self.cron_jobs() {
            let last = store.read_meta::<CronRun>(&last_run_key(name))?;
            match last {
                Some(run) => writeln!(
                    out,
                    "{name} every {}s: last run {} ({})",
                    period.as_secs(),
                    run.at.to_rfc3339(),
                    run.outcome
                )?,
                None => writeln!(out, "{name} every {}s: never run", period.as_secs())?,
            }
        }
        Ok(out)
    }
}

fn queue_status<C: Runtime>(ctx: &C) -> anyhow::Result<String> {
    let store = ctx.store();
    let (total, due) = task::counts(store)?;
    let mut out = format!("{total} queued, {due} due\n");
    for t in task::list(store, QUEUE_LISTING)? {
        write!(
            out,
            "{} ({}) attempts={} not_before={}",
            t.name,
            t.func,
            t.attempts,
            t.not_before.to_rfc3339()
        )?;
        if let Some(err) = &t.last_error {
            write!(out, " last_error={err}")?;
        }
        out.push('\n');
    }
    Ok(out)
}

fn section(heading: &str, body: anyhow::Result<String>) -> StatusSection {
    StatusSection {
        heading: heading.to_string(),
        body: body.unwrap_or_else(|err| format!("error: {err:#}\n")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::RegistryBuilder;
    use crate::store::{DataKinds, Store};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn report_lists_builtins_then_custom_sections() -> anyhow::Result<()> {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_399_996_800, 0).expect("valid timestamp"),
        ));
        let store = Store::open_in_memory(Arc::new(DataKinds::default()), clock)?;
        let mut b = RegistryBuilder::<Store>::new(Duration::from_secs(60));
        b.cron("issue.load", Duration::from_secs(60), |_| Ok(()))?;
        b.status("issues", |_| Ok("42 issues\n".to_string()));
        b.status("broken", |_| anyhow::bail!("no data"));
        let reg = b.build(&[])?;

        let before = reg.status_report(&store);
        assert!(before[0].body.contains("last tick: never"));
        assert!(before[0].body.contains("issue.load every 60s: never run"));

        reg.tick(&store, false)?;
        let after = reg.status_report(&store);
        let headings: Vec<&str> = after.iter().map(|s| s.heading.as_str()).collect();
        assert_eq!(headings, ["cron", "task queue", "data versions", "issues", "broken"]);
        assert!(after[0].body.contains("last tick: 2014-05-13T16:00:00+00:00"));
        assert!(after[1].body.starts_with("2 queued, 2 due"));
        assert_eq!(after[3].body, "42 issues\n");
        assert_eq!(after[4].body, "error: no data\n");
        Ok(())
    }
}
