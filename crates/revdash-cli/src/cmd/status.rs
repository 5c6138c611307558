//! `revdash status`: the operator status dump.
//!
//! Cron schedule, task queue, data versions, then one section per loader.

use std::io::Write;
use std::path::Path;

use clap::Args;
use revdash_core::jobs::StatusSection;

use super::open_session;
use crate::output::{OutputMode, pretty_section, render_mode};

#[derive(Args, Debug, Default)]
pub struct StatusArgs {}

fn write_text(sections: &[StatusSection], w: &mut dyn Write) -> std::io::Result<()> {
    for section in sections {
        writeln!(w, "## {}", section.heading)?;
        writeln!(w, "{}", section.body.trim_end())?;
        writeln!(w)?;
    }
    Ok(())
}

fn write_pretty(sections: &[StatusSection], w: &mut dyn Write) -> std::io::Result<()> {
    for section in sections {
        pretty_section(w, &section.heading)?;
        for line in section.body.lines() {
            writeln!(w, "  {line}")?;
        }
        writeln!(w)?;
    }
    Ok(())
}

/// Execute `revdash status`.
pub fn run_status(_args: &StatusArgs, output: OutputMode, config: Option<&Path>) -> anyhow::Result<()> {
    let session = open_session(config)?;
    let sections = session.registry.status_report(&session.app);
    render_mode(
        output,
        &sections,
        |s, w| write_text(s, w),
        |s, w| write_pretty(s, w),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_sections_are_separated() {
        let sections = vec![
            StatusSection {
                heading: "cron".into(),
                body: "app.update every 5m\n".into(),
            },
            StatusSection {
                heading: "issue loading".into(),
                body: "12 issues".into(),
            },
        ];
        let mut buf = Vec::new();
        write_text(&sections, &mut buf).expect("write");
        assert_eq!(
            String::from_utf8(buf).expect("utf8"),
            "## cron\napp.update every 5m\n\n## issue loading\n12 issues\n\n"
        );
    }
}
