#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{CliError, OutputMode, render_error};
use std::env;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "revdash: review and issue dashboard sync engine",
    long_about = None
)]
struct Cli {
    /// Config file (else REVDASH_CONFIG, ./revdash.toml, the user config dir).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output format.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true, hide = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        output::resolve_output_mode(self.format, self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Scheduler",
        about = "Enqueue due cron jobs",
        after_help = "EXAMPLES:\n    # Called by an external timer once a minute\n    revdash tick\n\n    # Enqueue every job now\n    revdash tick --force"
    )]
    Tick(cmd::jobs::TickArgs),

    #[command(
        next_help_heading = "Scheduler",
        about = "Run due tasks until the queue is drained or time runs out"
    )]
    Work(cmd::jobs::WorkArgs),

    #[command(
        next_help_heading = "Scheduler",
        about = "Tick and work in a loop",
        after_help = "EXAMPLES:\n    # Run forever at the configured interval\n    revdash run\n\n    # Three rounds, ten seconds apart\n    revdash run --rounds 3 --interval 10"
    )]
    Run(cmd::jobs::RunArgs),

    #[command(next_help_heading = "Review", about = "Reload one CL from the review server")]
    Refresh(cmd::review::RefreshArgs),

    #[command(
        next_help_heading = "Review",
        about = "Assign a reviewer to a CL",
        after_help = "EXAMPLES:\n    # Assign by short name\n    revdash set-reviewer 5012043 bradfitz --by adg@golang.org\n\n    # Close the CL\n    revdash set-reviewer 5012043 close --by adg@golang.org"
    )]
    SetReviewer(cmd::review::SetReviewerArgs),

    #[command(next_help_heading = "Dashboard", about = "Print the dashboard")]
    Dash(cmd::dash::DashArgs),

    #[command(next_help_heading = "Dashboard", about = "Collapse a directory group for a user")]
    Mute(cmd::dash::MuteArgs),

    #[command(next_help_heading = "Dashboard", about = "Expand a muted directory group")]
    Unmute(cmd::dash::MuteArgs),

    #[command(next_help_heading = "Operations", about = "Print the status dump")]
    Status(cmd::status::StatusArgs),

    #[command(
        next_help_heading = "Operations",
        about = "Show one stored record",
        after_help = "EXAMPLES:\n    revdash show cl 5012043\n    revdash show issue 7523\n    revdash show patch 5012043/2001"
    )]
    Show(cmd::show::ShowArgs),

    #[command(next_help_heading = "Operations", about = "Release a lease held by a crashed worker")]
    BreakLock(cmd::admin::BreakLockArgs),

    #[command(next_help_heading = "Operations", about = "Read or edit metadata values")]
    Meta {
        #[command(subcommand)]
        command: cmd::admin::MetaCommand,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("REVDASH_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "revdash=debug,info"
        } else {
            "revdash=info,warn"
        })
    });

    let format = env::var("REVDASH_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let output = cli.output_mode();
    let config = cli.config.as_deref();
    debug!(command = ?cli.command, "starting");

    let result = match &cli.command {
        Commands::Tick(args) => cmd::jobs::run_tick(args, output, config),
        Commands::Work(args) => cmd::jobs::run_work(args, output, config),
        Commands::Run(args) => cmd::jobs::run_loop(args, output, config),
        Commands::Refresh(args) => cmd::review::run_refresh(args, output, config),
        Commands::SetReviewer(args) => cmd::review::run_set_reviewer(args, output, config),
        Commands::Dash(args) => cmd::dash::run_dash(args, output, config),
        Commands::Mute(args) => cmd::dash::run_mute(args, true, output, config),
        Commands::Unmute(args) => cmd::dash::run_mute(args, false, output, config),
        Commands::Status(args) => cmd::status::run_status(args, output, config),
        Commands::Show(args) => cmd::show::run_show(args, output, config),
        Commands::BreakLock(args) => cmd::admin::run_break_lock(args, output, config),
        Commands::Meta { command } => cmd::admin::run_meta(command, output, config),
    };

    // One-off commands surface the raw error text.
    if let Err(err) = &result {
        if output.is_json() {
            render_error(output, &CliError::new(format!("{err:#}")))?;
        }
    }
    result
}
