use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::archiver::config::load_config;
use crate::archiver::purge::{PurgeMode, PurgeOptions};
use crate::commands::{self, CommandReport};
use crate::logging;

#[derive(Debug, Parser)]
#[command(
    name = "cctv-archiver",
    version,
    about = "Continuous RTSP capture with hourly archive consolidation"
)]
struct Cli {
    /// Print the command report as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon: capture, hourly consolidation and retention (default).
    Run,
    /// Delete segment files left behind by consolidation.
    Purge(PurgeArgs),
    /// Run one consolidation pass and exit.
    Consolidate,
    /// Run one retention pass and exit.
    Retention,
    /// Show archive and daemon state.
    Status,
    /// Stop the running daemon.
    Stop,
}

#[derive(Debug, Args)]
struct PurgeArgs {
    /// Delete old segment sets that have no archive instead of leftovers.
    #[arg(long)]
    orphans: bool,

    /// Report what would be deleted without deleting anything.
    #[arg(long)]
    dry_run: bool,
}

impl From<&PurgeArgs> for PurgeOptions {
    fn from(args: &PurgeArgs) -> Self {
        Self {
            mode: if args.orphans {
                PurgeMode::Orphans
            } else {
                PurgeMode::Leftovers
            },
            dry_run: args.dry_run,
        }
    }
}

fn print_report(report: &CommandReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for detail in &report.details {
        println!("{detail}");
    }
    for issue in &report.issues {
        println!("issue: {issue}");
    }
    Ok(())
}

/// Parse arguments, dispatch, and print the report. `Ok(false)` means the
/// command finished but reported issues.
pub fn run() -> Result<bool> {
    let cli = Cli::parse();
    let cfg = load_config()?;
    logging::init_logging(&cfg.logging);

    let report = match cli.command.unwrap_or(Command::Run) {
        Command::Run => commands::run::run(&cfg)?,
        Command::Purge(args) => commands::purge::run(&cfg, PurgeOptions::from(&args))?,
        Command::Consolidate => commands::consolidate::run(&cfg)?,
        Command::Retention => commands::retention::run(&cfg)?,
        Command::Status => commands::status::run(&cfg)?,
        Command::Stop => commands::stop::run(&cfg)?,
    };

    print_report(&report, cli.json)?;
    Ok(report.ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_run() {
        let cli = Cli::try_parse_from(["cctv-archiver"]).expect("parse");
        assert!(cli.command.is_none());
        assert!(!cli.json);
    }

    #[test]
    fn purge_flags_select_mode() {
        let cli = Cli::try_parse_from(["cctv-archiver", "--json", "purge", "--orphans", "--dry-run"])
            .expect("parse");
        let Some(Command::Purge(args)) = cli.command else {
            panic!("expected purge");
        };
        let opts = PurgeOptions::from(&args);
        assert_eq!(opts.mode, PurgeMode::Orphans);
        assert!(opts.dry_run);
        assert!(cli.json);
    }
}
