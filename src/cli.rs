use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None, name = "odeon", bin_name = "odeon")]
pub struct Cli {
    /// Override the configuration directory (or a single config file).
    #[arg(long, value_name = "DIR", global = true)]
    pub config_dir: Option<PathBuf>,
    /// Emit machine-readable output when supported.
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    pub json: bool,
    /// Increase log verbosity (use -vv for trace).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Silence all log output.
    #[arg(short, long, action = ArgAction::SetTrue, global = true)]
    pub quiet: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Open the interactive dashboard (the default).
    Dashboard,
    /// Run one simulation session and stream its progress to stdout.
    Run(RunCommand),
    /// Browse completed runs.
    #[command(subcommand)]
    History(HistoryCommand),
    /// Inspect configuration files.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Default, Args)]
pub struct RunCommand {
    /// Number of optimization cycles.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_cycles: Option<u32>,
    /// Scenarios simulated per cycle.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub batch_size: Option<u32>,
    /// Model used by the simulation server.
    #[arg(long)]
    pub model: Option<String>,
    /// Read the base prompt from this file.
    #[arg(long, value_name = "FILE")]
    pub prompt_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    /// List completed runs, newest first.
    List,
    /// Show one run with its results and prompt revisions.
    Show {
        /// Run identifier.
        id: String,
    },
    /// Delete a run from the archive.
    Delete {
        /// Run identifier.
        id: String,
    },
    /// Delete every run from the archive.
    Clear {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
    /// Copy runs exported with `history show --json` into the local run
    /// database (`server.archive_db`).
    Import {
        /// JSON file holding one run or an array of runs.
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Dump the merged configuration TOML.
    Dump,
    /// Show configuration search paths.
    Where,
    /// Validate configuration values.
    Lint,
    /// Print the JSON schema for configuration files.
    Schema,
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
    fn run_overrides_parse() -> Result<(), clap::Error> {
        let cli = Cli::try_parse_from([
            "odeon",
            "-vv",
            "run",
            "--max-cycles",
            "2",
            "--model",
            "llama-3.3-70b-versatile",
        ])?;
        assert_eq!(cli.verbose, 2);
        let Some(Command::Run(run)) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(run.max_cycles, Some(2));
        assert_eq!(run.batch_size, None);
        assert_eq!(run.model.as_deref(), Some("llama-3.3-70b-versatile"));
        Ok(())
    }

    #[test]
    fn clear_needs_its_own_flag() -> Result<(), clap::Error> {
        let cli = Cli::try_parse_from(["odeon", "history", "clear", "--yes"])?;
        assert!(matches!(
            cli.command,
            Some(Command::History(HistoryCommand::Clear { yes: true }))
        ));
        assert!(Cli::try_parse_from(["odeon", "history", "import"]).is_err());
        Ok(())
    }

    #[test]
    fn zero_cycles_are_refused() {
        assert!(Cli::try_parse_from(["odeon", "run", "--max-cycles", "0"]).is_err());
    }

    #[test]
    fn history_show_takes_an_id() -> Result<(), clap::Error> {
        let cli = Cli::try_parse_from(["odeon", "--json", "history", "show", "20240501"])?;
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Some(Command::History(HistoryCommand::Show { ref id })) if id == "20240501"
        ));
        Ok(())
    }
}
