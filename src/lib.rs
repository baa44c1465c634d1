pub mod archive;
pub mod cli;
pub mod config;
pub mod diff;
pub mod model;
pub mod prompt_history;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transcript;
pub mod transport;

mod app;
#[doc(hidden)]
pub mod test_support;
mod tui;
mod util;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

use cli::Command;

pub use cli::Cli;

/// Run the odeon CLI entrypoint.
///
/// # Errors
///
/// Returns an error when initialization or the chosen command fails to execute.
pub fn run(cli: &Cli) -> color_eyre::Result<()> {
    init_tracing(cli);

    let app = app::App::bootstrap(cli)?;

    match &cli.command {
        None | Some(Command::Dashboard) => app.dashboard(),
        Some(Command::Run(cmd)) => app.run_session(cmd),
        Some(Command::History(cmd)) => app.history(cmd),
        Some(Command::Config(cmd)) => app.config(cmd),
    }
}

fn is_dashboard(cli: &Cli) -> bool {
    matches!(cli.command, None | Some(Command::Dashboard))
}

fn init_tracing(cli: &Cli) {
    let level = desired_level(cli);
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    // The dashboard owns the terminal, so its logs go to a file.
    let _ = if is_dashboard(cli) {
        match open_log_file(cli) {
            Some(file) => builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init(),
            None => builder.with_writer(std::io::sink).try_init(),
        }
    } else {
        builder.with_writer(std::io::stderr).try_init()
    };
}

fn open_log_file(cli: &Cli) -> Option<File> {
    let dirs = config::AppDirectories::resolve(cli.config_dir.as_deref()).ok()?;
    dirs.ensure_data_dir().ok()?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dirs.log_file())
        .ok()
}

fn desired_level(cli: &Cli) -> tracing::level_filters::LevelFilter {
    if cli.quiet {
        return tracing::level_filters::LevelFilter::ERROR;
    }

    match cli.verbose {
        0 => tracing::level_filters::LevelFilter::INFO,
        1 => tracing::level_filters::LevelFilter::DEBUG,
        _ => tracing::level_filters::LevelFilter::TRACE,
    }
}

/// Print an error and its causes the way the binary reports failures.
///
/// # Errors
///
/// Returns an error if writing to `out` fails.
pub fn write_cli_error(err: &color_eyre::Report, out: &mut impl Write) -> std::io::Result<()> {
    let mut chain = err.chain();
    if let Some(head) = chain.next() {
        writeln!(out, "odeon: {head}")?;
    }
    for cause in chain {
        writeln!(out, "    caused by: {cause}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use color_eyre::eyre::eyre;

    #[test]
    fn verbosity_flags_pick_level() -> Result<(), clap::Error> {
        let quiet = Cli::try_parse_from(["odeon", "-q", "-vv", "config", "where"])?;
        assert_eq!(
            desired_level(&quiet),
            tracing::level_filters::LevelFilter::ERROR
        );
        let debug = Cli::try_parse_from(["odeon", "-v", "history", "list"])?;
        assert_eq!(
            desired_level(&debug),
            tracing::level_filters::LevelFilter::DEBUG
        );
        assert!(!is_dashboard(&debug));
        assert!(is_dashboard(&Cli::try_parse_from(["odeon"])?));
        Ok(())
    }

    #[test]
    fn cli_errors_print_their_chain() -> std::io::Result<()> {
        let err = eyre!("connection refused").wrap_err("failed to list history");
        let mut out = Vec::new();
        write_cli_error(&err, &mut out)?;
        assert_eq!(
            String::from_utf8_lossy(&out),
            "odeon: failed to list history\n    caused by: connection refused\n"
        );
        Ok(())
    }
}
