use std::fs;
use std::path::Path;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use serde_json::json;
use tracing::{info, warn};

use crate::archive::{Archive, HistoryRepository, HttpArchive, SqliteArchive};
use crate::cli::{Cli, ConfigCommand, HistoryCommand, RunCommand};
use crate::config::{DiagnosticLevel, LoadedConfig};
use crate::diff::{self, SegmentKind};
use crate::model::{HistoryItem, SessionConfig};
use crate::session::{LogLine, SessionController, SessionStatus};
use crate::store::{self, CycleGroup};
use crate::transport::WebSocketTransport;
use crate::tui::{self, Dashboard};
use crate::util;

const WAIT_SLICE: Duration = Duration::from_millis(250);

pub struct App<'cli> {
    pub cli: &'cli Cli,
    pub loaded: LoadedConfig,
}

impl<'cli> App<'cli> {
    /// Construct the application by loading the layered configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or decoded.
    pub fn bootstrap(cli: &'cli Cli) -> Result<Self> {
        let loaded = crate::config::load(cli.config_dir.as_deref())?;
        for diag in &loaded.diagnostics {
            match diag.level {
                DiagnosticLevel::Warning => tracing::debug!(detail = %diag.message, "config warning"),
                DiagnosticLevel::Error => warn!(detail = %diag.message, "config error"),
            }
        }
        Ok(Self { cli, loaded })
    }

    fn open_archive(&self) -> Result<Box<dyn Archive + Send>> {
        let server = &self.loaded.config.server;
        if let Some(path) = &server.archive_db {
            let archive = SqliteArchive::open(path)
                .wrap_err_with(|| format!("failed to open run database {}", path.display()))?;
            return Ok(Box::new(archive));
        }
        let archive = HttpArchive::new(&server.archive_url)
            .wrap_err("failed to configure history client")?;
        Ok(Box::new(archive))
    }

    fn transport(&self) -> WebSocketTransport {
        WebSocketTransport::new(self.loaded.config.server.websocket_url.clone())
    }

    /// Launch the interactive dashboard.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal cannot be driven.
    pub fn dashboard(&self) -> Result<()> {
        let history = HistoryRepository::new(self.open_archive()?);
        let mut dashboard = Dashboard::new(
            SessionController::new(self.transport()),
            history,
            self.loaded.config.session.session_config(),
        );
        tui::run(&mut dashboard)
    }

    /// Run a single session to completion, printing progress as it arrives.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot start or ends in any state other
    /// than `Completed`.
    pub fn run_session(&self, cmd: &RunCommand) -> Result<()> {
        let config = self.session_config(cmd)?;
        if config.api_key.is_empty() {
            return Err(eyre!(
                "no API key configured; set session.api_key or ${}",
                self.loaded.config.session.api_key_env
            ));
        }

        let mut session = SessionController::new(self.transport());
        session
            .start(config)
            .wrap_err_with(|| format!("failed to start session at {}", self.transport().url()))?;

        let mut printed_lines = 0;
        let mut printed_results = 0;
        while session.is_running() {
            session.wait(WAIT_SLICE);
            if !self.cli.json {
                printed_lines = print_new_log_lines(&session, printed_lines);
                printed_results = print_new_results(&session, printed_results);
            }
        }
        if !self.cli.json {
            print_new_log_lines(&session, printed_lines);
            print_new_results(&session, printed_results);
        }

        if session.protocol_errors() > 0 {
            warn!(
                dropped = session.protocol_errors(),
                "some server events could not be decoded"
            );
        }

        if self.cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&session_summary_json(&session))?
            );
        } else {
            print_session_summary(&session);
        }

        let status = session.status();
        if !status.is_terminal() {
            return Err(eyre!("session ended before completing ({status})"));
        }
        match status {
            SessionStatus::Errored { reason } => Err(eyre!("session failed: {reason}")),
            SessionStatus::Stopped => Err(eyre!("session was stopped")),
            _ => Ok(()),
        }
    }

    fn session_config(&self, cmd: &RunCommand) -> Result<SessionConfig> {
        let mut config = self.loaded.config.session.session_config();
        if let Some(max_cycles) = cmd.max_cycles {
            config.max_cycles = max_cycles;
        }
        if let Some(batch_size) = cmd.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(model) = &cmd.model {
            config.model_name.clone_from(model);
        }
        if let Some(path) = &cmd.prompt_file {
            config.base_prompt = fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read prompt file {}", path.display()))?;
        }
        config
            .validate()
            .map_err(|reason| eyre!("invalid session configuration: {reason}"))?;
        Ok(config)
    }

    /// Execute one of the history subcommands.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be reached or the run is unknown.
    pub fn history(&self, cmd: &HistoryCommand) -> Result<()> {
        let mut repo = HistoryRepository::new(self.open_archive()?);
        match cmd {
            HistoryCommand::List => {
                let items = repo.refresh().wrap_err("failed to load history")?;
                if self.cli.json {
                    let payload: Vec<_> = items.iter().map(history_row_json).collect();
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                } else {
                    print_history_table(items);
                }
                Ok(())
            }
            HistoryCommand::Show { id } => {
                let mut item = repo
                    .fetch(id)
                    .wrap_err("failed to load history")?
                    .ok_or_else(|| eyre!("no run with id '{id}'"))?;
                item.config.api_key.clear();
                if self.cli.json {
                    println!("{}", serde_json::to_string_pretty(&item)?);
                } else {
                    print_history_item(&item);
                }
                Ok(())
            }
            HistoryCommand::Delete { id } => {
                repo.delete(id)
                    .wrap_err_with(|| format!("failed to delete run '{id}'"))?;
                info!(id = %id, "run deleted");
                if self.cli.json {
                    println!("{}", json!({ "deleted": id }));
                } else {
                    println!("Deleted run {id}");
                }
                Ok(())
            }
            HistoryCommand::Clear { yes } => {
                if !yes {
                    return Err(eyre!("refusing to delete every run without --yes"));
                }
                let removed = repo.clear().wrap_err("failed to clear history")?;
                info!(removed, "history cleared");
                if self.cli.json {
                    println!("{}", json!({ "deleted": removed }));
                } else {
                    println!("Deleted {removed} runs");
                }
                Ok(())
            }
            HistoryCommand::Import { file } => self.history_import(file),
        }
    }

    fn history_import(&self, file: &Path) -> Result<()> {
        let Some(db) = &self.loaded.config.server.archive_db else {
            return Err(eyre!(
                "importing runs needs a local database; set server.archive_db"
            ));
        };
        let text = fs::read_to_string(file)
            .wrap_err_with(|| format!("failed to read {}", file.display()))?;
        let runs = parse_exported_runs(&text)
            .wrap_err_with(|| format!("{} does not contain exported runs", file.display()))?;
        let archive = SqliteArchive::open(db)
            .wrap_err_with(|| format!("failed to open run database {}", db.display()))?;
        for run in &runs {
            archive
                .save(run)
                .wrap_err_with(|| format!("failed to save run '{}'", run.id))?;
        }
        info!(count = runs.len(), db = %db.display(), "runs imported");
        if self.cli.json {
            let ids: Vec<_> = runs.iter().map(|run| run.id.as_str()).collect();
            println!("{}", json!({ "imported": ids }));
        } else {
            println!("Imported {} runs into {}", runs.len(), db.display());
        }
        Ok(())
    }

    /// Execute one of the configuration subcommands.
    ///
    /// # Errors
    ///
    /// Returns an error if dumping or linting fails, or lint finds errors.
    pub fn config(&self, cmd: &ConfigCommand) -> Result<()> {
        match cmd {
            ConfigCommand::Dump => self.config_dump(),
            ConfigCommand::Where => {
                self.config_where();
                Ok(())
            }
            ConfigCommand::Lint => self.config_lint(),
            ConfigCommand::Schema => {
                let schema = crate::config::model::schema();
                println!("{}", serde_json::to_string_pretty(&schema)?);
                Ok(())
            }
        }
    }

    fn config_dump(&self) -> Result<()> {
        let toml_text = toml::to_string_pretty(&self.loaded.merged)?;
        println!("{toml_text}");
        Ok(())
    }

    fn config_where(&self) {
        let dirs = &self.loaded.directories;
        if self.cli.json {
            let sources: Vec<_> = self
                .loaded
                .sources
                .iter()
                .map(|source| json!({ "path": source.path, "kind": source.kind.label() }))
                .collect();
            println!(
                "{}",
                json!({
                    "config_dir": dirs.config_dir,
                    "data_dir": dirs.data_dir,
                    "log_file": dirs.log_file(),
                    "sources": sources,
                })
            );
            return;
        }
        println!("Configuration directory: {}", dirs.config_dir.display());
        println!("Data directory: {}", dirs.data_dir.display());
        println!("Dashboard log: {}", dirs.log_file().display());
        println!("Sources (in load order):");
        for source in &self.loaded.sources {
            println!("  - {} ({})", source.path.display(), source.kind.label());
        }
    }

    fn config_lint(&self) -> Result<()> {
        if self.loaded.diagnostics.is_empty() {
            println!("Configuration looks good.");
            return Ok(());
        }

        let mut has_error = false;
        for diag in &self.loaded.diagnostics {
            match diag.level {
                DiagnosticLevel::Warning => println!("warning: {}", diag.message),
                DiagnosticLevel::Error => {
                    println!("error: {}", diag.message);
                    has_error = true;
                }
            }
        }

        if has_error {
            Err(eyre!("configuration contains errors"))
        } else {
            Ok(())
        }
    }
}

fn print_new_log_lines<T: crate::transport::Transport>(
    session: &SessionController<T>,
    from: usize,
) -> usize {
    let lines = session.log().since(from);
    for line in lines {
        match LogLine::classify(line) {
            LogLine::Error(text) => eprintln!("{text}"),
            LogLine::Spoken { speaker, message } => println!("  {speaker}: {message}"),
            LogLine::Plain(text) => println!("{text}"),
        }
    }
    from + lines.len()
}

fn print_new_results<T: crate::transport::Transport>(
    session: &SessionController<T>,
    from: usize,
) -> usize {
    let results = session.results().all();
    for result in results.get(from..).unwrap_or_default() {
        println!(
            "[cycle {}] {:<24} score {:>4.1}  {}",
            result.cycle,
            util::truncate(&result.persona.name, 24),
            result.score,
            if result.passed { "PASS" } else { "FAIL" }
        );
    }
    results.len()
}

fn print_session_summary<T: crate::transport::Transport>(session: &SessionController<T>) {
    let results = session.results();
    println!();
    println!("Status: {}", session.status());
    println!(
        "Scenarios: {}  Pass rate: {}  Average score: {:.1}",
        results.len(),
        util::format_percent(results.pass_rate()),
        results.average_score()
    );
    print_cycle_table(&results.grouped_by_cycle());
    if let Some(latest) = session.prompts().latest() {
        println!();
        println!("Latest prompt revision (cycle {}):", latest.cycle);
        println!("  {}", latest.reasoning);
        print_diff_stats(&latest.old_prompt, &latest.new_prompt);
    }
}

fn print_cycle_table(groups: &[CycleGroup<'_>]) {
    if groups.is_empty() {
        return;
    }
    println!("{:<8} {:<10} {:<10} {:<8}", "Cycle", "Scenarios", "Pass", "Avg");
    for group in groups {
        println!(
            "{:<8} {:<10} {:<10} {:<8.1}",
            group.cycle,
            group.results.len(),
            util::format_percent(group.pass_rate()),
            group.average_score()
        );
    }
}

fn print_diff_stats(old: &str, new: &str) {
    let segments = diff::diff_words(old, new);
    let count = |kind: SegmentKind| {
        segments
            .iter()
            .filter(|segment| segment.kind == kind)
            .map(|segment| segment.text.split_whitespace().count())
            .sum::<usize>()
    };
    println!(
        "  +{} words, -{} words",
        count(SegmentKind::Added),
        count(SegmentKind::Removed)
    );
}

fn session_summary_json<T: crate::transport::Transport>(
    session: &SessionController<T>,
) -> serde_json::Value {
    let results = session.results();
    let cycles: Vec<_> = results
        .grouped_by_cycle()
        .iter()
        .map(|group| {
            json!({
                "cycle": group.cycle,
                "scenarios": group.results.len(),
                "pass_rate": group.pass_rate(),
                "average_score": group.average_score(),
            })
        })
        .collect();
    json!({
        "status": session.status().label(),
        "error": match session.status() {
            SessionStatus::Errored { reason } => Some(reason.to_string()),
            _ => None,
        },
        "pass_rate": results.pass_rate(),
        "average_score": results.average_score(),
        "cycles": cycles,
        "results": results.all(),
        "optimizations": session.prompts().all().collect::<Vec<_>>(),
        "log": session.log().lines(),
        "dropped_events": session.protocol_errors(),
    })
}

/// Runs as written by `history show --json` (one object) or the server's
/// listing (an array).
fn parse_exported_runs(text: &str) -> serde_json::Result<Vec<HistoryItem>> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum Exported {
        Many(Vec<HistoryItem>),
        One(Box<HistoryItem>),
    }

    Ok(match serde_json::from_str(text)? {
        Exported::Many(runs) => runs,
        Exported::One(run) => vec![*run],
    })
}

fn history_row_json(item: &HistoryItem) -> serde_json::Value {
    json!({
        "id": item.id,
        "timestamp": item.timestamp,
        "success_rate": item.success_rate,
        "total_cycles": item.total_cycles,
        "model_name": item.config.model_name,
        "scenarios": item.results.len(),
        "met_target": item.met_target(),
    })
}

fn print_history_table(items: &[HistoryItem]) {
    if items.is_empty() {
        println!("No completed runs.");
        return;
    }
    println!(
        "{:<16} {:<17} {:<8} {:<7} {:<24}",
        "Run ID", "When", "Success", "Cycles", "Model"
    );
    println!("{}", "-".repeat(76));
    for item in items {
        println!(
            "{:<16} {:<17} {:<8} {:<7} {:<24}",
            util::truncate(&item.id, 16),
            util::format_timestamp(&item.timestamp),
            util::format_percent(item.success_rate),
            item.total_cycles,
            util::truncate(&item.config.model_name, 24),
        );
    }
}

fn print_history_item(item: &HistoryItem) {
    println!("Run {}", item.id);
    println!("When: {}", util::format_timestamp(&item.timestamp));
    println!(
        "Model: {}  Cycles: {}  Batch: {}",
        item.config.model_name, item.total_cycles, item.config.batch_size
    );
    println!(
        "Success rate: {}{}",
        util::format_percent(item.success_rate),
        if item.met_target() { " (target met)" } else { "" }
    );
    println!();
    print_cycle_table(&store::group_by_cycle(&item.results));

    for entry in &item.optimization_history {
        println!();
        println!("Revision after cycle {}: {}", entry.cycle, entry.reasoning);
        print_diff_stats(&entry.old_prompt, &entry.new_prompt);
    }
}

#[cfg(test)]
mod tests;
