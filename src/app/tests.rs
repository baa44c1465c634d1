use assert_fs::TempDir;
use assert_fs::prelude::*;
use clap::Parser;
use color_eyre::Result;

use super::*;
use crate::config::AppDirectories;
use crate::test_support::toml_path;

fn loaded(temp: &TempDir, config: &str) -> Result<LoadedConfig> {
    let config_dir = temp.child("config");
    config_dir.create_dir_all()?;
    config_dir.child("config.toml").write_str(config)?;
    crate::config::load_from(AppDirectories {
        config_dir: config_dir.path().to_path_buf(),
        data_dir: temp.child("data").path().to_path_buf(),
    })
}

#[test]
fn run_flags_override_configured_defaults() -> Result<()> {
    let temp = TempDir::new()?;
    let prompt = temp.child("prompt.txt");
    prompt.write_str("You are Rachel from the bank.")?;
    let loaded = loaded(
        &temp,
        "[session]\nmodel_name = \"llama\"\nmax_cycles = 2\nbase_prompt = \"old\"\n",
    )?;
    let cli = Cli::try_parse_from(["odeon", "run"])?;
    let app = App { cli: &cli, loaded };

    let cmd = RunCommand {
        max_cycles: Some(7),
        batch_size: Some(3),
        model: Some("mixtral".into()),
        prompt_file: Some(prompt.path().to_path_buf()),
    };
    let config = app.session_config(&cmd)?;
    assert_eq!(config.max_cycles, 7);
    assert_eq!(config.batch_size, 3);
    assert_eq!(config.model_name, "mixtral");
    assert_eq!(config.base_prompt, "You are Rachel from the bank.");

    let unchanged = app.session_config(&RunCommand::default())?;
    assert_eq!(unchanged.max_cycles, 2);
    assert_eq!(unchanged.model_name, "llama");
    assert_eq!(unchanged.base_prompt, "old");
    Ok(())
}

#[test]
fn missing_prompt_file_names_the_path() -> Result<()> {
    let temp = TempDir::new()?;
    let loaded = loaded(&temp, "")?;
    let cli = Cli::try_parse_from(["odeon", "run"])?;
    let app = App { cli: &cli, loaded };

    let cmd = RunCommand {
        prompt_file: Some(temp.path().join("absent.txt")),
        ..RunCommand::default()
    };
    let err = app.session_config(&cmd).expect_err("missing file");
    assert!(err.to_string().contains("absent.txt"), "{err}");
    Ok(())
}

#[test]
fn archive_db_selects_the_local_database() -> Result<()> {
    let temp = TempDir::new()?;
    let db = temp.child("runs.db");
    let loaded = loaded(
        &temp,
        &format!("[server]\narchive_db = \"{}\"\n", toml_path(db.path())),
    )?;
    let cli = Cli::try_parse_from(["odeon", "history", "list"])?;
    let app = App { cli: &cli, loaded };

    let archive = app.open_archive()?;
    assert!(archive.list()?.is_empty());
    assert!(db.path().is_file());
    Ok(())
}

#[test]
fn bad_archive_url_is_rejected_before_any_request() -> Result<()> {
    let temp = TempDir::new()?;
    let loaded = loaded(&temp, "[server]\narchive_url = \"not a url\"\n")?;
    let cli = Cli::try_parse_from(["odeon", "history", "list"])?;
    let app = App { cli: &cli, loaded };

    let Err(err) = app.open_archive() else {
        panic!("invalid url accepted");
    };
    assert!(format!("{err:?}").contains("not a url"));
    Ok(())
}

#[test]
fn exported_runs_may_be_one_object_or_a_list() -> Result<()> {
    let one = parse_exported_runs(r#"{"id": "run-1", "success_rate": 0.5}"#)?;
    assert_eq!(one.len(), 1);
    assert_eq!(one[0].id, "run-1");

    let many = parse_exported_runs(r#"[{"id": "run-1"}, {"id": "run-2"}]"#)?;
    let ids: Vec<_> = many.iter().map(|run| run.id.as_str()).collect();
    assert_eq!(ids, ["run-1", "run-2"]);

    assert!(parse_exported_runs(r#"{"success_rate": 0.5}"#).is_err());
    Ok(())
}

#[test]
fn import_needs_a_local_database() -> Result<()> {
    let temp = TempDir::new()?;
    let loaded = loaded(&temp, "")?;
    let cli = Cli::try_parse_from(["odeon", "history", "import", "runs.json"])?;
    let app = App { cli: &cli, loaded };

    let err = app
        .history_import(&temp.path().join("runs.json"))
        .expect_err("no archive_db configured");
    assert!(err.to_string().contains("server.archive_db"), "{err}");
    Ok(())
}
