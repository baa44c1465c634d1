use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use color_eyre::Result;
use color_eyre::eyre::{Context, eyre};
use directories::ProjectDirs;
use toml::Value;

mod merge;
pub mod model;

pub use model::{Config, ConfigDiagnostic, DiagnosticLevel};

const MAIN_CONFIG: &str = "config.toml";
const DROPIN_DIR: &str = "conf.d";
const APP_NAME: &str = "odeon";

pub const CONFIG_DIR_ENV: &str = "ODEON_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "ODEON_DATA_DIR";

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub merged: Value,
    pub directories: AppDirectories,
    pub sources: Vec<ConfigSource>,
    pub diagnostics: Vec<ConfigDiagnostic>,
}

#[derive(Debug, Clone)]
pub struct AppDirectories {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl AppDirectories {
    /// Resolve directories from the override, the environment, or the
    /// platform defaults, in that order.
    ///
    /// # Errors
    ///
    /// Returns an error when no home directory can be determined.
    pub fn resolve(dir_override: Option<&Path>) -> Result<Self> {
        let project_dirs = ProjectDirs::from("", "", APP_NAME)
            .ok_or_else(|| eyre!("unable to resolve platform directories for {APP_NAME}"))?;

        let config_dir = dir_override
            .map(PathBuf::from)
            .or_else(|| env::var_os(CONFIG_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(|| project_dirs.config_dir().to_path_buf());
        let data_dir = env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| project_dirs.data_dir().to_path_buf());

        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    /// Create the data directory if it is missing. The configuration
    /// directory is only read, so it may legitimately not exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn ensure_data_dir(&self) -> Result<&Path> {
        if !self.data_dir.exists() {
            fs::create_dir_all(&self.data_dir).with_context(|| {
                format!("failed to create directory {}", self.data_dir.display())
            })?;
        }
        Ok(&self.data_dir)
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join(format!("{APP_NAME}.log"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSourceKind {
    Main,
    DropIn,
}

impl ConfigSourceKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            ConfigSourceKind::Main => "main",
            ConfigSourceKind::DropIn => "drop-in",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub kind: ConfigSourceKind,
    pub path: PathBuf,
}

/// Load and merge configuration files into a [`LoadedConfig`].
///
/// # Errors
///
/// Returns an error if any configuration file cannot be read, parsed, or
/// decoded into the configuration schema.
pub fn load(dir_override: Option<&Path>) -> Result<LoadedConfig> {
    let directories = AppDirectories::resolve(dir_override)?;
    load_from(directories)
}

/// Load configuration from already resolved directories.
///
/// # Errors
///
/// See [`load`].
pub fn load_from(directories: AppDirectories) -> Result<LoadedConfig> {
    let sources = gather_sources(&directories.config_dir)?;
    let mut merged_table = toml::map::Map::new();

    for source in &sources {
        let contents = fs::read_to_string(&source.path)
            .with_context(|| format!("failed to read {}", source.path.display()))?;
        let value: Value = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", source.path.display()))?;
        let Value::Table(table) = value else {
            return Err(eyre!(
                "{} must contain a TOML table at the top level",
                source.path.display()
            ));
        };
        merge::merge_tables(&mut merged_table, table, Some(&source.path))?;
    }

    let merged = Value::Table(merged_table);
    let config = Config::from_value(&merged)?;
    let diagnostics = config.lint();

    Ok(LoadedConfig {
        config,
        merged,
        directories,
        sources,
        diagnostics,
    })
}

fn gather_sources(root: &Path) -> Result<Vec<ConfigSource>> {
    if root.is_file() {
        return Ok(vec![ConfigSource {
            kind: ConfigSourceKind::Main,
            path: root.to_path_buf(),
        }]);
    }

    let mut sources = Vec::new();
    let main = root.join(MAIN_CONFIG);
    if main.is_file() {
        sources.push(ConfigSource {
            kind: ConfigSourceKind::Main,
            path: main,
        });
    }

    let conf_d = root.join(DROPIN_DIR);
    if conf_d.is_dir() {
        sources.extend(
            read_toml_files(&conf_d)?
                .into_iter()
                .map(|path| ConfigSource {
                    kind: ConfigSourceKind::DropIn,
                    path,
                }),
        );
    }

    Ok(sources)
}

fn read_toml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to read directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
