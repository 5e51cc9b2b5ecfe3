//! Run configuration: optional TOML file, overridden by CLI flags and
//! environment variables.

use crate::error::{MigrateError, MigrateResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CURRENCY: &str = "EGP";
pub const DEFAULT_PROGRESS_EVERY: usize = 50;

/// Fully resolved settings for one migration run.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrateConfig {
    pub staging_db: PathBuf,
    pub target_db: PathBuf,
    pub currency: String,
    /// Log progress every N records; 0 disables progress lines.
    pub progress_every: usize,
    pub backup_dir: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub skip_already_imported: bool,
}

/// Shape of the TOML file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub staging_db: Option<PathBuf>,
    pub target_db: Option<PathBuf>,
    pub currency: Option<String>,
    pub progress_every: Option<usize>,
    pub backup_dir: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub skip_already_imported: Option<bool>,
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub staging_db: Option<PathBuf>,
    pub target_db: Option<PathBuf>,
    pub currency: Option<String>,
    pub progress_every: Option<usize>,
    pub backup_dir: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    /// `--reimport`: process records even when already traced in the target.
    pub reimport: bool,
}

pub fn load_config_file(path: &Path) -> MigrateResult<ConfigFile> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        MigrateError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_config_file(&text)
        .map_err(|e| MigrateError::Config(format!("{}: {}", path.display(), e)))
}

pub fn parse_config_file(text: &str) -> Result<ConfigFile, toml::de::Error> {
    toml::from_str(text)
}

impl MigrateConfig {
    /// Merge sources with priority overrides > file > defaults and validate.
    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> MigrateResult<Self> {
        let staging_db = overrides
            .staging_db
            .or(file.staging_db)
            .ok_or_else(|| MigrateError::Config("staging_db is required".into()))?;
        let target_db = overrides
            .target_db
            .or(file.target_db)
            .ok_or_else(|| MigrateError::Config("target_db is required".into()))?;

        let currency = overrides
            .currency
            .or(file.currency)
            .unwrap_or_else(|| DEFAULT_CURRENCY.to_string())
            .trim()
            .to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(MigrateError::Config(format!(
                "currency must be a three-letter code, got {:?}",
                currency
            )));
        }

        let skip_already_imported = if overrides.reimport {
            false
        } else {
            file.skip_already_imported.unwrap_or(true)
        };

        let config = Self {
            staging_db,
            target_db,
            currency,
            progress_every: overrides
                .progress_every
                .or(file.progress_every)
                .unwrap_or(DEFAULT_PROGRESS_EVERY),
            backup_dir: overrides.backup_dir.or(file.backup_dir),
            report_path: overrides.report_path.or(file.report_path),
            skip_already_imported,
        };
        if config.staging_db == config.target_db {
            return Err(MigrateError::Config(
                "staging_db and target_db must be different databases".into(),
            ));
        }
        Ok(config)
    }
}
