// backuptool/src/config/mod.rs
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::backup::db_dump::{DEFAULT_DUMP_COMMAND, validate_database_name};

/// Default bound on concurrently running database cycles.
const DEFAULT_MAX_PARALLEL_BACKUPS: usize = 4;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRetentionTier {
    pub max_age_hours: u64,
    pub keep: KeepRule,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub database_list: Option<serde_json::Value>,
    pub backup_dir: Option<PathBuf>,
    pub dump_command: Option<String>,
    pub max_parallel_backups: Option<usize>,
    pub retention_tiers: Option<Vec<JsonRetentionTier>>,
}

/// How densely backups inside a retention tier are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeepRule {
    /// Every backup in the tier survives.
    All,
    /// The oldest backup per hour-of-day bucket survives.
    Hourly,
    /// The oldest backup per day-of-month bucket survives.
    Daily,
}

/// One age range of the retention policy. A backup belongs to the first tier
/// whose `max_age_ms` exceeds its age; backups older than the last tier are
/// obsolete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionTier {
    pub max_age_ms: i64,
    pub keep: KeepRule,
}

/// The default policy: keep everything for two hours, then one backup per
/// hour for a day, then nothing.
pub fn default_retention_tiers() -> Vec<RetentionTier> {
    vec![
        RetentionTier {
            max_age_ms: 2 * 60 * 60 * 1000,
            keep: KeepRule::All,
        },
        RetentionTier {
            max_age_ms: 24 * 60 * 60 * 1000,
            keep: KeepRule::Hourly,
        },
    ]
}

/// Application's internal, validated configuration.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub databases: Vec<String>,
    pub backup_dir: PathBuf,
    pub dump_command: String,
    pub max_parallel_backups: usize,
    pub retention_tiers: Vec<RetentionTier>,
}

impl BackupConfig {
    /// Loads `config.json` and applies the environment overrides
    /// (`DATABASE_LIST`, `BACKUP_DIR`, `DUMP_COMMAND`). A missing config file
    /// is tolerated as long as the environment supplies the required
    /// settings.
    pub fn load(config_path: &Path) -> Result<Self> {
        let raw = if config_path.exists() {
            let config_content = fs::read_to_string(config_path).with_context(|| {
                format!("Failed to read config file at {}", config_path.display())
            })?;
            serde_json::from_str(&config_content).with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?
        } else {
            RawJsonConfig::default()
        };

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let databases = match env::var("DATABASE_LIST") {
            Ok(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => parse_database_list(&raw.database_list)?.unwrap_or_default(),
        };
        if databases.is_empty() {
            anyhow::bail!(
                "No databases configured. Set database_list in config.json or the DATABASE_LIST environment variable."
            );
        }
        for database in &databases {
            validate_database_name(database)
                .with_context(|| format!("Invalid entry in database list: {:?}", database))?;
        }

        let backup_dir = match env::var("BACKUP_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => raw.backup_dir.context(
                "backup_dir must be set in config.json or via the BACKUP_DIR environment variable",
            )?,
        };

        let dump_command = env::var("DUMP_COMMAND")
            .ok()
            .or(raw.dump_command)
            .unwrap_or_else(|| DEFAULT_DUMP_COMMAND.to_string());

        let max_parallel_backups = raw
            .max_parallel_backups
            .unwrap_or(DEFAULT_MAX_PARALLEL_BACKUPS);
        if max_parallel_backups == 0 {
            anyhow::bail!("max_parallel_backups must be at least 1");
        }

        let retention_tiers = match &raw.retention_tiers {
            Some(tiers) => convert_retention_tiers(tiers)?,
            None => default_retention_tiers(),
        };

        Ok(BackupConfig {
            databases,
            backup_dir,
            dump_command,
            max_parallel_backups,
            retention_tiers,
        })
    }
}

/// Parses the database_list configuration value. Accepts either an array of
/// database names or a mapping object, of which only the keys are used.
fn parse_database_list(database_list: &Option<serde_json::Value>) -> Result<Option<Vec<String>>> {
    match database_list {
        Some(value) => {
            if value.is_array() {
                let databases: Vec<String> = serde_json::from_value(value.clone())
                    .context("Failed to parse database_list as array")?;
                Ok(Some(databases))
            } else if value.is_object() {
                let mapping: HashMap<String, String> = serde_json::from_value(value.clone())
                    .context("Failed to parse database_list as mapping object")?;
                let mut databases: Vec<String> = mapping.into_keys().collect();
                databases.sort();
                Ok(Some(databases))
            } else {
                Err(anyhow::anyhow!(
                    "database_list must be either an array of database names or a mapping object"
                ))
            }
        }
        None => Ok(None),
    }
}

/// Validates the configured tier table: non-empty and strictly ascending by
/// age, so the first-matching-tier walk is well defined.
fn convert_retention_tiers(tiers: &[JsonRetentionTier]) -> Result<Vec<RetentionTier>> {
    if tiers.is_empty() {
        anyhow::bail!("retention_tiers must not be empty when present");
    }

    let converted: Vec<RetentionTier> = tiers
        .iter()
        .map(|tier| RetentionTier {
            max_age_ms: (tier.max_age_hours as i64) * 60 * 60 * 1000,
            keep: tier.keep,
        })
        .collect();

    for pair in converted.windows(2) {
        if pair[1].max_age_ms <= pair[0].max_age_ms {
            anyhow::bail!("retention_tiers must be strictly ascending by max_age_hours");
        }
    }

    Ok(converted)
}
