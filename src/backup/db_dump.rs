// backuptool/src/backup/db_dump.rs
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use which::which;

use crate::errors::{AppError, Result};

/// Default command used to create a database dump.
pub const DEFAULT_DUMP_COMMAND: &str = "pg_dump";

/// Produces one fresh, complete dump of a named database into a caller
/// supplied file path. This is the only database-engine-specific seam of the
/// engine; everything downstream of it is engine-agnostic.
pub trait DumpProducer: Send + Sync {
    /// Creates a dump and stores it in `output_path`. Returns the output path
    /// on success. Does not retry; retry policy, if any, belongs to the
    /// caller.
    fn produce(&self, output_path: &Path) -> Result<PathBuf>;
}

/// Creates a dump of a PostgreSQL database by spawning the dump command with
/// the database name as its only argument and redirecting stdout into the
/// output file. Assumes the command can be used without any additional
/// authentication or otherwise needed steps.
pub struct PgDumpProducer {
    database: String,
    command: PathBuf,
}

impl PgDumpProducer {
    /// Resolves `command` in the system PATH and builds a producer for
    /// `database`.
    pub fn new(database: &str, command: &str) -> Result<Self> {
        validate_database_name(database)?;
        let command = which(command).map_err(|e| {
            AppError::Config(format!(
                "{} executable not found in PATH ({}). Please ensure the database client tools are installed and in your PATH.",
                command, e
            ))
        })?;

        Ok(Self {
            database: database.to_string(),
            command,
        })
    }
}

impl DumpProducer for PgDumpProducer {
    fn produce(&self, output_path: &Path) -> Result<PathBuf> {
        let output_file = File::create(output_path)?;
        let status = Command::new(&self.command)
            .arg(&self.database)
            .stdout(Stdio::from(output_file))
            .status()?;

        if !status.success() {
            return Err(AppError::DumpFailure {
                database: self.database.clone(),
                status,
            });
        }

        Ok(output_path.to_path_buf())
    }
}

/// Rejects database names that could not have come from a sane
/// configuration. The name ends up as a subprocess argument and embedded in
/// file names, so the character set is kept tight.
pub fn validate_database_name(database: &str) -> Result<()> {
    if database.trim().is_empty()
        || database.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
    {
        return Err(AppError::Config(format!(
            "Invalid database name: {:?}. Only alphanumeric characters, '_' and '-' are allowed.",
            database
        )));
    }
    Ok(())
}
