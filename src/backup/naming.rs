// backuptool/src/backup/naming.rs
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use regex::Regex;
use walkdir::WalkDir;

use crate::errors::{AppError, Result};

/// Extension of a plain, uncompressed dump file.
pub const DUMP_EXT: &str = "sql";

/// Extension appended to a dump once it has been compressed for storage.
pub const COMPRESSED_EXT: &str = "gz";

/// A stored backup file recognized by the naming scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    /// Creation timestamp in epoch milliseconds, read straight from its own
    /// field in the file name. The sole timestamp authority.
    pub timestamp_ms: i64,
    /// Hour-of-day field of the name (`HH`), the hourly retention bucket key.
    pub hour: u32,
    /// Day-of-month field of the name (`dd`), the daily retention bucket key.
    pub day: u32,
}

/// Builds the file name for a plain dump of `database` taken at `at`:
/// `backup_<database>_<yyMMdd>_<HHmmss>_<epochMillis>.sql`.
///
/// The date and time fields are redundant, human-readable renderings of the
/// same instant in local time; only the millisecond field is parsed back for
/// logic.
pub fn dump_file_name(database: &str, at: DateTime<Local>) -> String {
    format!(
        "backup_{}_{}_{}_{}.{}",
        database,
        at.format("%y%m%d"),
        at.format("%H%M%S"),
        at.timestamp_millis(),
        DUMP_EXT
    )
}

/// Compiles the pattern matching stored (compressed) backups of exactly
/// `database`. The name is escaped and the match anchored, so a scan for
/// database `A` never picks up backups of database `AB` or vice versa.
fn backup_file_regex(database: &str) -> Regex {
    Regex::new(&format!(
        r"^backup_{}_(\d{{6}})_(\d{{6}})_(\d+)\.{}\.{}$",
        regex::escape(database),
        DUMP_EXT,
        COMPRESSED_EXT
    ))
    .expect("backup file pattern is a valid regular expression")
}

/// Parses the name of a stored backup of `database` back into a
/// [`BackupEntry`]. Fails with [`AppError::Naming`] for any name that does
/// not match the scheme exactly; callers must never assume an arbitrary file
/// in the backup directory is a valid backup.
pub fn parse_backup_file_name(database: &str, path: &Path) -> Result<BackupEntry> {
    parse_with_regex(&backup_file_regex(database), path)
}

fn parse_with_regex(regex: &Regex, path: &Path) -> Result<BackupEntry> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AppError::Naming(path.display().to_string()))?;
    let captures = regex
        .captures(name)
        .ok_or_else(|| AppError::Naming(name.to_string()))?;

    let timestamp_ms: i64 = captures[3]
        .parse()
        .map_err(|_| AppError::Naming(name.to_string()))?;
    // Date is yyMMdd, time is HHmmss; only the bucket components are kept.
    let day: u32 = captures[1][4..6]
        .parse()
        .map_err(|_| AppError::Naming(name.to_string()))?;
    let hour: u32 = captures[2][0..2]
        .parse()
        .map_err(|_| AppError::Naming(name.to_string()))?;

    Ok(BackupEntry {
        path: path.to_path_buf(),
        timestamp_ms,
        hour,
        day,
    })
}

/// Walks `directory` one level deep and returns the stored backups belonging
/// to `database`, ascending by embedded timestamp. Entries that fail to parse
/// are silently excluded, not errored; foreign files are invisible to the
/// engine and are never deleted or compared.
pub fn list_backups(directory: &Path, database: &str) -> Result<Vec<BackupEntry>> {
    let regex = backup_file_regex(database);
    let mut entries = Vec::new();

    for entry in WalkDir::new(directory).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(parsed) = parse_with_regex(&regex, entry.path()) {
            entries.push(parsed);
        }
    }

    entries.sort_by_key(|entry| entry.timestamp_ms);
    Ok(entries)
}
