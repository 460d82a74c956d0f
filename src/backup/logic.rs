// backuptool/src/backup/logic.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tempfile::Builder as TempFileBuilder;
use tokio::sync::Semaphore;
use tracing::{error, info, info_span};
use uuid::Uuid;

use crate::backup::archive;
use crate::backup::db_dump::{DumpProducer, PgDumpProducer};
use crate::backup::naming::{self, BackupEntry};
use crate::config::{BackupConfig, KeepRule, RetentionTier};
use crate::utils::files;

/// Creates and manages the backups of one database.
///
/// Each [`run_cycle`](BackupManager::run_cycle) produces a fresh dump, stores
/// it only if its content differs from the most recent stored backup
/// (an unchanged dump folds into the existing file by renaming it forward),
/// and then prunes the backup directory along the retention tier table.
pub struct BackupManager {
    database: String,
    backup_dir: PathBuf,
    producer: Box<dyn DumpProducer>,
    tiers: Vec<RetentionTier>,
}

impl BackupManager {
    pub fn new(
        database: &str,
        backup_dir: &Path,
        producer: Box<dyn DumpProducer>,
        tiers: Vec<RetentionTier>,
    ) -> Self {
        Self {
            database: database.to_string(),
            backup_dir: backup_dir.to_path_buf(),
            producer,
            tiers,
        }
    }

    /// Executes one full backup cycle: dump, fold-or-store, cleanup.
    ///
    /// Only dump production failure aborts the cycle; storage and pruning
    /// problems are logged and degrade gracefully, so one misbehaving file
    /// never blocks backup production for the rest of the set. The working
    /// directory is removed with all its contents whatever happens after it
    /// was created.
    pub fn run_cycle(&self) -> Result<()> {
        info!("Start managing backups for database {:?}", self.database);

        // Exclusive scratch space, so dump production and comparison never
        // interfere with concurrently running databases.
        let work_dir = TempFileBuilder::new()
            .prefix(&format!("backup_{}_", self.database))
            .tempdir()
            .with_context(|| {
                format!(
                    "Failed to create working directory for database {}",
                    self.database
                )
            })?;
        info!(path = %work_dir.path().display(), "Created working directory");

        // The wall clock is captured once, so every field of the dump name
        // renders the same instant.
        let now = Local::now();
        let dump_name = naming::dump_file_name(&self.database, now);
        let dump_path = work_dir.path().join(&dump_name);

        info!(file = %dump_name, "Creating SQL dump");
        self.producer.produce(&dump_path).with_context(|| {
            format!("Dump production failed for database {}", self.database)
        })?;
        info!(file = %dump_name, "SQL dump created");

        self.fold_or_store(work_dir.path(), &dump_path);
        self.clean_up_backups();

        // The TempDir removes itself and its contents on drop; dropping it
        // here keeps the teardown as the last action of the cycle.
        drop(work_dir);
        Ok(())
    }

    /// Decides whether the fresh dump duplicates the most recent stored
    /// backup. Unchanged content folds into the existing file via a rename to
    /// the new name; changed content is compressed as a separate file. All
    /// failures in this step leave the directory in a recoverable state and
    /// never abort the cycle.
    fn fold_or_store(&self, work_dir: &Path, dump_path: &Path) {
        let most_recent = match naming::list_backups(&self.backup_dir, &self.database) {
            Ok(backups) => backups.into_iter().next_back(),
            Err(e) => {
                error!(error = %e, "Could not list existing backups, storing the fresh dump unconditionally");
                None
            }
        };

        match most_recent {
            None => {
                info!("Storing the fresh dump as there are no older backups");
                self.store(dump_path);
            }
            Some(previous) => match self.duplicates_previous(work_dir, dump_path, &previous) {
                Ok(true) => self.fold(dump_path, &previous),
                Ok(false) => {
                    info!("Storing the fresh dump as there are recent changes");
                    self.store(dump_path);
                }
                Err(e) => {
                    // A duplicate file is recoverable, a dropped dump is not.
                    error!(
                        error = %e,
                        previous = %previous.path.display(),
                        "Could not compare against the most recent backup, storing the fresh dump"
                    );
                    self.store(dump_path);
                }
            },
        }
    }

    /// Decompresses the most recent backup next to the fresh dump and
    /// compares the two line by line.
    fn duplicates_previous(
        &self,
        work_dir: &Path,
        dump_path: &Path,
        previous: &BackupEntry,
    ) -> crate::errors::Result<bool> {
        info!(
            file = %previous.path.display(),
            "Unzipping the most recent backup for comparison"
        );
        let unpacked = archive::decompress_file(&previous.path, work_dir)?;
        files::files_equal(dump_path, &unpacked)
    }

    fn store(&self, dump_path: &Path) {
        match archive::compress_file(dump_path, &self.backup_dir) {
            Ok(stored) => info!(file = %stored.display(), "Stored new backup"),
            Err(e) => error!(error = %e, "Failed to store the fresh dump"),
        }
    }

    /// The dedup optimization: the most recent backup already holds the same
    /// content, so it is renamed to the fresh dump's compressed name instead
    /// of compressing and storing the same bytes again.
    fn fold(&self, dump_path: &Path, previous: &BackupEntry) {
        let Some(dump_name) = dump_path.file_name() else {
            error!(path = %dump_path.display(), "Fresh dump path has no file name, skipping rename");
            return;
        };
        let mut compressed_name = dump_name.to_os_string();
        compressed_name.push(".");
        compressed_name.push(naming::COMPRESSED_EXT);
        let to = self.backup_dir.join(compressed_name);

        info!(
            from = %previous.path.display(),
            to = %to.display(),
            "Updating the name of the most recent backup since there are no changes"
        );
        if let Err(e) = fs::rename(&previous.path, &to) {
            // The old file stays behind under its old name; it is still a
            // valid backup, merely age-misattributed until the next cycle.
            error!(
                error = %e,
                from = %previous.path.display(),
                to = %to.display(),
                "Could not move the most recent backup to its new name"
            );
        }
    }

    /// Prunes the backup directory for this database. Evaluated against the
    /// wall clock at the time of the call, not the cycle's dump timestamp.
    fn clean_up_backups(&self) {
        info!("Performing cleanup of old backups");
        let now_ms = Local::now().timestamp_millis();

        let backups = match naming::list_backups(&self.backup_dir, &self.database) {
            Ok(backups) => backups,
            Err(e) => {
                error!(error = %e, "Could not list backups for cleanup, skipping this pass");
                return;
            }
        };

        for (backup, reason) in select_obsolete(&backups, &self.tiers, now_ms) {
            match reason {
                ObsoleteReason::BucketOccupied => info!(
                    file = %backup.path.display(),
                    "Backup is no longer necessary since an older one covers its bucket"
                ),
                ObsoleteReason::BeyondLastTier => info!(
                    file = %backup.path.display(),
                    "Backup is older than the retention horizon, marked obsolete"
                ),
            }
            if let Err(e) = fs::remove_file(&backup.path) {
                // Left on disk and re-evaluated on the next cleanup pass.
                error!(
                    error = %e,
                    file = %backup.path.display(),
                    "Could not remove obsolete backup"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObsoleteReason {
    /// An older backup already survived for the same bucket of this tier.
    BucketOccupied,
    /// Older than the last tier's age bound.
    BeyondLastTier,
}

/// Selects the backups the retention policy marks obsolete.
///
/// `backups` must be ascending by timestamp. The walk assigns each backup to
/// the first tier whose age bound exceeds its age. A `keep: all` tier keeps
/// everything; a bucketed tier keeps the first backup seen per bucket (the
/// chronologically oldest one) and marks the rest of that bucket; backups
/// beyond the last tier are always marked.
fn select_obsolete<'a>(
    backups: &'a [BackupEntry],
    tiers: &[RetentionTier],
    now_ms: i64,
) -> Vec<(&'a BackupEntry, ObsoleteReason)> {
    let mut to_remove = Vec::new();
    let mut last_kept_bucket: Vec<Option<u32>> = vec![None; tiers.len()];

    for backup in backups {
        let age_ms = now_ms - backup.timestamp_ms;
        match tiers.iter().position(|tier| age_ms < tier.max_age_ms) {
            None => to_remove.push((backup, ObsoleteReason::BeyondLastTier)),
            Some(index) => {
                let bucket = match tiers[index].keep {
                    KeepRule::All => continue,
                    KeepRule::Hourly => backup.hour,
                    KeepRule::Daily => backup.day,
                };
                if last_kept_bucket[index] == Some(bucket) {
                    to_remove.push((backup, ObsoleteReason::BucketOccupied));
                } else {
                    last_kept_bucket[index] = Some(bucket);
                }
            }
        }
    }

    to_remove
}

/// Orchestrates one retention cycle per configured database.
///
/// Cycles run concurrently on the blocking pool, bounded by
/// `max_parallel_backups`. Every run carries the database name and a fresh
/// run id in its span for log correlation. All runs are joined before this
/// returns, and failures are reported in aggregate so that one database
/// never hides or blocks another.
pub async fn perform_backup_orchestration(config: &BackupConfig) -> Result<()> {
    if !config.backup_dir.exists() || !config.backup_dir.is_dir() {
        anyhow::bail!(
            "Given backup directory does not exist: {}",
            config.backup_dir.display()
        );
    }

    let semaphore = Arc::new(Semaphore::new(config.max_parallel_backups));
    let mut handles = Vec::with_capacity(config.databases.len());

    for database in &config.databases {
        let database = database.clone();
        let backup_dir = config.backup_dir.clone();
        let dump_command = config.dump_command.clone();
        let tiers = config.retention_tiers.clone();
        let semaphore = Arc::clone(&semaphore);
        let run_id = Uuid::new_v4();

        info!(database = %database, run_id = %run_id, "Starting backup run");
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .context("Backup semaphore closed unexpectedly")?;

            tokio::task::spawn_blocking(move || {
                let span = info_span!("backup_run", database = %database, run_id = %run_id);
                let _guard = span.enter();

                let producer = PgDumpProducer::new(&database, &dump_command)?;
                let manager =
                    BackupManager::new(&database, &backup_dir, Box::new(producer), tiers);
                manager
                    .run_cycle()
                    .map(|()| database.clone())
                    .map_err(|e| e.context(format!("Backup cycle failed for database {}", database)))
            })
            .await
            .context("Backup worker panicked")?
        });
        handles.push(handle);
    }

    let mut failures = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Ok(database)) => info!(database = %database, "Backup run finished"),
            Ok(Err(e)) => {
                failures += 1;
                error!(error = ?e, "Backup run failed");
            }
            Err(e) => {
                failures += 1;
                error!(error = %e, "Backup task aborted");
            }
        }
    }

    if failures > 0 {
        anyhow::bail!(
            "{} of {} backup runs failed",
            failures,
            config.databases.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_retention_tiers;
    use crate::errors::AppError;
    use chrono::Duration as ChronoDuration;
    use std::collections::BTreeSet;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::thread;
    use std::time::Duration;

    /// Stands in for the external dump command with fixed output.
    struct FixedProducer {
        content: &'static str,
    }

    impl DumpProducer for FixedProducer {
        fn produce(&self, output_path: &Path) -> crate::errors::Result<PathBuf> {
            fs::write(output_path, self.content)?;
            Ok(output_path.to_path_buf())
        }
    }

    /// Simulates a dump command exiting non-zero.
    struct FailingProducer;

    impl DumpProducer for FailingProducer {
        fn produce(&self, _output_path: &Path) -> crate::errors::Result<PathBuf> {
            Err(AppError::DumpFailure {
                database: "sketchlab".to_string(),
                status: ExitStatus::from_raw(256),
            })
        }
    }

    fn manager(backup_dir: &Path, database: &str, content: &'static str) -> BackupManager {
        BackupManager::new(
            database,
            backup_dir,
            Box::new(FixedProducer { content }),
            default_retention_tiers(),
        )
    }

    fn entry(timestamp_ms: i64, hour: u32, day: u32) -> BackupEntry {
        BackupEntry {
            path: PathBuf::from(format!("backup_{timestamp_ms}.sql.gz")),
            timestamp_ms,
            hour,
            day,
        }
    }

    fn stored_name_at(database: &str, at: chrono::DateTime<Local>) -> String {
        format!(
            "{}.{}",
            naming::dump_file_name(database, at),
            naming::COMPRESSED_EXT
        )
    }

    fn directory_snapshot(dir: &Path) -> BTreeSet<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn unchanged_content_folds_into_a_single_file() -> anyhow::Result<()> {
        let backup_dir = tempfile::tempdir()?;
        let content = "CREATE TABLE users;\nINSERT INTO users VALUES (1);\n";

        manager(backup_dir.path(), "shop", content).run_cycle()?;
        let first = naming::list_backups(backup_dir.path(), "shop")?;
        assert_eq!(first.len(), 1);

        // Distinct millisecond timestamps keep the rename-forward observable.
        thread::sleep(Duration::from_millis(5));
        manager(backup_dir.path(), "shop", content).run_cycle()?;

        let second = naming::list_backups(backup_dir.path(), "shop")?;
        assert_eq!(second.len(), 1);
        assert!(second[0].timestamp_ms > first[0].timestamp_ms);
        Ok(())
    }

    #[test]
    fn changed_content_is_stored_as_a_second_readable_file() -> anyhow::Result<()> {
        let backup_dir = tempfile::tempdir()?;

        manager(backup_dir.path(), "shop", "INSERT INTO users VALUES (1);\n").run_cycle()?;
        thread::sleep(Duration::from_millis(5));
        manager(backup_dir.path(), "shop", "INSERT INTO users VALUES (2);\n").run_cycle()?;

        let backups = naming::list_backups(backup_dir.path(), "shop")?;
        assert_eq!(backups.len(), 2);

        // Both artifacts round-trip through the codec independently.
        let unpack_dir = tempfile::tempdir()?;
        let old = archive::decompress_file(&backups[0].path, unpack_dir.path())?;
        assert_eq!(fs::read_to_string(&old)?, "INSERT INTO users VALUES (1);\n");
        let new = archive::decompress_file(&backups[1].path, unpack_dir.path())?;
        assert_eq!(fs::read_to_string(&new)?, "INSERT INTO users VALUES (2);\n");
        Ok(())
    }

    #[test]
    fn an_unreadable_previous_backup_does_not_block_the_cycle() -> anyhow::Result<()> {
        let backup_dir = tempfile::tempdir()?;
        let garbage = stored_name_at("shop", Local::now() - ChronoDuration::minutes(10));
        fs::write(backup_dir.path().join(&garbage), "not a gzip stream")?;

        manager(backup_dir.path(), "shop", "INSERT INTO users VALUES (1);\n").run_cycle()?;

        // The fresh dump was stored as a separate file next to the broken one.
        let backups = naming::list_backups(backup_dir.path(), "shop")?;
        assert_eq!(backups.len(), 2);
        Ok(())
    }

    #[test]
    fn backups_beyond_the_retention_horizon_are_pruned() -> anyhow::Result<()> {
        let backup_dir = tempfile::tempdir()?;
        let ancient = stored_name_at("shop", Local::now() - ChronoDuration::hours(25));
        let recent = stored_name_at("shop", Local::now() - ChronoDuration::minutes(30));
        fs::write(backup_dir.path().join(&ancient), "stale")?;
        fs::write(backup_dir.path().join(&recent), "stale")?;

        manager(backup_dir.path(), "shop", "INSERT INTO users VALUES (1);\n").run_cycle()?;

        let snapshot = directory_snapshot(backup_dir.path());
        assert!(!snapshot.contains(&ancient), "25h old backup must be pruned");
        assert!(snapshot.contains(&recent), "30min old backup must survive");
        Ok(())
    }

    #[test]
    fn a_dump_failure_leaves_the_backup_directory_untouched() -> anyhow::Result<()> {
        let backup_dir = tempfile::tempdir()?;
        let existing = stored_name_at("sketchlab", Local::now() - ChronoDuration::hours(1));
        fs::write(backup_dir.path().join(&existing), "stale")?;
        let before = directory_snapshot(backup_dir.path());

        let failing = BackupManager::new(
            "sketchlab",
            backup_dir.path(),
            Box::new(FailingProducer),
            default_retention_tiers(),
        );
        let result = failing.run_cycle();

        let error = result.expect_err("the cycle must abort on dump failure");
        assert!(
            error
                .chain()
                .any(|cause| matches!(
                    cause.downcast_ref::<AppError>(),
                    Some(AppError::DumpFailure { .. })
                )),
            "unexpected error chain: {error:?}"
        );
        assert_eq!(before, directory_snapshot(backup_dir.path()));
        Ok(())
    }

    #[test]
    fn concurrent_databases_never_touch_each_others_files() -> anyhow::Result<()> {
        let backup_dir = tempfile::tempdir()?;

        thread::scope(|scope| {
            for (database, content) in [
                ("alpha", "INSERT INTO a VALUES (1);\n"),
                ("beta", "INSERT INTO b VALUES (1);\n"),
            ] {
                let dir = backup_dir.path();
                scope.spawn(move || {
                    manager(dir, database, content).run_cycle().unwrap();
                    thread::sleep(Duration::from_millis(5));
                    manager(dir, database, content).run_cycle().unwrap();
                });
            }
        });

        // Each database folded its unchanged second cycle into one file and
        // left the other database's backup alone.
        assert_eq!(naming::list_backups(backup_dir.path(), "alpha")?.len(), 1);
        assert_eq!(naming::list_backups(backup_dir.path(), "beta")?.len(), 1);
        assert_eq!(directory_snapshot(backup_dir.path()).len(), 2);
        Ok(())
    }

    #[test]
    fn tier_walk_keeps_the_oldest_backup_per_duplicated_hour() {
        let now_ms = 1_700_000_000_000_i64;
        let at = |minutes: i64| now_ms - minutes * 60_000;

        // Ascending by timestamp: 25h, 3h1m, 3h (same hour bucket as 3h1m),
        // 1h59m, 1h.
        let backups = vec![
            entry(at(1500), 1, 14),
            entry(at(181), 9, 15),
            entry(at(180), 9, 15),
            entry(at(119), 10, 15),
            entry(at(60), 11, 15),
        ];

        let removed = select_obsolete(&backups, &default_retention_tiers(), now_ms);
        let removed_timestamps: Vec<i64> = removed.iter().map(|(b, _)| b.timestamp_ms).collect();
        assert_eq!(removed_timestamps, vec![at(1500), at(180)]);
        assert_eq!(removed[0].1, ObsoleteReason::BeyondLastTier);
        assert_eq!(removed[1].1, ObsoleteReason::BucketOccupied);
    }

    #[test]
    fn tier_walk_keeps_everything_in_the_first_tier() {
        let now_ms = 1_700_000_000_000_i64;
        let backups = vec![
            entry(now_ms - 90 * 60_000, 8, 15),
            entry(now_ms - 30 * 60_000, 9, 15),
            // Same hour bucket, still inside the keep-all window.
            entry(now_ms - 20 * 60_000, 9, 15),
        ];

        let removed = select_obsolete(&backups, &default_retention_tiers(), now_ms);
        assert!(removed.is_empty());
    }

    #[test]
    fn a_daily_tier_buckets_by_day_of_month() {
        let now_ms = 1_700_000_000_000_i64;
        let tiers = vec![
            RetentionTier {
                max_age_ms: 2 * 60 * 60 * 1000,
                keep: KeepRule::All,
            },
            RetentionTier {
                max_age_ms: 24 * 60 * 60 * 1000,
                keep: KeepRule::Hourly,
            },
            RetentionTier {
                max_age_ms: 72 * 60 * 60 * 1000,
                keep: KeepRule::Daily,
            },
        ];

        let backups = vec![
            entry(now_ms - 80 * 60 * 60_000, 3, 12),
            entry(now_ms - 40 * 60 * 60_000, 5, 13),
            entry(now_ms - 30 * 60 * 60_000, 20, 13),
            entry(now_ms - 60 * 60_000, 10, 15),
        ];

        let removed = select_obsolete(&backups, &tiers, now_ms);
        let removed_timestamps: Vec<i64> = removed.iter().map(|(b, _)| b.timestamp_ms).collect();
        // The 80h backup is beyond the horizon; of the two sharing day 13 the
        // chronologically older one survives.
        assert_eq!(
            removed_timestamps,
            vec![now_ms - 80 * 60 * 60_000, now_ms - 30 * 60 * 60_000]
        );
    }

    #[tokio::test]
    async fn orchestrator_runs_every_database_and_joins_them() -> anyhow::Result<()> {
        let backup_dir = tempfile::tempdir()?;
        let config = BackupConfig {
            databases: vec!["alpha".to_string(), "beta".to_string()],
            backup_dir: backup_dir.path().to_path_buf(),
            // `echo <database>` stands in for the real dump command.
            dump_command: "echo".to_string(),
            max_parallel_backups: 2,
            retention_tiers: default_retention_tiers(),
        };

        perform_backup_orchestration(&config).await?;

        for database in ["alpha", "beta"] {
            let backups = naming::list_backups(backup_dir.path(), database)?;
            assert_eq!(backups.len(), 1, "expected one backup for {database}");

            let unpack_dir = tempfile::tempdir()?;
            let plain = archive::decompress_file(&backups[0].path, unpack_dir.path())?;
            assert_eq!(fs::read_to_string(&plain)?, format!("{database}\n"));
        }
        Ok(())
    }

    #[tokio::test]
    async fn orchestrator_reports_a_missing_backup_directory() {
        let config = BackupConfig {
            databases: vec!["alpha".to_string()],
            backup_dir: PathBuf::from("/nonexistent/backup/root"),
            dump_command: "echo".to_string(),
            max_parallel_backups: 1,
            retention_tiers: default_retention_tiers(),
        };

        assert!(perform_backup_orchestration(&config).await.is_err());
    }
}
