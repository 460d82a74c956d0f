pub(crate) mod archive;
pub(crate) mod db_dump;
mod logic;
pub(crate) mod naming;

use anyhow::Result;

use crate::config::BackupConfig;

/// Public entry point for the backup process. Runs one retention cycle per
/// configured database, concurrently, and returns once all of them have
/// finished.
pub async fn run_backup_flow(config: &BackupConfig) -> Result<()> {
    logic::perform_backup_orchestration(config).await
}
