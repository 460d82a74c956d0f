// backuptool/src/errors.rs
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dump command for database {database} failed with status: {status}")]
    DumpFailure {
        database: String,
        status: ExitStatus,
    },

    #[error("File name {0:?} does not adhere to the backup file format")]
    Naming(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
