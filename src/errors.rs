//! Errors for the AVL recorder.
use std::path::PathBuf;
use thiserror::Error;

use crate::codec::DecodeError;
use crate::database::TransactionError;

#[derive(Error, Debug)]
pub enum AvlRecorderError {
    #[error("Frame decode error")]
    DecodeError(#[from] DecodeError),

    #[error("Database error")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Database transaction error")]
    DatabaseTransactionError(#[from] TransactionError),

    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),

    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("Lock error")]
    LockError(String),

    #[error("Invalid IMEI")]
    InvalidImei(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device already exists: {0}")]
    DeviceExists(String),

    #[error("Failed to open database at {path}: {origin}")]
    DatabaseOpenError { path: PathBuf, origin: String },

    #[error("Database configuration error - {message}: {origin}")]
    DatabaseConfigError { message: String, origin: String },

    #[error("Failed to create table {table}: {origin}")]
    TableCreationError { table: String, origin: String },

    #[error("Failed to create index {index}: {origin}")]
    IndexCreationError { index: String, origin: String },

    #[error("Configuration invalid: {message}")]
    ConfigurationError { message: String },
}
