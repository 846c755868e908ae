//! Error types for flagrun
//!
//! Library crates return `FlagrunError`; binaries and orchestration glue wrap
//! it in `anyhow` with context.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlagrunError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type alias for flagrun operations
pub type FlagrunResult<T> = Result<T, FlagrunError>;
