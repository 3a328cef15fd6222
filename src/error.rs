// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The underlying file handle was released by `close()`. Reading tasks
    /// treat this as a stop signal, never as a fault.
    #[error("file is closed")]
    Closed,

    #[error("reader is not running: {0}")]
    NotRunning(String),

    #[error("{0}")]
    Aggregate(String),
}

pub type Result<T> = std::result::Result<T, Error>;
