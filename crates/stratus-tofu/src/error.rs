//! OpenTofu provisioner error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TofuError {
    #[error("{0} not found. Please install OpenTofu: https://opentofu.org/docs/intro/install/")]
    BinaryNotFound(String),

    #[error("No module for product '{product}' at {}", path.display())]
    ModuleNotFound { product: String, path: PathBuf },

    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Invalid output from `{command}`: {message}")]
    InvalidOutput { command: String, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TofuError>;
