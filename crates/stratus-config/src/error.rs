use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration directory not found")]
    ConfigDirNotFound,

    #[error(
        "No configuration file found. Looked for:\n\
        - current directory: stratus.local.yaml, stratus.yaml\n\
        - ./.stratus/ directory\n\
        - ~/.config/stratus/stratus.yaml\n\
        Set STRATUS_CONFIG_PATH to point at a file directly"
    )]
    ConfigFileNotFound,

    #[error("Invalid configuration in {path}: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
