//! Engine error types

use crate::state::Status;
use thiserror::Error;

/// StateStore failures
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Lock id rejected for {path}: {message}")]
    StaleLock { path: String, message: String },

    #[error("State record {path} has version {found}, newer than supported version {supported}")]
    VersionTooNew {
        path: String,
        found: u32,
        supported: u32,
    },

    #[error("State backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// LockProvider and Locker failures
#[derive(Error, Debug)]
pub enum LockError {
    #[error("{path} is already locked by {holder}")]
    AlreadyLocked { path: String, holder: String },

    #[error("State of {entity} changed since it was planned; plan again")]
    StateMismatch { entity: String },

    #[error("Lock {lock_id} on {path} is not held")]
    NotHeld { path: String, lock_id: String },

    #[error("State error while locking: {0}")]
    State(#[from] StateError),

    #[error("Lock backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Entity-scoped planning failures, reported as `FailedToPlan`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("{entity} targets provider '{declared}' but the environment uses '{environment}'")]
    ProviderMismatch {
        entity: String,
        declared: String,
        environment: String,
    },

    #[error("{entity} is declared as '{declared}' but was previously created as '{existing}'")]
    ProductMismatch {
        entity: String,
        declared: String,
        existing: String,
    },

    #[error("{entity} has an operation in progress (status {status})")]
    PendingOperation { entity: String, status: Status },

    #[error("{entity} depends on {dependency}, which {reason}")]
    UnsatisfiableDependency {
        entity: String,
        dependency: String,
        reason: String,
    },

    #[error("{entity} depends on {dependency}, which failed to plan: {message}")]
    DependencyFailedToPlan {
        entity: String,
        dependency: String,
        message: String,
    },

    #[error("Cyclic dependency: {cycle}")]
    CyclicDependency { cycle: String },

    #[error("{entity} is declared twice")]
    DuplicateEntity { entity: String },

    #[error("No provisioner registered for {kind} product '{product}'")]
    NoProvisioner { kind: String, product: String },

    #[error("Output {reference} is not available")]
    UnresolvedInput { reference: String },
}

/// Top-level engine failures; these abort the whole operation
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Environment not found: {0}")]
    EnvironmentNotFound(String),

    #[error("Environment already exists: {0}")]
    EnvironmentExists(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Config(#[from] stratus_config::ConfigError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
