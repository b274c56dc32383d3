//! Lock contract
//!
//! One lock per entity (or environment) path. Acquisition fails fast with
//! [`LockError::AlreadyLocked`]; waiting is the caller's business, see
//! [`acquire_with_backoff`].

use crate::classify::OperationType;
use crate::entity::StatePath;
use crate::error::LockError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use stratus_config::LockRetryConfig;

/// Why a lock is being taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockOperation {
    Create,
    Update,
    Replace,
    Destroy,
    /// Environment-level lock around a batch of plan locks
    LockPlans,
    CreateEnvironment,
    DeleteEnvironment,
}

impl LockOperation {
    pub fn for_plan(operation: OperationType) -> Option<Self> {
        match operation {
            OperationType::Noop => None,
            OperationType::Create => Some(LockOperation::Create),
            OperationType::Update => Some(LockOperation::Update),
            OperationType::Replace => Some(LockOperation::Replace),
            OperationType::Destroy => Some(LockOperation::Destroy),
        }
    }
}

impl fmt::Display for LockOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockOperation::Create => "create",
            LockOperation::Update => "update",
            LockOperation::Replace => "replace",
            LockOperation::Destroy => "destroy",
            LockOperation::LockPlans => "lock_plans",
            LockOperation::CreateEnvironment => "create_environment",
            LockOperation::DeleteEnvironment => "delete_environment",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Completed,
    Abandoned,
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseReason::Completed => write!(f, "completed"),
            ReleaseReason::Abandoned => write!(f, "abandoned"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceRelease {
    Released,
    NotFound,
}

/// A held lock
#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    /// Random, unique per acquisition
    pub lock_id: String,
    pub path: StatePath,
    pub operation: LockOperation,
    /// Human-readable description of the work, for audit
    pub metadata: String,
    pub acquired_at: DateTime<Utc>,
}

impl Lock {
    pub fn new(path: StatePath, operation: LockOperation, metadata: impl Into<String>) -> Self {
        Self {
            lock_id: uuid::Uuid::new_v4().to_string(),
            path,
            operation,
            metadata: metadata.into(),
            acquired_at: Utc::now(),
        }
    }

    pub fn info(&self) -> LockInfo {
        LockInfo {
            lock_id: self.lock_id.clone(),
            operation: self.operation,
            metadata: self.metadata.clone(),
            holder: holder_name(),
            acquired_at: self.acquired_at,
        }
    }
}

/// What backends persist for a held lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_id: String,
    pub operation: LockOperation,
    pub metadata: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    /// Short description used in `AlreadyLocked` errors
    pub fn describe(&self) -> String {
        format!(
            "{} ({} since {})",
            self.holder, self.operation, self.acquired_at
        )
    }
}

fn holder_name() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

/// Mutual exclusion per state path
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Whether lock calls cross the network; such backends get an
    /// environment-level lock around batch acquisition
    fn requires_network(&self) -> bool {
        false
    }

    /// Fails with `AlreadyLocked` if another holder is active; never waits
    async fn acquire(
        &self,
        path: &StatePath,
        operation: LockOperation,
        metadata: &str,
    ) -> Result<Lock, LockError>;

    /// Idempotent: releasing a lock that is already gone is not an error
    async fn release(&self, lock: &Lock, reason: ReleaseReason) -> Result<(), LockError>;

    async fn force_release(&self, path: &StatePath) -> Result<ForceRelease, LockError>;
}

/// Acquire, retrying only on `AlreadyLocked`, with exponential backoff
pub async fn acquire_with_backoff(
    provider: &dyn LockProvider,
    path: &StatePath,
    operation: LockOperation,
    metadata: &str,
    retry: &LockRetryConfig,
) -> Result<Lock, LockError> {
    let attempts = retry.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match provider.acquire(path, operation, metadata).await {
            Err(LockError::AlreadyLocked { path, holder }) if attempt + 1 < attempts => {
                let delay = retry.delay_for_attempt(attempt);
                tracing::debug!(
                    "{} is locked by {}, retrying in {}ms ({}/{})",
                    path,
                    holder,
                    delay,
                    attempt + 1,
                    attempts
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
