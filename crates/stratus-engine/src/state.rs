//! Persisted state records and the StateStore contract
//!
//! One record per environment and one per entity. Records are overwritten on
//! every state transition, never appended.

use crate::classify::OperationType;
use crate::entity::{EntityKind, EntityRef, EnvironmentRef};
use crate::error::StateError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const STATE_VERSION: u32 = 1;

fn default_version() -> u32 {
    STATE_VERSION
}

/// Entity status state machine
///
/// `*ing` values are pending; `Ready` and `*Failed` are terminal and resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Creating,
    CreateFailed,
    Updating,
    UpdateFailed,
    Replacing,
    ReplaceFailed,
    Destroying,
    DeleteFailed,
    Deploying,
    DeployFailed,
    Promoting,
    PromoteFailed,
    Ready,
}

impl Status {
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Status::Creating
                | Status::Updating
                | Status::Replacing
                | Status::Destroying
                | Status::Deploying
                | Status::Promoting
        )
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            Status::CreateFailed
                | Status::UpdateFailed
                | Status::ReplaceFailed
                | Status::DeleteFailed
                | Status::DeployFailed
                | Status::PromoteFailed
        )
    }

    /// Status written before provider work starts
    pub fn in_progress(operation: OperationType) -> Option<Status> {
        match operation {
            OperationType::Noop => None,
            OperationType::Create => Some(Status::Creating),
            OperationType::Update => Some(Status::Updating),
            OperationType::Replace => Some(Status::Replacing),
            OperationType::Destroy => Some(Status::Destroying),
        }
    }

    /// Terminal status for a failure while in this status
    pub fn failed(self) -> Status {
        match self {
            Status::Creating => Status::CreateFailed,
            Status::Updating => Status::UpdateFailed,
            Status::Replacing => Status::ReplaceFailed,
            Status::Destroying => Status::DeleteFailed,
            Status::Deploying => Status::DeployFailed,
            Status::Promoting => Status::PromoteFailed,
            other => other,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Creating => "CREATING",
            Status::CreateFailed => "CREATE_FAILED",
            Status::Updating => "UPDATING",
            Status::UpdateFailed => "UPDATE_FAILED",
            Status::Replacing => "REPLACING",
            Status::ReplaceFailed => "REPLACE_FAILED",
            Status::Destroying => "DESTROYING",
            Status::DeleteFailed => "DELETE_FAILED",
            Status::Deploying => "DEPLOYING",
            Status::DeployFailed => "DEPLOY_FAILED",
            Status::Promoting => "PROMOTING",
            Status::PromoteFailed => "PROMOTE_FAILED",
            Status::Ready => "READY",
        };
        f.write_str(s)
    }
}

/// Durable record of one resource or service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default = "default_version")]
    pub version: u32,

    pub kind: EntityKind,

    /// Product tag the entity was created with
    pub product: String,

    pub status: Status,

    /// Last successfully applied configuration
    pub inputs: Option<Value>,

    /// Last configuration tried, kept after a failure
    pub attempted_inputs: Option<Value>,

    /// Identifier assigned by the provider
    pub provider_id: Option<String>,

    pub deployment_id: Option<String>,

    pub service_url: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl PersistedState {
    pub fn new(kind: EntityKind, product: impl Into<String>, status: Status) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            kind,
            product: product.into(),
            status,
            inputs: None,
            attempted_inputs: None,
            provider_id: None,
            deployment_id: None,
            service_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    /// Move to `status`, bumping `updated_at`
    pub fn transition(&mut self, status: Status) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Failed before ever being applied successfully
    pub fn is_failed_create(&self) -> bool {
        match self.status {
            Status::CreateFailed => true,
            Status::DeployFailed | Status::PromoteFailed => {
                self.kind == EntityKind::Service && self.inputs.is_none()
            }
            _ => false,
        }
    }

    /// Values other entities may reference: the applied inputs plus provider identifiers
    pub fn outputs(&self) -> Value {
        let mut outputs = match &self.inputs {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };
        if let Some(id) = &self.provider_id {
            outputs.insert("provider_id".to_string(), Value::String(id.clone()));
        }
        if let Some(id) = &self.deployment_id {
            outputs.insert("deployment_id".to_string(), Value::String(id.clone()));
        }
        if let Some(url) = &self.service_url {
            outputs.insert("service_url".to_string(), Value::String(url.clone()));
        }
        Value::Object(outputs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentStatus {
    Ready,
    Deleting,
    DeleteFailed,
}

/// Durable record of an environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Cloud provider every entity in the environment must target
    pub provider: Option<String>,

    pub status: EnvironmentStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl EnvironmentState {
    pub fn new(provider: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            provider,
            status: EnvironmentStatus::Ready,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn transition(&mut self, status: EnvironmentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Reject records written by a newer format
pub fn check_version(path: &str, version: u32) -> Result<(), StateError> {
    if version > STATE_VERSION {
        return Err(StateError::VersionTooNew {
            path: path.to_string(),
            found: version,
            supported: STATE_VERSION,
        });
    }
    Ok(())
}

/// Durable key-value storage for environment and entity records
///
/// Writes carry the id of the lock the caller holds. Backends that can check
/// it server-side reject stale or missing ids; file-backed stores rely on the
/// locker having serialized access already.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_environment(
        &self,
        env: &EnvironmentRef,
    ) -> Result<Option<EnvironmentState>, StateError>;

    async fn save_environment(
        &self,
        env: &EnvironmentRef,
        state: &EnvironmentState,
        lock_id: &str,
    ) -> Result<(), StateError>;

    async fn delete_environment(&self, env: &EnvironmentRef, lock_id: &str)
    -> Result<(), StateError>;

    /// `None` when the entity has never been persisted
    async fn load(&self, entity: &EntityRef) -> Result<Option<PersistedState>, StateError>;

    async fn save(
        &self,
        entity: &EntityRef,
        state: &PersistedState,
        lock_id: &str,
    ) -> Result<(), StateError>;

    async fn delete(&self, entity: &EntityRef, lock_id: &str) -> Result<(), StateError>;

    /// Every persisted entity of `kind` in the environment, by name
    async fn list(
        &self,
        env: &EnvironmentRef,
        kind: EntityKind,
    ) -> Result<BTreeMap<String, PersistedState>, StateError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_and_failed() {
        assert!(Status::Creating.is_pending());
        assert!(Status::Promoting.is_pending());
        assert!(!Status::Ready.is_pending());
        assert!(!Status::CreateFailed.is_pending());
        assert!(Status::DeleteFailed.is_failed());
        assert!(!Status::Ready.is_failed());
    }

    #[test]
    fn test_status_transitions() {
        assert_eq!(
            Status::in_progress(OperationType::Create),
            Some(Status::Creating)
        );
        assert_eq!(
            Status::in_progress(OperationType::Replace),
            Some(Status::Replacing)
        );
        assert_eq!(Status::in_progress(OperationType::Noop), None);
        assert_eq!(Status::Creating.failed(), Status::CreateFailed);
        assert_eq!(Status::Updating.failed(), Status::UpdateFailed);
        assert_eq!(Status::Replacing.failed(), Status::ReplaceFailed);
        assert_eq!(Status::Destroying.failed(), Status::DeleteFailed);
        assert_eq!(Status::Deploying.failed(), Status::DeployFailed);
        assert_eq!(Status::Promoting.failed(), Status::PromoteFailed);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&Status::CreateFailed).unwrap(),
            "\"CREATE_FAILED\""
        );
        assert_eq!(Status::CreateFailed.to_string(), "CREATE_FAILED");
    }

    #[test]
    fn test_failed_create() {
        let state = PersistedState::new(EntityKind::Resource, "bucket", Status::CreateFailed);
        assert!(state.is_failed_create());

        let mut service = PersistedState::new(EntityKind::Service, "run", Status::DeployFailed);
        assert!(service.is_failed_create());
        service.inputs = Some(json!({"image": "v1"}));
        assert!(!service.is_failed_create());

        let state = PersistedState::new(EntityKind::Resource, "bucket", Status::UpdateFailed);
        assert!(!state.is_failed_create());
    }

    #[test]
    fn test_outputs() {
        let mut state = PersistedState::new(EntityKind::Service, "run", Status::Ready)
            .with_inputs(json!({"region": "eu"}))
            .with_provider_id("svc-1");
        state.service_url = Some("https://api.example.com".to_string());

        assert_eq!(
            state.outputs(),
            json!({
                "region": "eu",
                "provider_id": "svc-1",
                "service_url": "https://api.example.com"
            })
        );
    }

    #[test]
    fn test_check_version() {
        assert!(check_version("p/e", STATE_VERSION).is_ok());
        assert!(matches!(
            check_version("p/e", STATE_VERSION + 1),
            Err(StateError::VersionTooNew { .. })
        ));
    }
}
