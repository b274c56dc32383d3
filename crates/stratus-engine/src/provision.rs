//! Provisioner contracts
//!
//! Provisioners do the actual provider work. The engine treats them as
//! opaque, possibly slow and possibly failing: any error or panic becomes a
//! failed result at the plan boundary, and nothing is retried.

use crate::classify::OperationType;
use crate::entity::{EntityKind, EntityRef};
use crate::state::PersistedState;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Create, update or replace a resource
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest<'a> {
    pub entity: &'a EntityRef,
    pub product: &'a str,
    pub operation: OperationType,
    /// Fully resolved desired inputs
    pub inputs: &'a Value,
    pub existing: Option<&'a PersistedState>,
    pub lock_id: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionOutcome {
    pub provider_id: Option<String>,
    /// Final inputs, including values only known after apply
    pub inputs: Value,
    pub log_file: Option<PathBuf>,
}

impl ProvisionOutcome {
    pub fn new(inputs: Value) -> Self {
        Self {
            provider_id: None,
            inputs,
            log_file: None,
        }
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DestroyRequest<'a> {
    pub entity: &'a EntityRef,
    pub product: &'a str,
    pub existing: &'a PersistedState,
    pub lock_id: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct DeployRequest<'a> {
    pub entity: &'a EntityRef,
    pub product: &'a str,
    pub operation: OperationType,
    pub inputs: &'a Value,
    pub existing: Option<&'a PersistedState>,
    pub lock_id: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct PromoteRequest<'a> {
    pub entity: &'a EntityRef,
    pub product: &'a str,
    pub deployment_id: &'a str,
    pub inputs: &'a Value,
    pub lock_id: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub deployment_id: String,
    pub log_file: Option<PathBuf>,
}

/// Resource provisioning back-end
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn execute(&self, request: ProvisionRequest<'_>) -> anyhow::Result<ProvisionOutcome>;

    async fn destroy(&self, request: DestroyRequest<'_>) -> anyhow::Result<()>;
}

/// Service deployment back-end
#[async_trait]
pub trait ServiceDeployer: Send + Sync {
    async fn deploy(&self, request: DeployRequest<'_>) -> anyhow::Result<Deployment>;

    /// Route traffic to the deployment; returns the service URL
    async fn promote(&self, request: PromoteRequest<'_>) -> anyhow::Result<String>;

    async fn destroy(&self, request: DestroyRequest<'_>) -> anyhow::Result<()>;
}

/// Provisioners by product tag
#[derive(Clone, Default)]
pub struct Provisioners {
    resources: HashMap<String, Arc<dyn Provisioner>>,
    services: HashMap<String, Arc<dyn ServiceDeployer>>,
    /// Used for resource products without a dedicated provisioner
    fallback: Option<Arc<dyn Provisioner>>,
}

impl Provisioners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resource(
        mut self,
        product: impl Into<String>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        self.resources.insert(product.into(), provisioner);
        self
    }

    pub fn with_service(
        mut self,
        product: impl Into<String>,
        deployer: Arc<dyn ServiceDeployer>,
    ) -> Self {
        self.services.insert(product.into(), deployer);
        self
    }

    pub fn with_fallback(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.fallback = Some(provisioner);
        self
    }

    pub fn resource(&self, product: &str) -> Option<Arc<dyn Provisioner>> {
        self.resources
            .get(product)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn service(&self, product: &str) -> Option<Arc<dyn ServiceDeployer>> {
        self.services.get(product).cloned()
    }

    pub fn supports(&self, kind: EntityKind, product: &str) -> bool {
        match kind {
            EntityKind::Resource => self.resource(product).is_some(),
            EntityKind::Service => self.service(product).is_some(),
        }
    }
}

impl std::fmt::Debug for Provisioners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut resources: Vec<&String> = self.resources.keys().collect();
        resources.sort();
        let mut services: Vec<&String> = self.services.keys().collect();
        services.sort();
        f.debug_struct("Provisioners")
            .field("resources", &resources)
            .field("services", &services)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
