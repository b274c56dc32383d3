//! `Provisioner` backed by OpenTofu modules
//!
//! Each product tag maps to a module directory under `modules_dir`. Resource
//! inputs are passed as variables and module outputs are merged back into
//! the persisted inputs, so dependents can reference them.

use crate::error::{Result, TofuError};
use crate::tofu::Tofu;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use stratus_config::ProvisionerConfig;
use stratus_engine::{
    DestroyRequest, EntityRef, OperationType, ProvisionOutcome, ProvisionRequest, Provisioner,
};

pub struct TofuProvisioner {
    binary: String,
    modules_dir: PathBuf,
    work_dir: PathBuf,
    timeout: Duration,
}

impl TofuProvisioner {
    pub fn new(config: &ProvisionerConfig) -> Result<Self> {
        Ok(Self {
            binary: config.binary.clone(),
            modules_dir: std::path::absolute(&config.modules_dir)?,
            work_dir: std::path::absolute(&config.work_dir)?,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Working directory for one entity
    pub fn entity_dir(&self, entity: &EntityRef) -> PathBuf {
        self.work_dir
            .join(&entity.project)
            .join(&entity.environment)
            .join(&entity.name)
    }

    fn tofu(&self, entity: &EntityRef, product: &str) -> Result<Tofu> {
        let module_dir = self.modules_dir.join(product);
        if !module_dir.is_dir() {
            return Err(TofuError::ModuleNotFound {
                product: product.to_string(),
                path: module_dir,
            });
        }
        Ok(Tofu::new(
            &self.binary,
            module_dir,
            self.entity_dir(entity),
            self.timeout,
        ))
    }

    async fn teardown(&self, tofu: &Tofu, inputs: &Value) -> Result<()> {
        tofu.prepare(inputs).await?;
        tofu.init().await?;
        tofu.destroy().await
    }
}

fn empty_inputs() -> Value {
    Value::Object(Map::new())
}

#[async_trait]
impl Provisioner for TofuProvisioner {
    async fn execute(&self, request: ProvisionRequest<'_>) -> anyhow::Result<ProvisionOutcome> {
        let tofu = self.tofu(request.entity, request.product)?;

        if request.operation == OperationType::Replace {
            let previous = request
                .existing
                .and_then(|s| s.inputs.clone())
                .unwrap_or_else(empty_inputs);
            tracing::info!("Replacing {}: destroying the current instance", request.entity);
            self.teardown(&tofu, &previous).await?;
        }

        tofu.prepare(request.inputs).await?;
        tofu.init().await?;
        tofu.apply().await?;
        let outputs = tofu.output().await?;

        let (inputs, provider_id) = crate::tofu::merge_outputs(request.inputs, outputs);
        let mut outcome = ProvisionOutcome::new(inputs);
        if let Some(id) = provider_id {
            outcome = outcome.with_provider_id(id);
        }
        outcome.log_file = Some(tofu.log_file());
        Ok(outcome)
    }

    async fn destroy(&self, request: DestroyRequest<'_>) -> anyhow::Result<()> {
        let tofu = self.tofu(request.entity, request.product)?;
        let inputs = request.existing.inputs.clone().unwrap_or_else(empty_inputs);
        self.teardown(&tofu, &inputs).await?;
        Ok(())
    }
}
