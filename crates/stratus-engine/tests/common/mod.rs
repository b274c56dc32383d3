#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stratus_engine::{
    DeployRequest, Deployment, DestroyRequest, Engine, Entity, EntityKind, EntityRef,
    EnvironmentContext, EnvironmentRef, EnvironmentState, InputTree, MemoryBackend,
    PromoteRequest, ProvisionOutcome, ProvisionRequest, Provisioner, Provisioners,
    ServiceDeployer,
};

pub const RESOURCE_PRODUCT: &str = "test_bucket";
pub const SERVICE_PRODUCT: &str = "test_app";

pub fn env() -> EnvironmentRef {
    EnvironmentRef::new("shop", "dev")
}

/// Declared input: a literal value or another entity's output
#[derive(Clone)]
pub enum Field {
    Value(Value),
    Output {
        kind: EntityKind,
        name: String,
        product: Option<String>,
        field: String,
    },
}

/// Configurable resource or service declaration
#[derive(Clone)]
pub struct TestEntity {
    pub name: String,
    pub kind: EntityKind,
    pub product: String,
    pub provider: Option<String>,
    pub fields: Vec<(String, Field)>,
    pub replacement: BTreeSet<String>,
    pub ignored: BTreeSet<String>,
    pub after: Vec<EntityRef>,
    pub owned: Vec<Arc<dyn Entity>>,
}

impl TestEntity {
    pub fn resource(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EntityKind::Resource,
            product: RESOURCE_PRODUCT.to_string(),
            provider: None,
            fields: Vec::new(),
            replacement: BTreeSet::new(),
            ignored: BTreeSet::new(),
            after: Vec::new(),
            owned: Vec::new(),
        }
    }

    pub fn service(name: &str) -> Self {
        Self {
            kind: EntityKind::Service,
            product: SERVICE_PRODUCT.to_string(),
            ..Self::resource(name)
        }
    }

    pub fn product(mut self, product: &str) -> Self {
        self.product = product.to_string();
        self
    }

    pub fn provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    pub fn set(mut self, key: &str, value: Value) -> Self {
        self.fields.push((key.to_string(), Field::Value(value)));
        self
    }

    /// Input wired to a resource output
    pub fn from_resource(mut self, key: &str, resource: &str, field: &str) -> Self {
        self.fields.push((
            key.to_string(),
            Field::Output {
                kind: EntityKind::Resource,
                name: resource.to_string(),
                product: Some(RESOURCE_PRODUCT.to_string()),
                field: field.to_string(),
            },
        ));
        self
    }

    pub fn replace_on(mut self, key: &str) -> Self {
        self.replacement.insert(key.to_string());
        self
    }

    pub fn ignore(mut self, key: &str) -> Self {
        self.ignored.insert(key.to_string());
        self
    }

    /// Explicit dependency on a resource
    pub fn after(mut self, resource: &str) -> Self {
        self.after.push(env().resource(resource));
        self
    }

    pub fn owns(mut self, resource: TestEntity) -> Self {
        self.owned.push(resource.build());
        self
    }

    pub fn build(self) -> Arc<dyn Entity> {
        Arc::new(self)
    }
}

impl Entity for TestEntity {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn product(&self) -> &str {
        &self.product
    }

    fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    fn desired_inputs(&self, ctx: &EnvironmentContext) -> InputTree {
        InputTree::map(self.fields.iter().map(|(key, field)| {
            let value = match field {
                Field::Value(value) => InputTree::from(value.clone()),
                Field::Output {
                    kind,
                    name,
                    product,
                    field,
                } => {
                    let mut tree = ctx.output_of(*kind, name.clone(), field.clone());
                    if let InputTree::DependsOn(reference) = &mut tree {
                        reference.product = product.clone();
                    }
                    tree
                }
            };
            (key.clone(), value)
        }))
    }

    fn replacement_arguments(&self) -> BTreeSet<String> {
        self.replacement.clone()
    }

    fn ignore_arguments(&self) -> BTreeSet<String> {
        self.ignored.clone()
    }

    fn dependencies(&self, _ctx: &EnvironmentContext) -> Vec<stratus_engine::Dependency> {
        self.after
            .iter()
            .cloned()
            .map(stratus_engine::Dependency::new)
            .collect()
    }

    fn owned_resources(&self) -> Vec<Arc<dyn Entity>> {
        self.owned.clone()
    }
}

/// What a provisioner call saw
#[derive(Debug, Clone)]
pub struct Call {
    pub entity: String,
    pub operation: String,
    pub inputs: Value,
}

/// Resource provisioner that records calls and can be told to fail
#[derive(Default)]
pub struct RecordingProvisioner {
    calls: Mutex<Vec<Call>>,
    destroyed: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
    panicking: Mutex<BTreeSet<String>>,
    delay: Mutex<Option<Duration>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn panic_on(&self, name: &str) {
        self.panicking.lock().unwrap().insert(name.to_string());
    }

    pub fn with_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.entity == name).count()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }

    /// Most calls seen in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn execute(&self, request: ProvisionRequest<'_>) -> anyhow::Result<ProvisionOutcome> {
        let name = request.entity.name.clone();
        self.calls.lock().unwrap().push(Call {
            entity: name.clone(),
            operation: request.operation.to_string(),
            inputs: request.inputs.clone(),
        });

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.panicking.lock().unwrap().contains(&name) {
            panic!("boom in {}", name);
        }
        if self.failing.lock().unwrap().contains(&name) {
            anyhow::bail!("quota exceeded for {}", name);
        }

        Ok(ProvisionOutcome::new(request.inputs.clone()).with_provider_id(format!("id-{}", name)))
    }

    async fn destroy(&self, request: DestroyRequest<'_>) -> anyhow::Result<()> {
        let name = request.entity.name.clone();
        if self.failing.lock().unwrap().contains(&name) {
            anyhow::bail!("cannot delete {}", name);
        }
        self.destroyed.lock().unwrap().push(name);
        Ok(())
    }
}

/// Service deployer that records each phase
#[derive(Default)]
pub struct RecordingDeployer {
    phases: Mutex<Vec<String>>,
    fail_promote: Mutex<BTreeSet<String>>,
}

impl RecordingDeployer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_promote_on(&self, name: &str) {
        self.fail_promote.lock().unwrap().insert(name.to_string());
    }

    pub fn phases(&self) -> Vec<String> {
        self.phases.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceDeployer for RecordingDeployer {
    async fn deploy(&self, request: DeployRequest<'_>) -> anyhow::Result<Deployment> {
        self.phases
            .lock()
            .unwrap()
            .push(format!("deploy {}", request.entity.name));
        Ok(Deployment {
            deployment_id: format!("{}-v1", request.entity.name),
            log_file: None,
        })
    }

    async fn promote(&self, request: PromoteRequest<'_>) -> anyhow::Result<String> {
        let name = request.entity.name.clone();
        self.phases.lock().unwrap().push(format!("promote {}", name));
        if self.fail_promote.lock().unwrap().contains(&name) {
            anyhow::bail!("health check failed for {}", request.deployment_id);
        }
        Ok(format!("https://{}.run.example", name))
    }

    async fn destroy(&self, request: DestroyRequest<'_>) -> anyhow::Result<()> {
        self.phases
            .lock()
            .unwrap()
            .push(format!("destroy {}", request.entity.name));
        Ok(())
    }
}

pub struct TestEngine {
    pub engine: Engine,
    pub backend: Arc<MemoryBackend>,
    pub provisioner: Arc<RecordingProvisioner>,
    pub deployer: Arc<RecordingDeployer>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    pub fn networked() -> Self {
        Self::with_backend(MemoryBackend::networked())
    }

    fn with_backend(backend: MemoryBackend) -> Self {
        let backend = Arc::new(backend);
        backend.seed_environment(&env(), EnvironmentState::new(Some("gcp".to_string())));

        let provisioner = RecordingProvisioner::new();
        let deployer = RecordingDeployer::new();
        let provisioners = Provisioners::new()
            .with_resource(RESOURCE_PRODUCT, provisioner.clone())
            .with_service(SERVICE_PRODUCT, deployer.clone());

        Self {
            engine: Engine::with_backend(backend.clone(), provisioners),
            backend,
            provisioner,
            deployer,
        }
    }

    pub async fn context(&self) -> EnvironmentContext {
        self.engine.context(&env()).await.unwrap()
    }
}
