//! Engine facade
//!
//! Ties the StateStore, LockProvider and provisioners together:
//! plan -> review -> apply, plus environment lifecycle and destroy.

use crate::backend::{LocalBackend, RemoteBackend};
use crate::builder::PlanBuilder;
use crate::classify::OperationType;
use crate::context::EnvironmentContext;
use crate::entity::{Entity, EntityKind, EntityRef, EnvironmentRef, StatePath};
use crate::error::{EngineError, PlanError, Result};
use crate::executor::Executor;
use crate::lock::{ForceRelease, Lock, LockOperation, LockProvider, ReleaseReason};
use crate::locker::Locker;
use crate::plan::{DestroyPlan, DestroyTarget, Plan, PlanGraph, PlanKind};
use crate::provision::Provisioners;
use crate::result::{FailedToPlan, FlowResult};
use crate::state::{EnvironmentState, EnvironmentStatus, PersistedState, StateStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use stratus_config::{BackendConfig, LockRetryConfig, ProjectConfig};

pub struct Engine {
    store: Arc<dyn StateStore>,
    locks: Arc<dyn LockProvider>,
    provisioners: Provisioners,
    retry: LockRetryConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn StateStore>,
        locks: Arc<dyn LockProvider>,
        provisioners: Provisioners,
    ) -> Self {
        Self {
            store,
            locks,
            provisioners,
            retry: LockRetryConfig::default(),
        }
    }

    /// Use one backend for both state and locks
    pub fn with_backend<B>(backend: Arc<B>, provisioners: Provisioners) -> Self
    where
        B: StateStore + LockProvider + 'static,
    {
        Self::new(backend.clone(), backend, provisioners)
    }

    pub fn with_retry(mut self, retry: LockRetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Build an engine from `stratus.yaml`
    pub fn from_config(config: &ProjectConfig, provisioners: Provisioners) -> Self {
        let engine = match &config.backend {
            BackendConfig::Local { path } => {
                Self::with_backend(Arc::new(LocalBackend::new(path)), provisioners)
            }
            BackendConfig::Remote { url, token_env } => {
                let mut backend = RemoteBackend::new(url.clone());
                if let Some(var) = token_env {
                    match std::env::var(var) {
                        Ok(token) => backend = backend.with_token(token),
                        Err(_) => tracing::warn!("{} is not set, using no token", var),
                    }
                }
                Self::with_backend(Arc::new(backend), provisioners)
            }
        };
        engine.with_retry(config.lock.clone())
    }

    /// Discover and load `stratus.yaml`, then build the engine from it
    pub fn load(provisioners: Provisioners) -> Result<Self> {
        let config = stratus_config::load_project_config()?;
        tracing::debug!("Loaded configuration for project {}", config.project);
        Ok(Self::from_config(&config, provisioners))
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn locker(&self) -> Locker {
        Locker::new(self.store.clone(), self.locks.clone(), self.retry.clone())
    }

    fn executor(&self) -> Executor {
        Executor::new(self.store.clone(), self.locks.clone())
    }

    async fn release(&self, lock: &Lock, reason: ReleaseReason) {
        if let Err(e) = self.locks.release(lock, reason).await {
            tracing::warn!("Failed to release lock on {}: {}", lock.path, e);
        }
    }

    /// Create an environment; refuses to overwrite an existing one
    pub async fn create_environment(
        &self,
        env: &EnvironmentRef,
        provider: Option<String>,
    ) -> Result<EnvironmentContext> {
        env.validate()?;

        let lock = self
            .locks
            .acquire(
                &StatePath::Environment(env.clone()),
                LockOperation::CreateEnvironment,
                &format!("create environment {}", env),
            )
            .await?;

        let created = async {
            if self.store.load_environment(env).await?.is_some() {
                return Err(EngineError::EnvironmentExists(env.to_string()));
            }
            let state = EnvironmentState::new(provider);
            self.store
                .save_environment(env, &state, &lock.lock_id)
                .await?;
            Ok::<_, EngineError>(state)
        }
        .await;

        let reason = if created.is_ok() {
            ReleaseReason::Completed
        } else {
            ReleaseReason::Abandoned
        };
        self.release(&lock, reason).await;

        let state = created?;
        tracing::info!("Created environment {}", env);
        Ok(EnvironmentContext::new(env.clone(), state))
    }

    /// Load the context for an existing environment
    pub async fn context(&self, env: &EnvironmentRef) -> Result<EnvironmentContext> {
        let state = self
            .store
            .load_environment(env)
            .await?
            .ok_or_else(|| EngineError::EnvironmentNotFound(env.to_string()))?;
        Ok(EnvironmentContext::new(env.clone(), state))
    }

    /// Plan the given entities; nothing is locked or written
    pub async fn plan(
        &self,
        ctx: &EnvironmentContext,
        entities: &[Arc<dyn Entity>],
    ) -> Result<PlanGraph> {
        let builder = PlanBuilder::new(ctx, &self.provisioners, self.store.as_ref());
        Ok(builder.build(entities).await?)
    }

    /// Lock and execute a (possibly filtered) plan graph
    pub async fn apply(&self, graph: &PlanGraph) -> Result<FlowResult> {
        self.apply_until(graph, std::future::pending::<()>()).await
    }

    /// As [`Engine::apply`], stopping early when `interrupt` resolves
    pub async fn apply_until<I>(&self, graph: &PlanGraph, interrupt: I) -> Result<FlowResult>
    where
        I: Future<Output = ()> + Send,
    {
        let started = Instant::now();
        tracing::info!("Applying {}: {}", graph.env, graph.summary());

        let settled = self.locker().lock_plans(&graph.env, &graph.plans).await?;
        let results = self
            .executor()
            .run_until(&graph.plans, settled, interrupt)
            .await;

        let flow = FlowResult {
            results,
            failed_to_plan: graph.failed_to_plan.clone(),
            duration_ms: elapsed_ms(started),
        };
        tracing::info!("Applied {}: {}", graph.env, flow.summary());
        Ok(flow)
    }

    /// Destroy plans for persisted entities accepted by `filter`
    ///
    /// Services are torn down before any resource.
    pub async fn plan_destroy(
        &self,
        ctx: &EnvironmentContext,
        filter: impl Fn(&EntityRef) -> bool,
    ) -> Result<PlanGraph> {
        let env = ctx.env();
        let services = self.store.list(env, EntityKind::Service).await?;
        let resources = self.store.list(env, EntityKind::Resource).await?;

        let mut graph = PlanGraph::new(env.clone());
        let mut service_refs = Vec::new();

        for (kind, records) in [(EntityKind::Service, services), (EntityKind::Resource, resources)] {
            for (name, state) in records {
                let entity = env.entity(kind, name);
                if !filter(&entity) {
                    continue;
                }
                match self.destroy_plan(&entity, state, &service_refs) {
                    Ok(plan) => {
                        if kind == EntityKind::Service {
                            service_refs.push(entity);
                        }
                        graph.plans.push(Arc::new(plan));
                    }
                    Err(e) => graph.failed_to_plan.push(FailedToPlan {
                        entity,
                        message: e.to_string(),
                    }),
                }
            }
        }

        Ok(graph)
    }

    fn destroy_plan(
        &self,
        entity: &EntityRef,
        state: PersistedState,
        services: &[EntityRef],
    ) -> std::result::Result<Plan, PlanError> {
        if state.status.is_pending() {
            return Err(PlanError::PendingOperation {
                entity: entity.to_string(),
                status: state.status,
            });
        }

        let missing = || PlanError::NoProvisioner {
            kind: entity.kind.to_string(),
            product: state.product.clone(),
        };
        let (target, depends_on) = match entity.kind {
            EntityKind::Service => (
                DestroyTarget::Service(self.provisioners.service(&state.product).ok_or_else(missing)?),
                Vec::new(),
            ),
            EntityKind::Resource => (
                DestroyTarget::Resource(
                    self.provisioners.resource(&state.product).ok_or_else(missing)?,
                ),
                services.to_vec(),
            ),
        };

        let product = state.product.clone();
        Ok(Plan::new(
            entity.clone(),
            product,
            OperationType::Destroy,
            Some(state),
            PlanKind::Destroy(DestroyPlan { target }),
        )
        .with_dependencies(depends_on))
    }

    /// Destroy every entity in the environment, then the environment itself
    ///
    /// The environment record is only deleted when every entity was
    /// destroyed; otherwise it is left in `DeleteFailed`.
    pub async fn delete_environment(&self, env: &EnvironmentRef) -> Result<FlowResult> {
        let started = Instant::now();
        let mut ctx = self.context(env).await?;

        let lock = self
            .locks
            .acquire(
                &StatePath::Environment(env.clone()),
                LockOperation::DeleteEnvironment,
                &format!("delete environment {}", env),
            )
            .await?;

        let outcome = self.delete_locked(&mut ctx, &lock).await;
        let reason = match &outcome {
            Ok(flow) if flow.success() => ReleaseReason::Completed,
            _ => ReleaseReason::Abandoned,
        };
        self.release(&lock, reason).await;

        let mut flow = outcome?;
        flow.duration_ms = elapsed_ms(started);
        Ok(flow)
    }

    async fn delete_locked(&self, ctx: &mut EnvironmentContext, lock: &Lock) -> Result<FlowResult> {
        let env = ctx.env().clone();
        let mut state = ctx.state().clone();
        state.transition(EnvironmentStatus::Deleting);
        self.store
            .save_environment(&env, &state, &lock.lock_id)
            .await?;
        *ctx = EnvironmentContext::new(env.clone(), state.clone());

        let graph = self.plan_destroy(ctx, |_| true).await?;
        tracing::info!("Deleting {}: {}", env, graph.summary());

        // The environment lock is already held, so plans are locked directly
        let locker = self.locker();
        let settled = locker.lock_each(&graph.plans).await?;
        let results = self.executor().run(&graph.plans, settled).await;
        let flow = FlowResult {
            results,
            failed_to_plan: graph.failed_to_plan.clone(),
            duration_ms: 0,
        };

        if flow.success() {
            self.store
                .delete_environment(&env, &lock.lock_id)
                .await?;
            tracing::info!("Deleted environment {}", env);
        } else {
            state.transition(EnvironmentStatus::DeleteFailed);
            self.store
                .save_environment(&env, &state, &lock.lock_id)
                .await?;
            tracing::warn!("Deleting {} failed: {}", env, flow.summary());
        }
        Ok(flow)
    }

    /// Remove a lock regardless of who holds it
    pub async fn force_unlock(&self, path: &StatePath) -> Result<ForceRelease> {
        let released = self.locks.force_release(path).await?;
        match released {
            ForceRelease::Released => tracing::warn!("Force-unlocked {}", path),
            ForceRelease::NotFound => tracing::info!("{} was not locked", path),
        }
        Ok(released)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
