//! Plans: one pending operation on one entity
//!
//! A plan is immutable once built. The operation is decided at planning
//! time and only revalidated, never recomputed, when the plan is locked.
//! The attached lock is the one piece of interior state.

mod destroy;
mod render;
mod resource;
mod service;

pub use render::PlanSummary;

use crate::classify::{FieldChange, OperationType};
use crate::entity::{EntityKind, EntityRef, EnvironmentRef};
use crate::inputs::{InputTree, OutputMap};
use crate::lock::Lock;
use crate::provision::{Provisioner, ServiceDeployer};
use crate::result::{AbandonReason, FailedToPlan, PlanResult};
use crate::state::{PersistedState, StateStore};
use futures_util::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

/// Create, update or replace a resource
pub struct ResourcePlan {
    pub(crate) inputs: InputTree,
    /// Inputs as rendered while planning, placeholders included
    pub(crate) planned_inputs: Value,
    pub(crate) changes: Vec<FieldChange>,
    pub(crate) replacement_arguments: BTreeSet<String>,
    pub(crate) ignore_arguments: BTreeSet<String>,
    pub(crate) provisioner: Arc<dyn Provisioner>,
}

/// Create or update a service
pub struct ServicePlan {
    pub(crate) inputs: InputTree,
    pub(crate) planned_inputs: Value,
    pub(crate) owned: Vec<EntityRef>,
    pub(crate) deployer: Arc<dyn ServiceDeployer>,
}

pub enum DestroyTarget {
    Resource(Arc<dyn Provisioner>),
    Service(Arc<dyn ServiceDeployer>),
}

/// Tear down a persisted entity and delete its record
pub struct DestroyPlan {
    pub(crate) target: DestroyTarget,
}

pub enum PlanKind {
    Resource(ResourcePlan),
    Service(ServicePlan),
    Destroy(DestroyPlan),
}

pub struct Plan {
    entity: EntityRef,
    product: String,
    operation: OperationType,
    depends_on: Vec<EntityRef>,
    existing: Option<PersistedState>,
    /// Outputs of unchanged and external dependencies, captured while planning
    known_outputs: OutputMap,
    kind: PlanKind,
    lock: Mutex<Option<Lock>>,
}

impl Plan {
    pub(crate) fn new(
        entity: EntityRef,
        product: impl Into<String>,
        operation: OperationType,
        existing: Option<PersistedState>,
        kind: PlanKind,
    ) -> Self {
        Self {
            entity,
            product: product.into(),
            operation,
            depends_on: Vec::new(),
            existing,
            known_outputs: OutputMap::new(),
            kind,
            lock: Mutex::new(None),
        }
    }

    pub(crate) fn with_dependencies(mut self, depends_on: Vec<EntityRef>) -> Self {
        self.depends_on = depends_on;
        self
    }

    pub(crate) fn with_known_outputs(mut self, known_outputs: OutputMap) -> Self {
        self.known_outputs = known_outputs;
        self
    }

    /// Stable identity, used to run each entity at most once
    pub fn id(&self) -> &EntityRef {
        &self.entity
    }

    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn operation(&self) -> OperationType {
        self.operation
    }

    pub fn is_noop(&self) -> bool {
        self.operation == OperationType::Noop
    }

    pub fn depends_on(&self) -> &[EntityRef] {
        &self.depends_on
    }

    /// State captured at planning time
    pub fn existing(&self) -> Option<&PersistedState> {
        self.existing.as_ref()
    }

    pub fn kind(&self) -> &PlanKind {
        &self.kind
    }

    /// Field-level changes (resources only)
    pub fn changes(&self) -> &[FieldChange] {
        match &self.kind {
            PlanKind::Resource(plan) => &plan.changes,
            _ => &[],
        }
    }

    /// Desired inputs as known at planning time
    pub fn planned_inputs(&self) -> Option<&Value> {
        match &self.kind {
            PlanKind::Resource(plan) => Some(&plan.planned_inputs),
            PlanKind::Service(plan) => Some(&plan.planned_inputs),
            PlanKind::Destroy(_) => None,
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Option<Lock>> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn attach_lock(&self, lock: Lock) {
        *self.lock_slot() = Some(lock);
    }

    pub fn take_lock(&self) -> Option<Lock> {
        self.lock_slot().take()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_slot().is_some()
    }

    fn lock_id(&self) -> Option<String> {
        self.lock_slot().as_ref().map(|l| l.lock_id.clone())
    }

    pub fn abandon(&self, reason: AbandonReason) -> PlanResult {
        tracing::info!("Abandoning {}: {}", self.entity, reason);
        PlanResult::abandoned(self.entity.clone(), self.operation, reason)
    }

    /// Run the plan
    ///
    /// Never fails: provider errors and panics become a failed result after
    /// the entity's record has been moved to the matching failed status.
    pub async fn execute(&self, store: &dyn StateStore, dependencies: &[PlanResult]) -> PlanResult {
        if self.is_noop() {
            let outputs = self.existing.as_ref().map(PersistedState::outputs);
            return PlanResult::unchanged(self.entity.clone(), outputs);
        }

        let Some(lock_id) = self.lock_id() else {
            return PlanResult::failed(
                self.entity.clone(),
                self.operation,
                format!("{} was not locked before execution", self.entity),
            );
        };

        let mut outputs = self.known_outputs.clone();
        for result in dependencies {
            if let Some(values) = &result.outputs {
                outputs.insert(result.entity.clone(), values.clone());
            }
        }

        match &self.kind {
            PlanKind::Resource(plan) => resource::execute(self, plan, store, &outputs, &lock_id).await,
            PlanKind::Service(plan) => service::execute(self, plan, store, &outputs, &lock_id).await,
            PlanKind::Destroy(plan) => destroy::execute(self, plan, store, &lock_id).await,
        }
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("entity", &self.entity)
            .field("product", &self.product)
            .field("operation", &self.operation)
            .field("depends_on", &self.depends_on)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Plans for one environment, plus the entities that could not be planned
#[derive(Debug, Clone)]
pub struct PlanGraph {
    pub env: EnvironmentRef,
    pub plans: Vec<Arc<Plan>>,
    pub failed_to_plan: Vec<FailedToPlan>,
}

impl PlanGraph {
    pub fn new(env: EnvironmentRef) -> Self {
        Self {
            env,
            plans: Vec::new(),
            failed_to_plan: Vec::new(),
        }
    }

    pub fn get(&self, entity: &EntityRef) -> Option<&Arc<Plan>> {
        self.plans.iter().find(|p| p.entity() == entity)
    }

    pub fn has_changes(&self) -> bool {
        self.plans.iter().any(|p| !p.is_noop())
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary::from_plans(&self.plans)
    }

    /// Keep only the plans the caller approved; planning failures are kept
    pub fn select(&self, keep: impl Fn(&Plan) -> bool) -> PlanGraph {
        PlanGraph {
            env: self.env.clone(),
            plans: self.plans.iter().filter(|p| keep(p)).cloned().collect(),
            failed_to_plan: self.failed_to_plan.clone(),
        }
    }

    /// Human-readable rendition of every plan with changes
    pub fn render(&self) -> String {
        let mut out = String::new();
        for plan in self.plans.iter().filter(|p| !p.is_noop()) {
            out.push_str(&plan.render());
            out.push('\n');
        }
        for failure in &self.failed_to_plan {
            out.push_str(&format!(
                "! {} failed to plan: {}\n",
                failure.entity, failure.message
            ));
        }
        out.push_str(&self.summary().to_string());
        out
    }
}

/// Run a provider call, turning errors and panics into a message
pub(crate) async fn guarded<T, F>(call: F) -> Result<T, String>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => Err(format!("provisioner panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Persist a record, turning a store error into a result message
pub(crate) async fn save_state(
    store: &dyn StateStore,
    entity: &EntityRef,
    state: &PersistedState,
    lock_id: &str,
) -> Result<(), String> {
    tracing::debug!("{} -> {}", entity, state.status);
    store
        .save(entity, state, lock_id)
        .await
        .map_err(|e| format!("failed to record {} for {}: {}", state.status, entity, e))
}

/// Start from the planned record, or a fresh one for a first create
pub(crate) fn starting_state(plan: &Plan, kind: EntityKind) -> PersistedState {
    plan.existing().cloned().unwrap_or_else(|| {
        PersistedState::new(kind, plan.product(), crate::state::Status::Creating)
    })
}
