//! Plan graph builder
//!
//! Turns declared entities into plans. Work happens in three passes:
//! declarations are expanded (services bring their owned resources along),
//! every referenced entity's state is loaded concurrently, and then a
//! depth-first walk classifies each entity after its dependencies.
//!
//! Planning failures are scoped to the entity that caused them. Anything
//! depending on a failed entity fails too, citing the chain.

use crate::classify::{classify_resource, classify_service};
use crate::context::EnvironmentContext;
use crate::entity::{Dependency, Entity, EntityKind, EntityRef, validate_name};
use crate::error::{PlanError, StateError};
use crate::inputs::{InputMode, InputTree, OutputMap};
use crate::plan::{Plan, PlanGraph, PlanKind, ResourcePlan, ServicePlan};
use crate::provision::Provisioners;
use crate::result::FailedToPlan;
use crate::state::{PersistedState, StateStore};
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

struct Declared {
    entity: Arc<dyn Entity>,
    entity_ref: EntityRef,
    inputs: InputTree,
    dependencies: Vec<Dependency>,
    owned: Vec<EntityRef>,
}

#[derive(Clone)]
enum Node {
    Planned(Arc<Plan>),
    Failed(String),
}

pub struct PlanBuilder<'a> {
    ctx: &'a EnvironmentContext,
    provisioners: &'a Provisioners,
    store: &'a dyn StateStore,
}

impl<'a> PlanBuilder<'a> {
    pub fn new(
        ctx: &'a EnvironmentContext,
        provisioners: &'a Provisioners,
        store: &'a dyn StateStore,
    ) -> Self {
        Self {
            ctx,
            provisioners,
            store,
        }
    }

    /// Plan every entity; only StateStore failures abort the batch
    pub async fn build(&self, entities: &[Arc<dyn Entity>]) -> Result<PlanGraph, StateError> {
        let mut declarations = Declarations::default();
        for entity in entities {
            declarations.declare(self.ctx, entity);
        }

        let states = self.load_states(&declarations).await?;

        let mut walk = Walk {
            ctx: self.ctx,
            provisioners: self.provisioners,
            declarations: &declarations,
            states: &states,
            memo: HashMap::new(),
            stack: Vec::new(),
            cycles: HashMap::new(),
            graph: PlanGraph::new(self.ctx.env().clone()),
        };
        for declared in &declarations.items {
            walk.visit(&declared.entity_ref);
        }

        let graph = walk.graph;
        tracing::info!(
            "Planned {}: {} ({} failed to plan)",
            self.ctx.env(),
            graph.summary(),
            graph.failed_to_plan.len()
        );
        Ok(graph)
    }

    async fn load_states(
        &self,
        declarations: &Declarations,
    ) -> Result<HashMap<EntityRef, Option<PersistedState>>, StateError> {
        let mut targets: BTreeSet<&EntityRef> = BTreeSet::new();
        for declared in &declarations.items {
            targets.insert(&declared.entity_ref);
            targets.extend(declared.dependencies.iter().map(|d| &d.entity));
        }

        let loads = targets.into_iter().map(|entity_ref| async move {
            let state = self.store.load(entity_ref).await;
            (entity_ref.clone(), state)
        });

        let mut states = HashMap::new();
        for (entity_ref, state) in join_all(loads).await {
            states.insert(entity_ref, state?);
        }
        tracing::debug!("Loaded state for {} entities", states.len());
        Ok(states)
    }
}

#[derive(Default)]
struct Declarations {
    items: Vec<Declared>,
    index: HashMap<EntityRef, usize>,
    duplicates: BTreeSet<EntityRef>,
}

impl Declarations {
    /// Owned resources are declared before the service that owns them
    fn declare(&mut self, ctx: &EnvironmentContext, entity: &Arc<dyn Entity>) -> EntityRef {
        let entity_ref = ctx.entity_ref(entity.as_ref());

        let mut owned = Vec::new();
        let mut dependencies: BTreeSet<Dependency> = BTreeSet::new();
        if entity.kind() == EntityKind::Service {
            for resource in entity.owned_resources() {
                let owned_ref = self.declare(ctx, &resource);
                dependencies.insert(Dependency::on(resource.as_ref(), ctx));
                owned.push(owned_ref);
            }
        }

        let inputs = entity.desired_inputs(ctx);

        // The same declaration reached twice (e.g. listed and owned) is fine
        if let Some(&i) = self.index.get(&entity_ref) {
            let first = &self.items[i];
            let same = Arc::ptr_eq(&first.entity, entity)
                || (first.entity.product() == entity.product() && first.inputs == inputs);
            if !same {
                self.duplicates.insert(entity_ref.clone());
            }
            return entity_ref;
        }

        dependencies.extend(inputs.dependencies());
        dependencies.extend(entity.dependencies(ctx));

        self.index.insert(entity_ref.clone(), self.items.len());
        self.items.push(Declared {
            entity: entity.clone(),
            entity_ref: entity_ref.clone(),
            inputs,
            dependencies: dependencies.into_iter().collect(),
            owned,
        });
        entity_ref
    }
}

struct Walk<'w> {
    ctx: &'w EnvironmentContext,
    provisioners: &'w Provisioners,
    declarations: &'w Declarations,
    states: &'w HashMap<EntityRef, Option<PersistedState>>,
    memo: HashMap<EntityRef, Node>,
    stack: Vec<EntityRef>,
    /// Entities found on a cycle, with the cycle they are on
    cycles: HashMap<EntityRef, String>,
    graph: PlanGraph,
}

impl Walk<'_> {
    fn visit(&mut self, entity_ref: &EntityRef) -> Node {
        if let Some(node) = self.memo.get(entity_ref) {
            return node.clone();
        }

        if let Some(pos) = self.stack.iter().position(|e| e == entity_ref) {
            let mut path: Vec<String> = self.stack[pos..].iter().map(|e| e.to_string()).collect();
            path.push(entity_ref.to_string());
            let cycle = path.join(" -> ");
            for member in &self.stack[pos..] {
                self.cycles.insert(member.clone(), cycle.clone());
            }
            return Node::Failed(PlanError::CyclicDependency { cycle }.to_string());
        }

        self.stack.push(entity_ref.clone());
        let node = match self.plan(entity_ref) {
            Ok(plan) => {
                tracing::debug!("Planned {} as {}", entity_ref, plan.operation());
                let plan = Arc::new(plan);
                self.graph.plans.push(plan.clone());
                Node::Planned(plan)
            }
            Err(e) => {
                tracing::debug!("{} failed to plan: {}", entity_ref, e);
                self.graph.failed_to_plan.push(FailedToPlan {
                    entity: entity_ref.clone(),
                    message: e.to_string(),
                });
                Node::Failed(e.to_string())
            }
        };
        self.stack.pop();

        self.memo.insert(entity_ref.clone(), node.clone());
        node
    }

    fn plan(&mut self, entity_ref: &EntityRef) -> Result<Plan, PlanError> {
        let declarations = self.declarations;
        let Some(&i) = declarations.index.get(entity_ref) else {
            return Err(PlanError::UnsatisfiableDependency {
                entity: entity_ref.to_string(),
                dependency: entity_ref.to_string(),
                reason: "is not declared".to_string(),
            });
        };
        let declared = &declarations.items[i];
        let entity = declared.entity.as_ref();
        let product = entity.product();

        if declarations.duplicates.contains(entity_ref) {
            return Err(PlanError::DuplicateEntity {
                entity: entity_ref.to_string(),
            });
        }

        validate_name(entity.name())?;

        if let (Some(declared_provider), Some(environment)) =
            (entity.provider(), self.ctx.provider())
        {
            if declared_provider != environment {
                return Err(PlanError::ProviderMismatch {
                    entity: entity_ref.to_string(),
                    declared: declared_provider.to_string(),
                    environment: environment.to_string(),
                });
            }
        }

        let existing = self.states.get(entity_ref).cloned().flatten();
        if let Some(state) = &existing {
            if state.status.is_pending() {
                return Err(PlanError::PendingOperation {
                    entity: entity_ref.to_string(),
                    status: state.status,
                });
            }
        }

        if !self.provisioners.supports(entity_ref.kind, product) {
            return Err(PlanError::NoProvisioner {
                kind: entity_ref.kind.to_string(),
                product: product.to_string(),
            });
        }

        let mut depends_on = Vec::new();
        let mut known_outputs = OutputMap::new();
        let mut owned_operations = Vec::new();
        for dependency in &declared.dependencies {
            if !declarations.index.contains_key(&dependency.entity) {
                let outputs = self.external(entity_ref, dependency)?;
                known_outputs.insert(dependency.entity.clone(), outputs);
                continue;
            }

            match self.visit(&dependency.entity) {
                Node::Planned(plan) => {
                    if let Some(expected) = &dependency.product {
                        if expected != plan.product() {
                            return Err(PlanError::UnsatisfiableDependency {
                                entity: entity_ref.to_string(),
                                dependency: dependency.entity.to_string(),
                                reason: format!(
                                    "is declared as '{}' instead of '{}'",
                                    plan.product(),
                                    expected
                                ),
                            });
                        }
                    }
                    if declared.owned.contains(&dependency.entity) {
                        owned_operations.push(plan.operation());
                    }
                    if plan.is_noop() {
                        if let Some(state) = plan.existing() {
                            known_outputs.insert(dependency.entity.clone(), state.outputs());
                        }
                    } else {
                        depends_on.push(dependency.entity.clone());
                    }
                }
                Node::Failed(message) => {
                    return Err(match self.cycles.get(entity_ref) {
                        Some(cycle) => PlanError::CyclicDependency {
                            cycle: cycle.clone(),
                        },
                        None => PlanError::DependencyFailedToPlan {
                            entity: entity_ref.to_string(),
                            dependency: dependency.entity.to_string(),
                            message,
                        },
                    });
                }
            }
        }

        let planned_inputs = declared
            .inputs
            .render(&InputMode::Planning(&known_outputs))?;

        let (operation, kind) = match entity_ref.kind {
            EntityKind::Resource => {
                let provisioner = self.provisioners.resource(product).ok_or_else(|| {
                    PlanError::NoProvisioner {
                        kind: entity_ref.kind.to_string(),
                        product: product.to_string(),
                    }
                })?;
                let replacement_arguments = entity.replacement_arguments();
                let ignore_arguments = entity.ignore_arguments();
                let classification = classify_resource(
                    entity_ref,
                    product,
                    &planned_inputs,
                    existing.as_ref(),
                    &replacement_arguments,
                    &ignore_arguments,
                )?;
                (
                    classification.operation,
                    PlanKind::Resource(ResourcePlan {
                        inputs: declared.inputs.clone(),
                        planned_inputs,
                        changes: classification.changes,
                        replacement_arguments,
                        ignore_arguments,
                        provisioner,
                    }),
                )
            }
            EntityKind::Service => {
                let deployer = self.provisioners.service(product).ok_or_else(|| {
                    PlanError::NoProvisioner {
                        kind: entity_ref.kind.to_string(),
                        product: product.to_string(),
                    }
                })?;
                let operation =
                    classify_service(entity_ref, product, existing.as_ref(), &owned_operations)?;
                (
                    operation,
                    PlanKind::Service(ServicePlan {
                        inputs: declared.inputs.clone(),
                        planned_inputs,
                        owned: declared.owned.clone(),
                        deployer,
                    }),
                )
            }
        };

        Ok(Plan::new(entity_ref.clone(), product, operation, existing, kind)
            .with_dependencies(depends_on)
            .with_known_outputs(known_outputs))
    }

    /// Outputs of a dependency that is not part of this run
    fn external(&self, dependent: &EntityRef, dependency: &Dependency) -> Result<Value, PlanError> {
        let unsatisfiable = |reason: String| PlanError::UnsatisfiableDependency {
            entity: dependent.to_string(),
            dependency: dependency.entity.to_string(),
            reason,
        };

        let Some(state) = self.states.get(&dependency.entity).and_then(Option::as_ref) else {
            return Err(unsatisfiable("does not exist".to_string()));
        };
        if let Some(expected) = &dependency.product {
            if expected != &state.product {
                return Err(unsatisfiable(format!(
                    "exists as '{}' instead of '{}'",
                    state.product, expected
                )));
            }
        }
        if state.inputs.is_none() {
            return Err(unsatisfiable(format!(
                "has never been applied successfully (status {})",
                state.status
            )));
        }
        Ok(state.outputs())
    }
}
