//! Explicit project/environment context threaded through planning and execution

use crate::entity::{Entity, EntityKind, EntityRef, EnvironmentRef};
use crate::inputs::{InputTree, OutputRef};
use crate::state::EnvironmentState;

/// The environment a run targets, with its persisted record
#[derive(Debug, Clone)]
pub struct EnvironmentContext {
    env: EnvironmentRef,
    state: EnvironmentState,
}

impl EnvironmentContext {
    pub fn new(env: EnvironmentRef, state: EnvironmentState) -> Self {
        Self { env, state }
    }

    pub fn env(&self) -> &EnvironmentRef {
        &self.env
    }

    pub fn project(&self) -> &str {
        &self.env.project
    }

    pub fn environment(&self) -> &str {
        &self.env.environment
    }

    pub fn state(&self) -> &EnvironmentState {
        &self.state
    }

    /// Cloud provider configured for the environment
    pub fn provider(&self) -> Option<&str> {
        self.state.provider.as_deref()
    }

    pub fn resource(&self, name: impl Into<String>) -> EntityRef {
        self.env.resource(name)
    }

    pub fn service(&self, name: impl Into<String>) -> EntityRef {
        self.env.service(name)
    }

    pub fn entity_ref(&self, entity: &dyn Entity) -> EntityRef {
        self.env.entity(entity.kind(), entity.name())
    }

    /// Reference to an output field of a declared entity
    pub fn output(&self, entity: &dyn Entity, field: impl Into<String>) -> InputTree {
        InputTree::DependsOn(OutputRef {
            entity: self.entity_ref(entity),
            product: Some(entity.product().to_string()),
            field: field.into(),
        })
    }

    /// Reference to an output field of an entity that is only known by name
    pub fn output_of(
        &self,
        kind: EntityKind,
        name: impl Into<String>,
        field: impl Into<String>,
    ) -> InputTree {
        InputTree::DependsOn(OutputRef {
            entity: self.env.entity(kind, name),
            product: None,
            field: field.into(),
        })
    }
}
