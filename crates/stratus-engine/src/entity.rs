//! Entity identity and the declaration contract

use crate::context::EnvironmentContext;
use crate::error::PlanError;
use crate::inputs::InputTree;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, LazyLock};

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,62}$").expect("name pattern is valid"));

const RESERVED_ENVIRONMENTS: [&str; 3] = ["stratus", "state", "locks"];

/// Resource or Service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Resource,
    Service,
}

impl EntityKind {
    /// Path segment used by state backends
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Resource => "resources",
            EntityKind::Service => "services",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Resource => write!(f, "resource"),
            EntityKind::Service => write!(f, "service"),
        }
    }
}

/// `(project, environment)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentRef {
    pub project: String,
    pub environment: String,
}

impl EnvironmentRef {
    pub fn new(project: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            environment: environment.into(),
        }
    }

    pub fn entity(&self, kind: EntityKind, name: impl Into<String>) -> EntityRef {
        EntityRef {
            project: self.project.clone(),
            environment: self.environment.clone(),
            kind,
            name: name.into(),
        }
    }

    pub fn resource(&self, name: impl Into<String>) -> EntityRef {
        self.entity(EntityKind::Resource, name)
    }

    pub fn service(&self, name: impl Into<String>) -> EntityRef {
        self.entity(EntityKind::Service, name)
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.project, self.environment)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        validate_name(&self.project)?;
        validate_environment_name(&self.environment)
    }
}

impl fmt::Display for EnvironmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.environment)
    }
}

/// `(project, environment, kind, name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub project: String,
    pub environment: String,
    pub kind: EntityKind,
    pub name: String,
}

impl EntityRef {
    pub fn environment_ref(&self) -> EnvironmentRef {
        EnvironmentRef::new(self.project.clone(), self.environment.clone())
    }

    /// Full state key, e.g. `shop/prod/resources/db`
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.project,
            self.environment,
            self.kind.collection(),
            self.name
        )
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

/// Anything that can be locked or stored
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum StatePath {
    Environment(EnvironmentRef),
    Entity(EntityRef),
}

impl StatePath {
    pub fn key(&self) -> String {
        match self {
            StatePath::Environment(env) => env.key(),
            StatePath::Entity(entity) => entity.key(),
        }
    }
}

impl From<EnvironmentRef> for StatePath {
    fn from(env: EnvironmentRef) -> Self {
        StatePath::Environment(env)
    }
}

impl From<EntityRef> for StatePath {
    fn from(entity: EntityRef) -> Self {
        StatePath::Entity(entity)
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Edge to another entity, optionally pinned to the product it must have
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Dependency {
    pub entity: EntityRef,
    pub product: Option<String>,
}

impl Dependency {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            product: None,
        }
    }

    pub fn on(entity: &dyn Entity, ctx: &EnvironmentContext) -> Self {
        Self {
            entity: ctx.entity_ref(entity),
            product: Some(entity.product().to_string()),
        }
    }
}

/// Declaration contract every managed resource or service implements
///
/// Implementations are provider-specific; the engine only relies on this
/// surface to plan, diff and order work.
pub trait Entity: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> EntityKind {
        EntityKind::Resource
    }

    /// Provider-specific type tag (e.g. `gcp_sql_postgres`)
    fn product(&self) -> &str;

    /// Cloud provider this entity must be deployed to, if any
    fn provider(&self) -> Option<&str> {
        None
    }

    /// Desired configuration; `DependsOn` markers express implicit dependencies
    fn desired_inputs(&self, ctx: &EnvironmentContext) -> InputTree;

    /// Top-level fields whose change forces destroy-and-recreate
    fn replacement_arguments(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Field paths only known after creation; never diffed
    fn ignore_arguments(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    /// Explicit dependencies in addition to the ones found in the inputs
    fn dependencies(&self, _ctx: &EnvironmentContext) -> Vec<Dependency> {
        Vec::new()
    }

    /// Resources owned by a service; always empty for resources
    fn owned_resources(&self) -> Vec<Arc<dyn Entity>> {
        Vec::new()
    }
}

/// Names of projects, environments and entities
pub fn validate_name(name: &str) -> Result<(), PlanError> {
    if NAME_PATTERN.is_match(name) {
        return Ok(());
    }
    let reason = if name.is_empty() {
        "name must not be empty"
    } else if name.len() > 63 {
        "name must be at most 63 characters"
    } else if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        "name must start with a lowercase letter"
    } else {
        "name may only contain lowercase letters, digits, '-' and '_'"
    };
    Err(PlanError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    })
}

pub fn validate_environment_name(name: &str) -> Result<(), PlanError> {
    validate_name(name)?;
    if RESERVED_ENVIRONMENTS.contains(&name) {
        return Err(PlanError::InvalidName {
            name: name.to_string(),
            reason: "environment name is reserved".to_string(),
        });
    }
    Ok(())
}
