//! Operation classification
//!
//! Decides what a plan has to do by diffing the desired inputs against the
//! last successfully applied ones.

use crate::entity::EntityRef;
use crate::error::PlanError;
use crate::inputs::{lookup_path, set_path, values_equal};
use crate::state::PersistedState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Operation a plan performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Noop,
    Create,
    Update,
    /// Destroy and recreate
    Replace,
    Destroy,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Noop => write!(f, "no-op"),
            OperationType::Create => write!(f, "create"),
            OperationType::Update => write!(f, "update"),
            OperationType::Replace => write!(f, "replace"),
            OperationType::Destroy => write!(f, "destroy"),
        }
    }
}

/// One changed top-level field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub key: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Result of classifying a resource
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub operation: OperationType,
    pub changes: Vec<FieldChange>,
}

/// Top-level keys whose values differ (order-insensitive)
pub fn diff_top_level(existing: &Value, desired: &Value) -> Vec<FieldChange> {
    let empty = Map::new();
    let before = existing.as_object().unwrap_or(&empty);
    let after = desired.as_object().unwrap_or(&empty);

    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let old = before.get(key);
            let new = after.get(key);
            let same = match (old, new) {
                (Some(a), Some(b)) => values_equal(a, b),
                (None, None) => true,
                _ => false,
            };
            (!same).then(|| FieldChange {
                key: key.clone(),
                before: old.cloned(),
                after: new.cloned(),
            })
        })
        .collect()
}

/// Overwrite ignored field paths in `desired` with their persisted values
pub fn apply_ignored(desired: &mut Value, existing: Option<&Value>, ignore: &BTreeSet<String>) {
    let Some(existing) = existing else {
        return;
    };
    for path in ignore {
        if let Some(value) = lookup_path(existing, path) {
            set_path(desired, path, value.clone());
        }
    }
}

fn check_product(
    entity: &EntityRef,
    product: &str,
    existing: Option<&PersistedState>,
) -> Result<(), PlanError> {
    match existing {
        Some(state) if state.product != product => Err(PlanError::ProductMismatch {
            entity: entity.to_string(),
            declared: product.to_string(),
            existing: state.product.clone(),
        }),
        _ => Ok(()),
    }
}

/// Classify a resource plan
pub fn classify_resource(
    entity: &EntityRef,
    product: &str,
    desired: &Value,
    existing: Option<&PersistedState>,
    replacement_arguments: &BTreeSet<String>,
    ignore_arguments: &BTreeSet<String>,
) -> Result<Classification, PlanError> {
    check_product(entity, product, existing)?;

    let state = match existing {
        Some(state) if !state.is_failed_create() => state,
        _ => {
            return Ok(Classification {
                operation: OperationType::Create,
                changes: diff_top_level(&Value::Null, desired),
            });
        }
    };

    let previous = state.inputs.clone().unwrap_or(Value::Object(Map::new()));
    let mut desired = desired.clone();
    apply_ignored(&mut desired, Some(&previous), ignore_arguments);

    let changes = diff_top_level(&previous, &desired);
    let operation = if changes.is_empty() {
        OperationType::Noop
    } else if changes
        .iter()
        .any(|c| replacement_arguments.contains(&c.key))
    {
        OperationType::Replace
    } else {
        OperationType::Update
    };

    Ok(Classification { operation, changes })
}

/// Classify a service plan from the operations of its owned resources
///
/// Never yields `Replace`; replacement is resource-scoped.
pub fn classify_service(
    entity: &EntityRef,
    product: &str,
    existing: Option<&PersistedState>,
    owned_operations: &[OperationType],
) -> Result<OperationType, PlanError> {
    check_product(entity, product, existing)?;

    match existing {
        None => Ok(OperationType::Create),
        Some(state) if state.is_failed_create() => Ok(OperationType::Create),
        Some(_) => {
            let changed = owned_operations.iter().any(|op| {
                matches!(
                    op,
                    OperationType::Create | OperationType::Update | OperationType::Replace
                )
            });
            Ok(if changed {
                OperationType::Update
            } else {
                OperationType::Noop
            })
        }
    }
}
