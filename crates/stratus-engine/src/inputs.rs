//! Declared inputs and their rendering
//!
//! Entities describe their desired configuration as an [`InputTree`]. Values
//! that come from another entity's outputs are `DependsOn` markers. The same
//! tree is rendered twice: once while planning, where unknown outputs become
//! placeholders, and once right before execution, where every marker must
//! resolve to a concrete value.

use crate::entity::{Dependency, EntityRef};
use crate::error::PlanError;
use serde_json::{Map, Number, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Reference to a field of another entity's outputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    pub entity: EntityRef,
    /// Product the referenced entity is expected to have
    pub product: Option<String>,
    /// Dotted path into the outputs
    pub field: String,
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.entity.kind, self.entity.name, self.field)
    }
}

/// Desired configuration with dependency markers
#[derive(Debug, Clone, PartialEq)]
pub enum InputTree {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<InputTree>),
    Map(BTreeMap<String, InputTree>),
    DependsOn(OutputRef),
}

/// Outputs per entity, as seen by the execution-mode renderer
pub type OutputMap = HashMap<EntityRef, Value>;

/// What the planning-mode renderer may know about other entities
pub trait PlanningView {
    /// Current value of an output, if the referenced entity is not changing in this run
    fn known_output(&self, reference: &OutputRef) -> Option<Value>;
}

impl PlanningView for OutputMap {
    fn known_output(&self, reference: &OutputRef) -> Option<Value> {
        self.get(&reference.entity)
            .and_then(|outputs| lookup_path(outputs, &reference.field))
            .cloned()
    }
}

/// Rendering mode, always passed explicitly
pub enum InputMode<'a> {
    Planning(&'a dyn PlanningView),
    Execution(&'a OutputMap),
}

impl InputTree {
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, InputTree)>,
    {
        InputTree::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn list<I: IntoIterator<Item = InputTree>>(items: I) -> Self {
        InputTree::List(items.into_iter().collect())
    }

    /// Every entity referenced through a `DependsOn` marker
    pub fn dependencies(&self) -> BTreeSet<Dependency> {
        let mut found = BTreeSet::new();
        self.collect_dependencies(&mut found);
        found
    }

    fn collect_dependencies(&self, found: &mut BTreeSet<Dependency>) {
        match self {
            InputTree::List(items) => items.iter().for_each(|i| i.collect_dependencies(found)),
            InputTree::Map(entries) => entries
                .values()
                .for_each(|v| v.collect_dependencies(found)),
            InputTree::DependsOn(reference) => {
                found.insert(Dependency {
                    entity: reference.entity.clone(),
                    product: reference.product.clone(),
                });
            }
            _ => {}
        }
    }

    pub fn render(&self, mode: &InputMode<'_>) -> Result<Value, PlanError> {
        Ok(match self {
            InputTree::Null => Value::Null,
            InputTree::Bool(b) => Value::Bool(*b),
            InputTree::Number(n) => Value::Number(n.clone()),
            InputTree::String(s) => Value::String(s.clone()),
            InputTree::List(items) => Value::Array(
                items
                    .iter()
                    .map(|i| i.render(mode))
                    .collect::<Result<_, _>>()?,
            ),
            InputTree::Map(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.render(mode)?);
                }
                Value::Object(map)
            }
            InputTree::DependsOn(reference) => match mode {
                InputMode::Planning(view) => view
                    .known_output(reference)
                    .unwrap_or_else(|| Value::String(placeholder(reference))),
                InputMode::Execution(outputs) => outputs
                    .get(&reference.entity)
                    .and_then(|o| lookup_path(o, &reference.field))
                    .cloned()
                    .ok_or_else(|| PlanError::UnresolvedInput {
                        reference: reference.to_string(),
                    })?,
            },
        })
    }
}

/// Planning-time stand-in for an output that only exists after apply
pub fn placeholder(reference: &OutputRef) -> String {
    format!("(known after apply: {})", reference)
}

impl From<Value> for InputTree {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => InputTree::Null,
            Value::Bool(b) => InputTree::Bool(b),
            Value::Number(n) => InputTree::Number(n),
            Value::String(s) => InputTree::String(s),
            Value::Array(items) => InputTree::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                InputTree::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for InputTree {
    fn from(s: &str) -> Self {
        InputTree::String(s.to_string())
    }
}

impl From<String> for InputTree {
    fn from(s: String) -> Self {
        InputTree::String(s)
    }
}

impl From<bool> for InputTree {
    fn from(b: bool) -> Self {
        InputTree::Bool(b)
    }
}

impl From<i64> for InputTree {
    fn from(n: i64) -> Self {
        InputTree::Number(n.into())
    }
}

impl From<u64> for InputTree {
    fn from(n: u64) -> Self {
        InputTree::Number(n.into())
    }
}

impl From<f64> for InputTree {
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(InputTree::Null, InputTree::Number)
    }
}

impl From<OutputRef> for InputTree {
    fn from(reference: OutputRef) -> Self {
        InputTree::DependsOn(reference)
    }
}

/// Look up a dotted path (`settings.tier`)
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.as_object()?.get(segment))
}

/// Set a dotted path, creating intermediate objects as needed
pub fn set_path(value: &mut Value, path: &str, new_value: Value) {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    let Value::Object(map) = value else {
        return;
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), new_value);
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_path(child, rest, new_value);
        }
    }
}

/// Structural equality where lists compare as multisets
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        (Value::Array(x), Value::Array(y)) => {
            if x.len() != y.len() {
                return false;
            }
            let mut used = vec![false; y.len()];
            x.iter().all(|item| {
                let hit = y
                    .iter()
                    .enumerate()
                    .find(|(i, other)| !used[*i] && values_equal(item, other))
                    .map(|(i, _)| i);
                match hit {
                    Some(i) => {
                        used[i] = true;
                        true
                    }
                    None => false,
                }
            })
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EnvironmentRef;
    use serde_json::json;

    struct NothingKnown;

    impl PlanningView for NothingKnown {
        fn known_output(&self, _reference: &OutputRef) -> Option<Value> {
            None
        }
    }

    struct Known(Value);

    impl PlanningView for Known {
        fn known_output(&self, _reference: &OutputRef) -> Option<Value> {
            Some(self.0.clone())
        }
    }

    fn db_ref(field: &str) -> OutputRef {
        OutputRef {
            entity: EnvironmentRef::new("shop", "dev").resource("db"),
            product: Some("postgres".to_string()),
            field: field.to_string(),
        }
    }

    fn tree() -> InputTree {
        InputTree::map([
            ("size", InputTree::from(2i64)),
            ("connection", db_ref("connection_name").into()),
            (
                "tags",
                InputTree::list(["a".into(), InputTree::from(db_ref("region"))]),
            ),
        ])
    }

    #[test]
    fn test_dependencies_collects_markers() {
        let deps = tree().dependencies();
        assert_eq!(deps.len(), 1);
        let dep = deps.iter().next().unwrap();
        assert_eq!(dep.entity.name, "db");
        assert_eq!(dep.product.as_deref(), Some("postgres"));
    }

    #[test]
    fn test_planning_mode_uses_placeholders() {
        let rendered = tree().render(&InputMode::Planning(&NothingKnown)).unwrap();
        assert_eq!(rendered["size"], json!(2));
        assert_eq!(
            rendered["connection"],
            json!("(known after apply: resource.db.connection_name)")
        );
    }

    #[test]
    fn test_planning_mode_uses_known_values() {
        let rendered = tree()
            .render(&InputMode::Planning(&Known(json!("known"))))
            .unwrap();
        assert_eq!(rendered["connection"], json!("known"));
        assert_eq!(rendered["tags"], json!(["a", "known"]));
    }

    #[test]
    fn test_execution_mode_resolves_outputs() {
        let mut outputs = OutputMap::new();
        outputs.insert(
            EnvironmentRef::new("shop", "dev").resource("db"),
            json!({"connection_name": "shop:db", "region": "eu"}),
        );

        let rendered = tree().render(&InputMode::Execution(&outputs)).unwrap();
        assert_eq!(
            rendered,
            json!({"size": 2, "connection": "shop:db", "tags": ["a", "eu"]})
        );
    }

    #[test]
    fn test_execution_mode_missing_output_is_an_error() {
        let outputs = OutputMap::new();
        let err = tree().render(&InputMode::Execution(&outputs)).unwrap_err();
        assert!(matches!(err, PlanError::UnresolvedInput { .. }));
    }

    #[test]
    fn test_paths() {
        let mut value = json!({"settings": {"tier": "small"}});
        assert_eq!(lookup_path(&value, "settings.tier"), Some(&json!("small")));
        assert_eq!(lookup_path(&value, "settings.missing"), None);

        set_path(&mut value, "settings.tier", json!("large"));
        set_path(&mut value, "labels.team", json!("infra"));
        assert_eq!(
            value,
            json!({"settings": {"tier": "large"}, "labels": {"team": "infra"}})
        );
    }

    #[test]
    fn test_values_equal_ignores_order() {
        assert!(values_equal(&json!([1, 2, 3]), &json!([3, 1, 2])));
        assert!(values_equal(
            &json!({"a": [{"x": 1}, {"y": 2}]}),
            &json!({"a": [{"y": 2}, {"x": 1}]})
        ));
        assert!(!values_equal(&json!([1, 1, 2]), &json!([1, 2, 2])));
        assert!(!values_equal(&json!({"a": 1}), &json!({"a": 1, "b": 2})));
    }
}
