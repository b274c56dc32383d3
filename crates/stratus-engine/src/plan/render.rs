use super::{Plan, PlanKind};
use crate::classify::OperationType;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

fn short(value: &Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => format!("{:?}", s),
        Some(other) => other.to_string(),
        None => "(none)".to_string(),
    }
}

impl Plan {
    /// Human-readable description, used as lock metadata
    ///
    /// ```text
    /// update resource 'db' (postgres)
    ///   ~ size: 1 -> 2
    ///   + tier: "gold"
    /// ```
    pub fn render(&self) -> String {
        let mut out = format!("{} {} ({})", self.operation(), self.entity(), self.product());

        match self.kind() {
            PlanKind::Resource(plan) => {
                for change in &plan.changes {
                    let forces = if self.operation() == OperationType::Replace
                        && plan.replacement_arguments.contains(&change.key)
                    {
                        " (forces replacement)"
                    } else {
                        ""
                    };
                    let line = match (&change.before, &change.after) {
                        (None, after) => format!("  + {}: {}", change.key, short(after)),
                        (before, None) => format!("  - {}: {}", change.key, short(before)),
                        (before, after) => format!(
                            "  ~ {}: {} -> {}{}",
                            change.key,
                            short(before),
                            short(after),
                            forces
                        ),
                    };
                    out.push('\n');
                    out.push_str(&line);
                }
            }
            PlanKind::Service(plan) => {
                for owned in &plan.owned {
                    out.push_str(&format!("\n  owns {}", owned));
                }
            }
            PlanKind::Destroy(_) => {}
        }

        for dependency in self.depends_on() {
            out.push_str(&format!("\n  after {}", dependency));
        }
        out
    }
}

/// Plan counts per operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub destroy: usize,
    pub unchanged: usize,
}

impl PlanSummary {
    pub fn from_plans(plans: &[Arc<Plan>]) -> Self {
        let mut summary = PlanSummary::default();
        for plan in plans {
            match plan.operation() {
                OperationType::Create => summary.create += 1,
                OperationType::Update => summary.update += 1,
                OperationType::Replace => summary.replace += 1,
                OperationType::Destroy => summary.destroy += 1,
                OperationType::Noop => summary.unchanged += 1,
            }
        }
        summary
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace",
            self.create, self.update, self.replace
        )?;
        if self.destroy > 0 {
            write!(f, ", {} to destroy", self.destroy)?;
        }
        write!(f, ", {} unchanged", self.unchanged)
    }
}
