//! Per-plan results and their aggregation into a run result

use crate::classify::OperationType;
use crate::entity::EntityRef;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;

/// Why a plan was never executed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AbandonReason {
    /// A dependency ran and did not succeed
    DependencyFailed { dependency: String },
    /// A dependency is not part of the plans being applied
    MissingDependency { dependency: String },
    /// The run was interrupted first
    Interrupted,
    /// The plan sits on a dependency cycle
    CyclicDependency,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::DependencyFailed { dependency } => {
                write!(f, "dependency {} failed", dependency)
            }
            AbandonReason::MissingDependency { dependency } => {
                write!(f, "dependency {} was not planned", dependency)
            }
            AbandonReason::Interrupted => write!(f, "run was interrupted"),
            AbandonReason::CyclicDependency => write!(f, "dependency cycle"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// Noop plan; nothing was locked, executed or written
    Unchanged,
    Failed { message: String },
    Abandoned { reason: AbandonReason },
}

/// Service release artifacts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Release {
    pub deployment_id: String,
    pub service_url: String,
}

/// Outcome of one plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanResult {
    pub entity: EntityRef,
    pub operation: OperationType,
    pub outcome: Outcome,
    /// Outputs dependents resolve their inputs from
    pub outputs: Option<Value>,
    pub log_files: Vec<PathBuf>,
    pub release: Option<Release>,
}

impl PlanResult {
    fn with_outcome(entity: EntityRef, operation: OperationType, outcome: Outcome) -> Self {
        Self {
            entity,
            operation,
            outcome,
            outputs: None,
            log_files: Vec::new(),
            release: None,
        }
    }

    pub fn succeeded(entity: EntityRef, operation: OperationType, outputs: Option<Value>) -> Self {
        Self {
            outputs,
            ..Self::with_outcome(entity, operation, Outcome::Succeeded)
        }
    }

    pub fn unchanged(entity: EntityRef, outputs: Option<Value>) -> Self {
        Self {
            outputs,
            ..Self::with_outcome(entity, OperationType::Noop, Outcome::Unchanged)
        }
    }

    pub fn failed(entity: EntityRef, operation: OperationType, message: impl Into<String>) -> Self {
        Self::with_outcome(
            entity,
            operation,
            Outcome::Failed {
                message: message.into(),
            },
        )
    }

    pub fn abandoned(entity: EntityRef, operation: OperationType, reason: AbandonReason) -> Self {
        Self::with_outcome(entity, operation, Outcome::Abandoned { reason })
    }

    pub fn with_log_file(mut self, log_file: Option<PathBuf>) -> Self {
        self.log_files.extend(log_file);
        self
    }

    pub fn with_release(mut self, release: Release) -> Self {
        self.release = Some(release);
        self
    }

    pub fn success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded | Outcome::Unchanged)
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self.outcome, Outcome::Abandoned { .. })
    }

    pub fn error_message(&self) -> Option<String> {
        match &self.outcome {
            Outcome::Succeeded | Outcome::Unchanged => None,
            Outcome::Failed { message } => Some(message.clone()),
            Outcome::Abandoned { reason } => Some(format!("abandoned: {}", reason)),
        }
    }
}

/// An entity that never got a plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedToPlan {
    pub entity: EntityRef,
    pub message: String,
}

/// Everything a run produced
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlowResult {
    pub results: Vec<PlanResult>,
    pub failed_to_plan: Vec<FailedToPlan>,
    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl FlowResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(&self) -> bool {
        self.failed_to_plan.is_empty() && self.results.iter().all(PlanResult::success)
    }

    pub fn push(&mut self, result: PlanResult) {
        self.results.push(result);
    }

    pub fn push_failed_to_plan(&mut self, failure: FailedToPlan) {
        self.failed_to_plan.push(failure);
    }

    /// Combine two runs without dropping anything either one recorded
    pub fn merge(&mut self, other: FlowResult) {
        self.results.extend(other.results);
        self.failed_to_plan.extend(other.failed_to_plan);
        self.duration_ms += other.duration_ms;
    }

    pub fn get(&self, entity: &EntityRef) -> Option<&PlanResult> {
        self.results.iter().find(|r| &r.entity == entity)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &PlanResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == Outcome::Succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &PlanResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Failed { .. }))
    }

    pub fn abandoned(&self) -> impl Iterator<Item = &PlanResult> {
        self.results.iter().filter(|r| r.is_abandoned())
    }

    pub fn summary(&self) -> FlowSummary {
        FlowSummary {
            succeeded: self.succeeded().count(),
            unchanged: self
                .results
                .iter()
                .filter(|r| r.outcome == Outcome::Unchanged)
                .count(),
            failed: self.failed().count(),
            abandoned: self.abandoned().count(),
            failed_to_plan: self.failed_to_plan.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSummary {
    pub succeeded: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub failed_to_plan: usize,
}

impl fmt::Display for FlowSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} unchanged, {} failed, {} abandoned, {} failed to plan",
            self.succeeded, self.unchanged, self.failed, self.abandoned, self.failed_to_plan
        )
    }
}
