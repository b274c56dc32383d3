//! Stratus plan, lock and execution engine
//!
//! Turns a set of declared resources and services into a reviewed plan,
//! locks the affected state records, executes the plan as a dependency
//! graph, and aggregates per-entity results.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                      Engine                       │
//! │            plan -> review -> apply                │
//! └───────┬──────────────┬──────────────┬────────────┘
//!         │              │              │
//! ┌───────▼──────┐ ┌─────▼──────┐ ┌─────▼──────┐
//! │ PlanBuilder  │ │   Locker   │ │  Executor  │
//! │ (classify)   │ │ (revalid.) │ │   (DAG)    │
//! └───────┬──────┘ └─────┬──────┘ └─────┬──────┘
//!         │              │              │
//! ┌───────▼──────────────▼──────────────▼────────────┐
//! │       StateStore / LockProvider backends          │
//! │      local files · object store · remote HTTP     │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! Provisioning itself is delegated to [`Provisioner`] and
//! [`ServiceDeployer`] implementations registered in [`Provisioners`].

pub mod backend;
pub mod builder;
pub mod classify;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
pub mod executor;
pub mod inputs;
pub mod lock;
pub mod locker;
pub mod plan;
pub mod provision;
pub mod result;
pub mod state;

// Re-exports
pub use backend::{LocalBackend, MemoryBackend, ObjectBackend, RemoteBackend};
pub use builder::PlanBuilder;
pub use classify::{Classification, FieldChange, OperationType};
pub use context::EnvironmentContext;
pub use engine::Engine;
pub use entity::{Dependency, Entity, EntityKind, EntityRef, EnvironmentRef, StatePath};
pub use error::{EngineError, LockError, PlanError, Result, StateError};
pub use executor::Executor;
pub use inputs::{InputTree, OutputRef};
pub use lock::{ForceRelease, Lock, LockInfo, LockOperation, LockProvider, ReleaseReason};
pub use locker::Locker;
pub use plan::{Plan, PlanGraph, PlanSummary};
pub use provision::{
    DeployRequest, Deployment, DestroyRequest, PromoteRequest, ProvisionOutcome,
    ProvisionRequest, Provisioner, Provisioners, ServiceDeployer,
};
pub use result::{AbandonReason, FailedToPlan, FlowResult, FlowSummary, Outcome, PlanResult, Release};
pub use state::{EnvironmentState, EnvironmentStatus, PersistedState, StateStore, Status};
