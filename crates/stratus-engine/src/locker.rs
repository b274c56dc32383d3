//! Plan locking with optimistic revalidation
//!
//! A plan is locked right before execution. After the lock is taken the
//! entity's state is reloaded and compared with what the plan was built
//! from; any difference means someone else got there first and the plan
//! must be rebuilt.

use crate::entity::{EnvironmentRef, StatePath};
use crate::error::LockError;
use crate::lock::{LockOperation, LockProvider, ReleaseReason, acquire_with_backoff};
use crate::plan::Plan;
use crate::result::PlanResult;
use crate::state::StateStore;
use futures_util::future::join_all;
use std::sync::Arc;
use stratus_config::LockRetryConfig;

pub struct Locker {
    store: Arc<dyn StateStore>,
    locks: Arc<dyn LockProvider>,
    retry: LockRetryConfig,
}

impl Locker {
    pub fn new(
        store: Arc<dyn StateStore>,
        locks: Arc<dyn LockProvider>,
        retry: LockRetryConfig,
    ) -> Self {
        Self {
            store,
            locks,
            retry,
        }
    }

    /// Lock one plan and revalidate its state; noop plans are skipped
    pub async fn lock_plan(&self, plan: &Plan) -> Result<(), LockError> {
        let Some(operation) = LockOperation::for_plan(plan.operation()) else {
            return Ok(());
        };
        if plan.is_locked() {
            return Ok(());
        }

        let path = StatePath::Entity(plan.entity().clone());
        let lock = self
            .locks
            .acquire(&path, operation, &plan.render())
            .await?;

        let current = match self.store.load(plan.entity()).await {
            Ok(current) => current,
            Err(e) => {
                self.release_quietly(&lock, ReleaseReason::Abandoned).await;
                return Err(e.into());
            }
        };

        if current.as_ref() != plan.existing() {
            tracing::warn!("State of {} changed since planning", plan.entity());
            self.release_quietly(&lock, ReleaseReason::Abandoned).await;
            return Err(LockError::StateMismatch {
                entity: plan.entity().to_string(),
            });
        }

        tracing::debug!("Locked {} ({})", plan.entity(), lock.lock_id);
        plan.attach_lock(lock);
        Ok(())
    }

    /// Lock every plan, wrapping acquisition in an environment lock on
    /// network backends
    ///
    /// Conflicts and drift settle the affected plan as failed. Backend
    /// failures release whatever was taken and propagate.
    pub async fn lock_plans(
        &self,
        env: &EnvironmentRef,
        plans: &[Arc<Plan>],
    ) -> Result<Vec<PlanResult>, LockError> {
        if !self.locks.requires_network() || plans.iter().all(|p| p.is_noop()) {
            return self.lock_each(plans).await;
        }

        let env_path = StatePath::Environment(env.clone());
        let metadata = format!("lock {} plans in {}", plans.len(), env);
        let env_lock = acquire_with_backoff(
            self.locks.as_ref(),
            &env_path,
            LockOperation::LockPlans,
            &metadata,
            &self.retry,
        )
        .await?;

        let settled = self.lock_each(plans).await;
        let reason = if settled.is_ok() {
            ReleaseReason::Completed
        } else {
            ReleaseReason::Abandoned
        };
        self.release_quietly(&env_lock, reason).await;
        settled
    }

    /// Lock every plan without an environment lock
    pub async fn lock_each(&self, plans: &[Arc<Plan>]) -> Result<Vec<PlanResult>, LockError> {
        let attempts = join_all(plans.iter().map(|plan| async move {
            let locked = self.lock_plan(plan).await;
            (plan, locked)
        }))
        .await;

        let mut settled = Vec::new();
        let mut fatal = None;
        for (plan, locked) in attempts {
            match locked {
                Ok(()) => {}
                Err(e @ (LockError::AlreadyLocked { .. } | LockError::StateMismatch { .. })) => {
                    settled.push(PlanResult::failed(
                        plan.entity().clone(),
                        plan.operation(),
                        e.to_string(),
                    ));
                }
                Err(e) => {
                    fatal.get_or_insert(e);
                }
            }
        }

        if let Some(e) = fatal {
            self.release_all(plans, ReleaseReason::Abandoned).await;
            return Err(e);
        }
        Ok(settled)
    }

    /// Release every lock still attached to a plan
    pub async fn release_all(&self, plans: &[Arc<Plan>], reason: ReleaseReason) {
        for plan in plans {
            if let Some(lock) = plan.take_lock() {
                self.release_quietly(&lock, reason).await;
            }
        }
    }

    async fn release_quietly(&self, lock: &crate::lock::Lock, reason: ReleaseReason) {
        if let Err(e) = self.locks.release(lock, reason).await {
            tracing::warn!("Failed to release lock on {}: {}", lock.path, e);
        }
    }
}
