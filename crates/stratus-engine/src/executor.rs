//! DAG executor
//!
//! One task per plan, memoized by plan id so a dependency shared by several
//! dependents runs exactly once. Each task waits only on its own
//! dependencies, which run concurrently. Nothing here ever fails: errors
//! become failed results, and plans that never got to run are abandoned
//! with a reason.

use crate::entity::EntityRef;
use crate::lock::{LockProvider, ReleaseReason};
use crate::plan::Plan;
use crate::result::{AbandonReason, PlanResult};
use crate::state::StateStore;
use futures_util::future::{BoxFuture, FutureExt, Shared, join_all};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

type Task = Shared<BoxFuture<'static, PlanResult>>;

pub struct Executor {
    store: Arc<dyn StateStore>,
    locks: Arc<dyn LockProvider>,
}

struct Run {
    store: Arc<dyn StateStore>,
    locks: Arc<dyn LockProvider>,
    plans: HashMap<EntityRef, Arc<Plan>>,
    /// Results decided before execution (e.g. lock conflicts)
    settled: HashMap<EntityRef, PlanResult>,
    tasks: Mutex<HashMap<EntityRef, Task>>,
    finished: Mutex<HashMap<EntityRef, PlanResult>>,
}

impl Run {
    fn tasks(&self) -> MutexGuard<'_, HashMap<EntityRef, Task>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finished(&self) -> MutexGuard<'_, HashMap<EntityRef, PlanResult>> {
        self.finished.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The single task for `id`, created on first request
    fn task(self: &Arc<Self>, id: &EntityRef) -> Task {
        let mut tasks = self.tasks();
        if let Some(task) = tasks.get(id) {
            return task.clone();
        }
        let run = self.clone();
        let task_id = id.clone();
        let task = async move { run.run_plan(task_id).await }.boxed().shared();
        tasks.insert(id.clone(), task.clone());
        task
    }

    async fn run_plan(self: Arc<Self>, id: EntityRef) -> PlanResult {
        if let Some(result) = self.settled.get(&id) {
            return result.clone();
        }
        let Some(plan) = self.plans.get(&id).cloned() else {
            return PlanResult::failed(id, crate::classify::OperationType::Noop, "unknown plan");
        };

        let mut waits = Vec::new();
        let mut early = None;
        for dependency in plan.depends_on() {
            if !self.plans.contains_key(dependency) && !self.settled.contains_key(dependency) {
                early = Some(AbandonReason::MissingDependency {
                    dependency: dependency.to_string(),
                });
                break;
            }
            waits.push(self.task(dependency));
        }

        let (result, executed) = match early {
            Some(reason) => (plan.abandon(reason), false),
            None => {
                let dependencies = join_all(waits).await;
                match dependencies.iter().find(|r| !r.success()) {
                    Some(failed) => (
                        plan.abandon(AbandonReason::DependencyFailed {
                            dependency: failed.entity.to_string(),
                        }),
                        false,
                    ),
                    None => (plan.execute(self.store.as_ref(), &dependencies).await, true),
                }
            }
        };

        if let Some(lock) = plan.take_lock() {
            let reason = if executed {
                ReleaseReason::Completed
            } else {
                ReleaseReason::Abandoned
            };
            if let Err(e) = self.locks.release(&lock, reason).await {
                tracing::warn!("Failed to release lock on {}: {}", plan.entity(), e);
            }
        }

        self.finished().insert(id, result.clone());
        result
    }
}

impl Executor {
    pub fn new(store: Arc<dyn StateStore>, locks: Arc<dyn LockProvider>) -> Self {
        Self { store, locks }
    }

    /// Run every plan to a terminal result
    pub async fn run(&self, plans: &[Arc<Plan>], settled: Vec<PlanResult>) -> Vec<PlanResult> {
        self.run_until(plans, settled, std::future::pending::<()>())
            .await
    }

    /// Run until done or until `interrupt` resolves
    ///
    /// On interrupt, in-flight work is dropped, every lock still attached to
    /// a plan is released as abandoned, and plans without a result are
    /// reported as interrupted.
    pub async fn run_until<I>(
        &self,
        plans: &[Arc<Plan>],
        settled: Vec<PlanResult>,
        interrupt: I,
    ) -> Vec<PlanResult>
    where
        I: Future<Output = ()> + Send,
    {
        let by_id: HashMap<EntityRef, Arc<Plan>> = plans
            .iter()
            .map(|p| (p.id().clone(), p.clone()))
            .collect();
        let mut presettled: HashMap<EntityRef, PlanResult> = settled
            .iter()
            .map(|r| (r.entity.clone(), r.clone()))
            .collect();
        for id in cyclic_plans(&by_id) {
            if let Some(plan) = by_id.get(&id) {
                presettled
                    .entry(id)
                    .or_insert_with(|| plan.abandon(AbandonReason::CyclicDependency));
            }
        }

        let run = Arc::new(Run {
            store: self.store.clone(),
            locks: self.locks.clone(),
            plans: by_id,
            settled: presettled,
            tasks: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        });

        let roots: Vec<Task> = plans
            .iter()
            .filter(|p| !run.settled.contains_key(p.id()))
            .map(|p| run.task(p.id()))
            .collect();

        let interrupted = tokio::select! {
            _ = join_all(roots) => false,
            _ = interrupt => true,
        };

        if interrupted {
            tracing::warn!("Run interrupted, releasing locks");
        }
        // Unpolled tasks hold the run alive
        run.tasks().clear();

        let mut finished = std::mem::take(&mut *run.finished());
        let mut results = Vec::with_capacity(plans.len() + settled.len());
        for result in &settled {
            if !run.plans.contains_key(&result.entity) {
                results.push(result.clone());
            }
        }
        for plan in plans {
            let result = match run.settled.get(plan.id()) {
                Some(result) => result.clone(),
                None => finished
                    .remove(plan.id())
                    .unwrap_or_else(|| plan.abandon(AbandonReason::Interrupted)),
            };
            if let Some(lock) = plan.take_lock() {
                if let Err(e) = self.locks.release(&lock, ReleaseReason::Abandoned).await {
                    tracing::warn!("Failed to release lock on {}: {}", plan.entity(), e);
                }
            }
            results.push(result);
        }
        results
    }
}

/// Plans that sit on a dependency cycle
fn cyclic_plans(plans: &HashMap<EntityRef, Arc<Plan>>) -> HashSet<EntityRef> {
    fn visit<'a>(
        id: &'a EntityRef,
        plans: &'a HashMap<EntityRef, Arc<Plan>>,
        stack: &mut Vec<&'a EntityRef>,
        done: &mut HashSet<&'a EntityRef>,
        cyclic: &mut HashSet<EntityRef>,
    ) {
        if done.contains(id) {
            return;
        }
        if let Some(start) = stack.iter().position(|s| *s == id) {
            cyclic.extend(stack[start..].iter().map(|s| (*s).clone()));
            return;
        }
        let Some(plan) = plans.get(id) else {
            return;
        };
        stack.push(id);
        for dependency in plan.depends_on() {
            visit(dependency, plans, stack, done, cyclic);
        }
        stack.pop();
        done.insert(id);
    }

    let mut cyclic = HashSet::new();
    let mut done = HashSet::new();
    for id in plans.keys() {
        visit(id, plans, &mut Vec::new(), &mut done, &mut cyclic);
    }
    cyclic
}
