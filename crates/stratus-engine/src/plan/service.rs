use super::{Plan, ServicePlan, guarded, save_state, starting_state};
use crate::entity::EntityKind;
use crate::inputs::{InputMode, OutputMap};
use crate::provision::{DeployRequest, PromoteRequest};
use crate::result::{PlanResult, Release};
use crate::state::{PersistedState, StateStore, Status};

/// Record a failed phase and build the result
async fn fail(
    plan: &Plan,
    store: &dyn StateStore,
    state: &mut PersistedState,
    lock_id: &str,
    message: String,
) -> PlanResult {
    tracing::warn!("{} {} failed: {}", plan.operation(), plan.entity(), message);
    state.transition(state.status.failed());
    let message = match save_state(store, plan.entity(), state, lock_id).await {
        Ok(()) => message,
        Err(save_error) => format!("{}; {}", message, save_error),
    };
    PlanResult::failed(plan.entity().clone(), plan.operation(), message)
}

/// Creating/Updating -> Deploying -> Promoting -> Ready
pub(super) async fn execute(
    plan: &Plan,
    body: &ServicePlan,
    store: &dyn StateStore,
    outputs: &OutputMap,
    lock_id: &str,
) -> PlanResult {
    let entity = plan.entity().clone();
    let operation = plan.operation();

    let inputs = match body.inputs.render(&InputMode::Execution(outputs)) {
        Ok(inputs) => inputs,
        Err(e) => return PlanResult::failed(entity, operation, e.to_string()),
    };
    let Some(pending) = Status::in_progress(operation) else {
        return PlanResult::unchanged(entity, plan.existing().map(|s| s.outputs()));
    };

    let mut state = starting_state(plan, EntityKind::Service);
    state.attempted_inputs = Some(inputs.clone());
    state.transition(pending);
    if let Err(message) = save_state(store, &entity, &state, lock_id).await {
        return PlanResult::failed(entity, operation, message);
    }

    state.transition(Status::Deploying);
    if let Err(message) = save_state(store, &entity, &state, lock_id).await {
        return PlanResult::failed(entity, operation, message);
    }
    tracing::info!(
        "Deploying {} ({}, {} owned resources)",
        entity,
        plan.product(),
        body.owned.len()
    );

    let deploy = DeployRequest {
        entity: &entity,
        product: plan.product(),
        operation,
        inputs: &inputs,
        existing: plan.existing(),
        lock_id,
    };
    let deployment = match guarded(body.deployer.deploy(deploy)).await {
        Ok(deployment) => deployment,
        Err(message) => return fail(plan, store, &mut state, lock_id, message).await,
    };

    state.deployment_id = Some(deployment.deployment_id.clone());
    state.transition(Status::Promoting);
    if let Err(message) = save_state(store, &entity, &state, lock_id).await {
        return PlanResult::failed(entity, operation, message).with_log_file(deployment.log_file);
    }
    tracing::info!("Promoting {} to {}", entity, deployment.deployment_id);

    let promote = PromoteRequest {
        entity: &entity,
        product: plan.product(),
        deployment_id: &deployment.deployment_id,
        inputs: &inputs,
        lock_id,
    };
    let service_url = match guarded(body.deployer.promote(promote)).await {
        Ok(url) => url,
        Err(message) => {
            return fail(plan, store, &mut state, lock_id, message)
                .await
                .with_log_file(deployment.log_file);
        }
    };

    state.inputs = Some(inputs);
    state.attempted_inputs = None;
    state.service_url = Some(service_url.clone());
    state.transition(Status::Ready);
    if let Err(message) = save_state(store, &entity, &state, lock_id).await {
        return PlanResult::failed(entity, operation, message).with_log_file(deployment.log_file);
    }

    tracing::info!("{} is live at {}", entity, service_url);
    PlanResult::succeeded(entity, operation, Some(state.outputs()))
        .with_log_file(deployment.log_file)
        .with_release(Release {
            deployment_id: deployment.deployment_id,
            service_url,
        })
}
