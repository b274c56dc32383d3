use super::{Plan, ResourcePlan, guarded, save_state, starting_state};
use crate::classify::apply_ignored;
use crate::entity::EntityKind;
use crate::inputs::{InputMode, OutputMap};
use crate::provision::ProvisionRequest;
use crate::result::PlanResult;
use crate::state::{StateStore, Status};

pub(super) async fn execute(
    plan: &Plan,
    body: &ResourcePlan,
    store: &dyn StateStore,
    outputs: &OutputMap,
    lock_id: &str,
) -> PlanResult {
    let entity = plan.entity().clone();
    let operation = plan.operation();

    let mut inputs = match body.inputs.render(&InputMode::Execution(outputs)) {
        Ok(inputs) => inputs,
        Err(e) => return PlanResult::failed(entity, operation, e.to_string()),
    };
    apply_ignored(
        &mut inputs,
        plan.existing().and_then(|s| s.inputs.as_ref()),
        &body.ignore_arguments,
    );

    let Some(pending) = Status::in_progress(operation) else {
        return PlanResult::unchanged(entity, plan.existing().map(|s| s.outputs()));
    };

    let mut state = starting_state(plan, EntityKind::Resource);
    state.attempted_inputs = Some(inputs.clone());
    state.transition(pending);
    if let Err(message) = save_state(store, &entity, &state, lock_id).await {
        return PlanResult::failed(entity, operation, message);
    }

    tracing::info!("{} {} ({})", operation, entity, plan.product());
    let request = ProvisionRequest {
        entity: &entity,
        product: plan.product(),
        operation,
        inputs: &inputs,
        existing: plan.existing(),
        lock_id,
    };

    match guarded(body.provisioner.execute(request)).await {
        Ok(outcome) => {
            state.inputs = Some(outcome.inputs);
            state.attempted_inputs = None;
            if outcome.provider_id.is_some() {
                state.provider_id = outcome.provider_id;
            }
            state.transition(Status::Ready);
            if let Err(message) = save_state(store, &entity, &state, lock_id).await {
                return PlanResult::failed(entity, operation, message).with_log_file(outcome.log_file);
            }
            tracing::info!("{} is ready", entity);
            PlanResult::succeeded(entity, operation, Some(state.outputs()))
                .with_log_file(outcome.log_file)
        }
        Err(message) => {
            tracing::warn!("{} {} failed: {}", operation, entity, message);
            state.transition(pending.failed());
            let message = match save_state(store, &entity, &state, lock_id).await {
                Ok(()) => message,
                Err(save_error) => format!("{}; {}", message, save_error),
            };
            PlanResult::failed(entity, operation, message)
        }
    }
}
