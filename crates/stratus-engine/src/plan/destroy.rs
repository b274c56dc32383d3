use super::{DestroyPlan, DestroyTarget, Plan, guarded, save_state};
use crate::provision::DestroyRequest;
use crate::result::PlanResult;
use crate::state::{StateStore, Status};

pub(super) async fn execute(
    plan: &Plan,
    body: &DestroyPlan,
    store: &dyn StateStore,
    lock_id: &str,
) -> PlanResult {
    let entity = plan.entity().clone();
    let operation = plan.operation();
    let Some(existing) = plan.existing() else {
        return PlanResult::succeeded(entity, operation, None);
    };

    let mut state = existing.clone();
    state.transition(Status::Destroying);
    if let Err(message) = save_state(store, &entity, &state, lock_id).await {
        return PlanResult::failed(entity, operation, message);
    }

    tracing::info!("Destroying {} ({})", entity, plan.product());
    let request = DestroyRequest {
        entity: &entity,
        product: plan.product(),
        existing,
        lock_id,
    };
    let destroyed = match &body.target {
        DestroyTarget::Resource(provisioner) => guarded(provisioner.destroy(request)).await,
        DestroyTarget::Service(deployer) => guarded(deployer.destroy(request)).await,
    };

    match destroyed {
        Ok(()) => match store.delete(&entity, lock_id).await {
            Ok(()) => {
                tracing::info!("{} destroyed", entity);
                PlanResult::succeeded(entity, operation, None)
            }
            Err(e) => PlanResult::failed(
                entity,
                operation,
                format!("destroyed but failed to delete the record: {}", e),
            ),
        },
        Err(message) => {
            tracing::warn!("Destroying {} failed: {}", entity, message);
            state.transition(Status::DeleteFailed);
            let message = match save_state(store, &entity, &state, lock_id).await {
                Ok(()) => message,
                Err(save_error) => format!("{}; {}", message, save_error),
            };
            PlanResult::failed(entity, operation, message)
        }
    }
}
