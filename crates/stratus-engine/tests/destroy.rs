mod common;

use common::{RESOURCE_PRODUCT, TestEngine, TestEntity, env};
use serde_json::json;
use stratus_engine::{
    EngineError, EntityKind, EnvironmentRef, EnvironmentStatus, OperationType, PersistedState,
    PlanError, StatePath, StateStore, Status,
};

async fn deployed() -> TestEngine {
    let t = TestEngine::new();
    let ctx = t.context().await;
    let entities = vec![
        TestEntity::resource("db").set("size", json!(1)).build(),
        TestEntity::resource("cache").set("size", json!(1)).build(),
        TestEntity::service("api")
            .set("image", json!("api:1"))
            .owns(TestEntity::resource("api_db").set("size", json!(1)))
            .build(),
    ];
    let graph = t.engine.plan(&ctx, &entities).await.unwrap();
    assert!(t.engine.apply(&graph).await.unwrap().success());
    t
}

#[tokio::test]
async fn test_delete_environment_destroys_services_before_resources() {
    let t = deployed().await;

    let flow = t.engine.delete_environment(&env()).await.unwrap();

    assert!(flow.success(), "{:?}", flow);
    assert_eq!(flow.results.len(), 4);
    assert!(flow.results.iter().all(|r| r.operation == OperationType::Destroy));
    assert_eq!(t.deployer.phases().last().unwrap(), "destroy api");

    let mut destroyed = t.provisioner.destroyed();
    destroyed.sort();
    assert_eq!(destroyed, vec!["api_db", "cache", "db"]);

    for kind in [EntityKind::Resource, EntityKind::Service] {
        assert!(t.engine.store().list(&env(), kind).await.unwrap().is_empty());
    }
    assert!(matches!(
        t.engine.context(&env()).await,
        Err(EngineError::EnvironmentNotFound(_))
    ));
    assert!(!t.backend.is_locked(&StatePath::Environment(env())));
}

#[tokio::test]
async fn test_resource_destroys_wait_for_services() {
    let t = deployed().await;
    let ctx = t.context().await;

    let graph = t.engine.plan_destroy(&ctx, |_| true).await.unwrap();

    assert_eq!(graph.summary().destroy, 4);
    let db = graph.get(&env().resource("db")).unwrap();
    assert_eq!(db.depends_on(), &[env().service("api")]);
    assert!(graph.get(&env().service("api")).unwrap().depends_on().is_empty());
    assert!(
        graph
            .render()
            .ends_with("0 to create, 0 to update, 0 to replace, 4 to destroy, 0 unchanged")
    );
}

#[tokio::test]
async fn test_failed_destroy_marks_environment_delete_failed() {
    let t = deployed().await;
    t.provisioner.fail_on("db");

    let flow = t.engine.delete_environment(&env()).await.unwrap();

    assert!(!flow.success());
    let db = flow.get(&env().resource("db")).unwrap();
    assert!(db.error_message().unwrap().contains("cannot delete db"));

    let ctx = t.context().await;
    assert_eq!(ctx.state().status, EnvironmentStatus::DeleteFailed);

    let state = t
        .engine
        .store()
        .load(&env().resource("db"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, Status::DeleteFailed);
    assert!(t.engine.store().load(&env().resource("cache")).await.unwrap().is_none());
    assert!(!t.backend.is_locked(&StatePath::Environment(env())));
}

#[tokio::test]
async fn test_destroy_filter_and_pending_entities() {
    let t = TestEngine::new();
    t.backend.seed(
        &env().resource("db"),
        PersistedState::new(EntityKind::Resource, RESOURCE_PRODUCT, Status::Ready)
            .with_inputs(json!({"size": 1})),
    );
    t.backend.seed(
        &env().resource("cache"),
        PersistedState::new(EntityKind::Resource, RESOURCE_PRODUCT, Status::Creating),
    );
    t.backend.seed(
        &env().resource("logs"),
        PersistedState::new(EntityKind::Resource, RESOURCE_PRODUCT, Status::Ready)
            .with_inputs(json!({})),
    );
    let ctx = t.context().await;

    let graph = t
        .engine
        .plan_destroy(&ctx, |entity| entity.name != "logs")
        .await
        .unwrap();

    assert_eq!(graph.plans.len(), 1);
    assert_eq!(graph.plans[0].entity().name, "db");
    assert_eq!(graph.failed_to_plan.len(), 1);
    assert!(graph.failed_to_plan[0].message.contains("CREATING"));

    let flow = t.engine.apply(&graph).await.unwrap();
    assert!(!flow.success());
    assert_eq!(flow.summary().succeeded, 1);
    assert_eq!(t.provisioner.destroyed(), vec!["db"]);
    assert!(t.engine.store().load(&env().resource("logs")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_create_environment() {
    let t = TestEngine::new();
    let staging = EnvironmentRef::new("shop", "staging");

    let ctx = t
        .engine
        .create_environment(&staging, Some("gcp".to_string()))
        .await
        .unwrap();
    assert_eq!(ctx.provider(), Some("gcp"));
    assert_eq!(ctx.state().status, EnvironmentStatus::Ready);
    assert!(!t.backend.is_locked(&StatePath::Environment(staging.clone())));

    let err = t.engine.create_environment(&staging, None).await.unwrap_err();
    assert!(matches!(err, EngineError::EnvironmentExists(_)));

    let err = t
        .engine
        .create_environment(&EnvironmentRef::new("shop", "locks"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Plan(PlanError::InvalidName { .. })));
}
