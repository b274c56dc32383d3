mod common;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use common::{TestEntity, env};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use stratus_engine::backend::LOCK_ID_HEADER;
use stratus_engine::{
    Engine, EngineError, EnvironmentRef, ForceRelease, LockError, LockOperation, LockProvider,
    Provisioners, ReleaseReason, RemoteBackend, StateError, StatePath, StateStore, Status,
};
use tokio::net::TcpListener;

/// Minimal control plane: state records plus lock objects, keyed by path
#[derive(Clone, Default)]
struct ControlPlane {
    records: Arc<Mutex<HashMap<String, Value>>>,
    locks: Arc<Mutex<HashMap<String, Value>>>,
}

impl ControlPlane {
    fn lock_id(&self, key: &str) -> Option<String> {
        self.locks
            .lock()
            .unwrap()
            .get(key)
            .and_then(|info| info["lock_id"].as_str().map(str::to_string))
    }

    fn holds(&self, key: &str, headers: &HeaderMap) -> bool {
        let presented = headers
            .get(LOCK_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        presented.is_some() && presented == self.lock_id(key)
    }
}

async fn acquire(
    State(plane): State<ControlPlane>,
    Path(key): Path<String>,
    Json(info): Json<Value>,
) -> Response {
    let mut locks = plane.locks.lock().unwrap();
    if let Some(existing) = locks.get(&key) {
        return (StatusCode::LOCKED, Json(existing.clone())).into_response();
    }
    locks.insert(key, info);
    StatusCode::CREATED.into_response()
}

async fn release(
    State(plane): State<ControlPlane>,
    Path(key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    let Some(current) = plane.lock_id(&key) else {
        return StatusCode::NOT_FOUND;
    };
    if params.get("force").map(String::as_str) != Some("true")
        && params.get("lock_id") != Some(&current)
    {
        return StatusCode::CONFLICT;
    }
    plane.locks.lock().unwrap().remove(&key);
    StatusCode::NO_CONTENT
}

async fn read(State(plane): State<ControlPlane>, Path(key): Path<String>) -> Response {
    match plane.records.lock().unwrap().get(&key) {
        Some(record) => Json(record.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn write(
    State(plane): State<ControlPlane>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(record): Json<Value>,
) -> StatusCode {
    if !plane.holds(&key, &headers) {
        return StatusCode::CONFLICT;
    }
    plane.records.lock().unwrap().insert(key, record);
    StatusCode::NO_CONTENT
}

async fn remove(
    State(plane): State<ControlPlane>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    if !plane.holds(&key, &headers) {
        return StatusCode::PRECONDITION_FAILED;
    }
    match plane.records.lock().unwrap().remove(&key) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

async fn list(State(plane): State<ControlPlane>, Path(prefix): Path<String>) -> Json<Value> {
    let prefix = format!("{}/", prefix);
    let records = plane.records.lock().unwrap();
    let found: Map<String, Value> = records
        .iter()
        .filter_map(|(key, record)| {
            let name = key.strip_prefix(&prefix)?;
            (!name.contains('/')).then(|| (name.to_string(), record.clone()))
        })
        .collect();
    Json(Value::Object(found))
}

async fn serve() -> (String, ControlPlane) {
    let plane = ControlPlane::default();
    let router = Router::new()
        .route("/v1/locks/{*key}", post(acquire).delete(release))
        .route(
            "/v1/state/{*key}",
            axum::routing::get(read).put(write).delete(remove),
        )
        .route("/v1/list/{*prefix}", axum::routing::get(list))
        .with_state(plane.clone());

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), plane)
}

fn engine(url: &str) -> (Engine, Arc<common::RecordingProvisioner>) {
    let provisioner = common::RecordingProvisioner::new();
    let provisioners =
        Provisioners::new().with_resource(common::RESOURCE_PRODUCT, provisioner.clone());
    let backend = Arc::new(RemoteBackend::new(url));
    (Engine::with_backend(backend, provisioners), provisioner)
}

#[tokio::test]
async fn test_remote_lock_lifecycle() {
    let (url, plane) = serve().await;
    let backend = RemoteBackend::new(&url);
    let path = StatePath::Entity(env().resource("db"));

    let lock = backend
        .acquire(&path, LockOperation::Create, "create resource 'db'")
        .await
        .unwrap();
    assert_eq!(plane.lock_id("shop/dev/resources/db"), Some(lock.lock_id.clone()));

    let err = backend
        .acquire(&path, LockOperation::Update, "second")
        .await
        .unwrap_err();
    match err {
        LockError::AlreadyLocked { holder, .. } => assert!(holder.contains("create")),
        other => panic!("unexpected error: {}", other),
    }

    backend.release(&lock, ReleaseReason::Completed).await.unwrap();
    assert!(plane.lock_id("shop/dev/resources/db").is_none());
    // Already gone is fine
    backend.release(&lock, ReleaseReason::Completed).await.unwrap();

    backend
        .acquire(&path, LockOperation::Destroy, "stuck")
        .await
        .unwrap();
    assert_eq!(
        backend.force_release(&path).await.unwrap(),
        ForceRelease::Released
    );
    assert_eq!(
        backend.force_release(&path).await.unwrap(),
        ForceRelease::NotFound
    );
}

#[tokio::test]
async fn test_remote_write_requires_active_lock() {
    let (url, _plane) = serve().await;
    let backend = RemoteBackend::new(&url);
    let entity = env().resource("db");
    let state = stratus_engine::PersistedState::new(
        stratus_engine::EntityKind::Resource,
        common::RESOURCE_PRODUCT,
        Status::Creating,
    );

    let err = backend.save(&entity, &state, "not-a-lock").await.unwrap_err();
    assert!(matches!(err, StateError::StaleLock { .. }));

    let lock = backend
        .acquire(&StatePath::Entity(entity.clone()), LockOperation::Create, "")
        .await
        .unwrap();
    backend.save(&entity, &state, &lock.lock_id).await.unwrap();
    assert_eq!(backend.load(&entity).await.unwrap(), Some(state));

    backend.delete(&entity, &lock.lock_id).await.unwrap();
    assert!(backend.load(&entity).await.unwrap().is_none());
}

#[tokio::test]
async fn test_engine_against_remote_backend() {
    let (url, plane) = serve().await;
    let (engine, provisioner) = engine(&url);

    let ctx = engine
        .create_environment(&env(), Some("gcp".to_string()))
        .await
        .unwrap();
    let entities = vec![
        TestEntity::resource("db").set("size", json!(1)).build(),
        TestEntity::resource("app")
            .from_resource("db_id", "db", "provider_id")
            .build(),
    ];

    let graph = engine.plan(&ctx, &entities).await.unwrap();
    let flow = engine.apply(&graph).await.unwrap();
    assert!(flow.success(), "{:?}", flow);
    assert_eq!(provisioner.calls().len(), 2);
    assert!(plane.locks.lock().unwrap().is_empty());

    let records = engine
        .store()
        .list(&env(), stratus_engine::EntityKind::Resource)
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records["app"].inputs, Some(json!({"db_id": "id-db"})));

    let flow = engine.delete_environment(&env()).await.unwrap();
    assert!(flow.success());
    assert!(plane.records.lock().unwrap().is_empty());
    assert!(matches!(
        engine.context(&env()).await,
        Err(EngineError::EnvironmentNotFound(_))
    ));
}

#[tokio::test]
async fn test_unreachable_remote_backend_is_an_error() {
    let backend = RemoteBackend::new("http://127.0.0.1:9");
    let err = backend
        .load_environment(&EnvironmentRef::new("shop", "dev"))
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::Backend(_)));
}
