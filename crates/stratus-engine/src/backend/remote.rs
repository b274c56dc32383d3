//! HTTP control-plane backend
//!
//! ```text
//! POST   /v1/locks/{key}                      200/201 acquired, 423 held
//! DELETE /v1/locks/{key}?lock_id=..&reason=.. 200/204 released, 404 already gone
//! DELETE /v1/locks/{key}?force=true           200/204 released, 404 not found
//! GET    /v1/state/{key}                      200 record, 404 none
//! PUT    /v1/state/{key}    (X-Lock-Id)       200/204, 409/412 stale lock
//! DELETE /v1/state/{key}    (X-Lock-Id)       200/204/404, 409/412 stale lock
//! GET    /v1/list/{project}/{env}/{kind}      200 {name: record}
//! ```

use crate::entity::{EntityKind, EntityRef, EnvironmentRef, StatePath};
use crate::error::{LockError, StateError};
use crate::lock::{ForceRelease, Lock, LockInfo, LockOperation, LockProvider, ReleaseReason};
use crate::state::{EnvironmentState, PersistedState, StateStore, check_version};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

pub const LOCK_ID_HEADER: &str = "X-Lock-Id";

pub struct RemoteBackend {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl RemoteBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, section: &str, key: &str) -> String {
        format!("{}/v1/{}/{}", self.base_url, section, key)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, reqwest::Error> {
        self.authorize(request).send().await
    }

    async fn get_record<T: DeserializeOwned>(
        &self,
        key: &str,
        version_of: impl Fn(&T) -> u32,
    ) -> Result<Option<T>, StateError> {
        let response = self
            .send(self.client.get(self.url("state", key)))
            .await
            .map_err(backend_error)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let record: T = response.json().await.map_err(backend_error)?;
                check_version(key, version_of(&record))?;
                Ok(Some(record))
            }
            status => Err(unexpected(key, status, response).await),
        }
    }

    async fn put_record<T: Serialize + Sync>(
        &self,
        key: &str,
        record: &T,
        lock_id: &str,
    ) -> Result<(), StateError> {
        let request = self
            .client
            .put(self.url("state", key))
            .header(LOCK_ID_HEADER, lock_id)
            .json(record);
        let response = self.send(request).await.map_err(backend_error)?;
        tracing::debug!("PUT state {} -> {}", key, response.status());
        check_write(key, response).await
    }

    async fn delete_record(&self, key: &str, lock_id: &str) -> Result<(), StateError> {
        let request = self
            .client
            .delete(self.url("state", key))
            .header(LOCK_ID_HEADER, lock_id);
        let response = self.send(request).await.map_err(backend_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_write(key, response).await
    }
}

fn backend_error(e: reqwest::Error) -> StateError {
    StateError::Backend(e.to_string())
}

fn lock_backend_error(e: reqwest::Error) -> LockError {
    LockError::Backend(e.to_string())
}

async fn unexpected(key: &str, status: StatusCode, response: Response) -> StateError {
    let body = response.text().await.unwrap_or_default();
    StateError::Backend(format!("{} returned {}: {}", key, status, body))
}

async fn check_write(key: &str, response: Response) -> Result<(), StateError> {
    match response.status() {
        status if status.is_success() => Ok(()),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Err(StateError::StaleLock {
            path: key.to_string(),
            message: response.text().await.unwrap_or_default(),
        }),
        status => Err(unexpected(key, status, response).await),
    }
}

#[async_trait]
impl StateStore for RemoteBackend {
    async fn load_environment(
        &self,
        env: &EnvironmentRef,
    ) -> Result<Option<EnvironmentState>, StateError> {
        self.get_record(&env.key(), |s: &EnvironmentState| s.version)
            .await
    }

    async fn save_environment(
        &self,
        env: &EnvironmentRef,
        state: &EnvironmentState,
        lock_id: &str,
    ) -> Result<(), StateError> {
        self.put_record(&env.key(), state, lock_id).await
    }

    async fn delete_environment(
        &self,
        env: &EnvironmentRef,
        lock_id: &str,
    ) -> Result<(), StateError> {
        self.delete_record(&env.key(), lock_id).await
    }

    async fn load(&self, entity: &EntityRef) -> Result<Option<PersistedState>, StateError> {
        self.get_record(&entity.key(), |s: &PersistedState| s.version)
            .await
    }

    async fn save(
        &self,
        entity: &EntityRef,
        state: &PersistedState,
        lock_id: &str,
    ) -> Result<(), StateError> {
        self.put_record(&entity.key(), state, lock_id).await
    }

    async fn delete(&self, entity: &EntityRef, lock_id: &str) -> Result<(), StateError> {
        self.delete_record(&entity.key(), lock_id).await
    }

    async fn list(
        &self,
        env: &EnvironmentRef,
        kind: EntityKind,
    ) -> Result<BTreeMap<String, PersistedState>, StateError> {
        let key = format!("{}/{}", env.key(), kind.collection());
        let response = self
            .send(self.client.get(self.url("list", &key)))
            .await
            .map_err(backend_error)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(BTreeMap::new()),
            status if status.is_success() => {
                let records: BTreeMap<String, PersistedState> =
                    response.json().await.map_err(backend_error)?;
                for (name, state) in &records {
                    check_version(&env.entity(kind, name).key(), state.version)?;
                }
                Ok(records)
            }
            status => Err(unexpected(&key, status, response).await),
        }
    }
}

#[async_trait]
impl LockProvider for RemoteBackend {
    fn requires_network(&self) -> bool {
        true
    }

    async fn acquire(
        &self,
        path: &StatePath,
        operation: LockOperation,
        metadata: &str,
    ) -> Result<Lock, LockError> {
        let key = path.key();
        let lock = Lock::new(path.clone(), operation, metadata);
        let request = self.client.post(self.url("locks", &key)).json(&lock.info());
        let response = self.send(request).await.map_err(lock_backend_error)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => {
                tracing::debug!("Acquired remote lock on {}", key);
                Ok(lock)
            }
            StatusCode::LOCKED => {
                let holder = response
                    .json::<LockInfo>()
                    .await
                    .map(|info| info.describe())
                    .unwrap_or_else(|_| "unknown".to_string());
                Err(LockError::AlreadyLocked { path: key, holder })
            }
            status => Err(LockError::Backend(format!(
                "lock {} returned {}",
                key, status
            ))),
        }
    }

    async fn release(&self, lock: &Lock, reason: ReleaseReason) -> Result<(), LockError> {
        let key = lock.path.key();
        let reason_name = reason.to_string();
        let request = self.client.delete(self.url("locks", &key)).query(&[
            ("lock_id", lock.lock_id.as_str()),
            ("reason", reason_name.as_str()),
        ]);
        let response = self.send(request).await.map_err(lock_backend_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                tracing::debug!("Remote lock on {} already released", key);
                Ok(())
            }
            StatusCode::CONFLICT => Err(LockError::NotHeld {
                path: key,
                lock_id: lock.lock_id.clone(),
            }),
            status if status.is_success() => {
                tracing::debug!("Released remote lock on {} ({})", key, reason);
                Ok(())
            }
            status => Err(LockError::Backend(format!(
                "unlock {} returned {}",
                key, status
            ))),
        }
    }

    async fn force_release(&self, path: &StatePath) -> Result<ForceRelease, LockError> {
        let key = path.key();
        let request = self
            .client
            .delete(self.url("locks", &key))
            .query(&[("force", "true")]);
        let response = self.send(request).await.map_err(lock_backend_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(ForceRelease::NotFound),
            status if status.is_success() => {
                tracing::warn!("Force-released remote lock on {}", key);
                Ok(ForceRelease::Released)
            }
            status => Err(LockError::Backend(format!(
                "force unlock {} returned {}",
                key, status
            ))),
        }
    }
}
