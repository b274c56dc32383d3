//! In-memory StateStore and LockProvider
//!
//! Enforces lock ids on writes the way a remote control plane would, which
//! makes it the backend of choice for tests and embedding.

use crate::entity::{EntityKind, EntityRef, EnvironmentRef, StatePath};
use crate::error::{LockError, StateError};
use crate::lock::{ForceRelease, Lock, LockInfo, LockOperation, LockProvider, ReleaseReason};
use crate::state::{EnvironmentState, PersistedState, StateStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Lock activity, recorded for inspection
#[derive(Debug, Clone, PartialEq)]
pub enum LockEvent {
    Acquired {
        key: String,
        operation: LockOperation,
    },
    Released {
        key: String,
        reason: ReleaseReason,
    },
    ForceReleased {
        key: String,
    },
}

#[derive(Default)]
struct Inner {
    environments: HashMap<EnvironmentRef, EnvironmentState>,
    entities: HashMap<EntityRef, PersistedState>,
    locks: HashMap<String, LockInfo>,
    events: Vec<LockEvent>,
    writes: usize,
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    networked: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behave like a network backend (environment-level batch lock)
    pub fn networked() -> Self {
        Self {
            inner: Mutex::default(),
            networked: true,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write a record without holding its lock
    pub fn seed_environment(&self, env: &EnvironmentRef, state: EnvironmentState) {
        self.inner().environments.insert(env.clone(), state);
    }

    /// Write a record without holding its lock
    pub fn seed(&self, entity: &EntityRef, state: PersistedState) {
        self.inner().entities.insert(entity.clone(), state);
    }

    pub fn lock_events(&self) -> Vec<LockEvent> {
        self.inner().events.clone()
    }

    /// Number of lock-checked writes and deletes so far
    pub fn write_count(&self) -> usize {
        self.inner().writes
    }

    pub fn is_locked(&self, path: &StatePath) -> bool {
        self.inner().locks.contains_key(&path.key())
    }

    fn check_lock(inner: &Inner, key: &str, lock_id: &str) -> Result<(), StateError> {
        match inner.locks.get(key) {
            Some(info) if info.lock_id == lock_id => Ok(()),
            Some(_) => Err(StateError::StaleLock {
                path: key.to_string(),
                message: format!("lock {} is not the active lock", lock_id),
            }),
            None => Err(StateError::StaleLock {
                path: key.to_string(),
                message: "no lock is held".to_string(),
            }),
        }
    }
}

#[async_trait]
impl StateStore for MemoryBackend {
    async fn load_environment(
        &self,
        env: &EnvironmentRef,
    ) -> Result<Option<EnvironmentState>, StateError> {
        Ok(self.inner().environments.get(env).cloned())
    }

    async fn save_environment(
        &self,
        env: &EnvironmentRef,
        state: &EnvironmentState,
        lock_id: &str,
    ) -> Result<(), StateError> {
        let mut inner = self.inner();
        Self::check_lock(&inner, &env.key(), lock_id)?;
        inner.environments.insert(env.clone(), state.clone());
        inner.writes += 1;
        Ok(())
    }

    async fn delete_environment(
        &self,
        env: &EnvironmentRef,
        lock_id: &str,
    ) -> Result<(), StateError> {
        let mut inner = self.inner();
        Self::check_lock(&inner, &env.key(), lock_id)?;
        inner.environments.remove(env);
        inner.writes += 1;
        Ok(())
    }

    async fn load(&self, entity: &EntityRef) -> Result<Option<PersistedState>, StateError> {
        Ok(self.inner().entities.get(entity).cloned())
    }

    async fn save(
        &self,
        entity: &EntityRef,
        state: &PersistedState,
        lock_id: &str,
    ) -> Result<(), StateError> {
        let mut inner = self.inner();
        Self::check_lock(&inner, &entity.key(), lock_id)?;
        inner.entities.insert(entity.clone(), state.clone());
        inner.writes += 1;
        Ok(())
    }

    async fn delete(&self, entity: &EntityRef, lock_id: &str) -> Result<(), StateError> {
        let mut inner = self.inner();
        Self::check_lock(&inner, &entity.key(), lock_id)?;
        inner.entities.remove(entity);
        inner.writes += 1;
        Ok(())
    }

    async fn list(
        &self,
        env: &EnvironmentRef,
        kind: EntityKind,
    ) -> Result<BTreeMap<String, PersistedState>, StateError> {
        Ok(self
            .inner()
            .entities
            .iter()
            .filter(|(entity, _)| entity.kind == kind && entity.environment_ref() == *env)
            .map(|(entity, state)| (entity.name.clone(), state.clone()))
            .collect())
    }
}

#[async_trait]
impl LockProvider for MemoryBackend {
    fn requires_network(&self) -> bool {
        self.networked
    }

    async fn acquire(
        &self,
        path: &StatePath,
        operation: LockOperation,
        metadata: &str,
    ) -> Result<Lock, LockError> {
        let key = path.key();
        let mut inner = self.inner();
        if let Some(info) = inner.locks.get(&key) {
            return Err(LockError::AlreadyLocked {
                path: key,
                holder: info.describe(),
            });
        }

        let lock = Lock::new(path.clone(), operation, metadata);
        inner.locks.insert(key.clone(), lock.info());
        inner.events.push(LockEvent::Acquired { key, operation });
        Ok(lock)
    }

    async fn release(&self, lock: &Lock, reason: ReleaseReason) -> Result<(), LockError> {
        let key = lock.path.key();
        let mut inner = self.inner();
        match inner.locks.get(&key) {
            None => {
                tracing::debug!("Lock on {} already released", key);
                return Ok(());
            }
            Some(info) if info.lock_id != lock.lock_id => {
                return Err(LockError::NotHeld {
                    path: key,
                    lock_id: lock.lock_id.clone(),
                });
            }
            Some(_) => {}
        }
        inner.locks.remove(&key);
        inner.events.push(LockEvent::Released { key, reason });
        Ok(())
    }

    async fn force_release(&self, path: &StatePath) -> Result<ForceRelease, LockError> {
        let key = path.key();
        let mut inner = self.inner();
        if inner.locks.remove(&key).is_none() {
            return Ok(ForceRelease::NotFound);
        }
        inner.events.push(LockEvent::ForceReleased { key });
        Ok(ForceRelease::Released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Status;

    fn env() -> EnvironmentRef {
        EnvironmentRef::new("shop", "dev")
    }

    #[tokio::test]
    async fn test_writes_require_the_active_lock() {
        let backend = MemoryBackend::new();
        let db = env().resource("db");
        let state = PersistedState::new(EntityKind::Resource, "postgres", Status::Creating);

        let err = backend.save(&db, &state, "bogus").await.unwrap_err();
        assert!(matches!(err, StateError::StaleLock { .. }));

        let lock = backend
            .acquire(&db.clone().into(), LockOperation::Create, "create db")
            .await
            .unwrap();
        backend.save(&db, &state, &lock.lock_id).await.unwrap();
        assert_eq!(backend.load(&db).await.unwrap(), Some(state));

        backend
            .release(&lock, ReleaseReason::Completed)
            .await
            .unwrap();
        let err = backend.delete(&db, &lock.lock_id).await.unwrap_err();
        assert!(matches!(err, StateError::StaleLock { .. }));
    }

    #[tokio::test]
    async fn test_acquire_fails_fast_when_held() {
        let backend = MemoryBackend::new();
        let path: StatePath = env().resource("db").into();

        let _lock = backend
            .acquire(&path, LockOperation::Update, "update db")
            .await
            .unwrap();
        let err = backend
            .acquire(&path, LockOperation::Update, "update db")
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::AlreadyLocked { .. }));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let backend = MemoryBackend::new();
        let path: StatePath = env().resource("db").into();
        let lock = backend
            .acquire(&path, LockOperation::Create, "")
            .await
            .unwrap();

        backend
            .release(&lock, ReleaseReason::Completed)
            .await
            .unwrap();
        backend
            .release(&lock, ReleaseReason::Abandoned)
            .await
            .unwrap();
        assert!(!backend.is_locked(&path));
    }

    #[tokio::test]
    async fn test_force_release() {
        let backend = MemoryBackend::new();
        let path: StatePath = env().into();

        assert_eq!(
            backend.force_release(&path).await.unwrap(),
            ForceRelease::NotFound
        );
        let _lock = backend
            .acquire(&path, LockOperation::LockPlans, "")
            .await
            .unwrap();
        assert_eq!(
            backend.force_release(&path).await.unwrap(),
            ForceRelease::Released
        );
        assert!(!backend.is_locked(&path));
    }

    #[tokio::test]
    async fn test_list_filters_by_kind_and_environment() {
        let backend = MemoryBackend::new();
        let state = PersistedState::new(EntityKind::Resource, "bucket", Status::Ready);
        backend.seed(&env().resource("assets"), state.clone());
        backend.seed(&env().service("api"), state.clone());
        backend.seed(&EnvironmentRef::new("shop", "prod").resource("assets"), state);

        let listed = backend.list(&env(), EntityKind::Resource).await.unwrap();
        assert_eq!(listed.keys().collect::<Vec<_>>(), vec!["assets"]);
    }
}
