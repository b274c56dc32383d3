//! Object-storage backend
//!
//! Works on any store with conditional writes (GCS generations, S3
//! conditional puts). Locks are objects created with an if-absent
//! precondition and removed with a generation match, so acquisition and
//! release fail exactly when someone else raced us.

use crate::entity::{EntityKind, EntityRef, EnvironmentRef, StatePath};
use crate::error::{LockError, StateError};
use crate::lock::{ForceRelease, Lock, LockInfo, LockOperation, LockProvider, ReleaseReason};
use crate::state::{EnvironmentState, PersistedState, StateStore, check_version};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;

const STATE_PREFIX: &str = "state";
const LOCK_PREFIX: &str = "locks";

/// Write precondition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    None,
    /// Fail if the object exists
    IfAbsent,
    /// Fail unless the object is at this generation
    IfGenerationMatch(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub generation: u64,
}

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Precondition failed for {0}")]
    PreconditionFailed(String),

    #[error("Object store error: {0}")]
    Backend(String),
}

/// Minimal conditional-write object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, ObjectStoreError>;

    /// Returns the new generation
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        precondition: Precondition,
    ) -> Result<u64, ObjectStoreError>;

    /// Returns false when the object did not exist
    async fn delete(&self, key: &str, precondition: Precondition)
    -> Result<bool, ObjectStoreError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
}

/// In-process object store with real generation semantics
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    next_generation: Mutex<u64>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn generation(&self) -> u64 {
        let mut next = self
            .next_generation
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *next += 1;
        *next
    }

    fn check(
        key: &str,
        current: Option<&StoredObject>,
        precondition: Precondition,
    ) -> Result<(), ObjectStoreError> {
        let ok = match precondition {
            Precondition::None => true,
            Precondition::IfAbsent => current.is_none(),
            Precondition::IfGenerationMatch(g) => current.is_some_and(|o| o.generation == g),
        };
        if ok {
            Ok(())
        } else {
            Err(ObjectStoreError::PreconditionFailed(key.to_string()))
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, ObjectStoreError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        precondition: Precondition,
    ) -> Result<u64, ObjectStoreError> {
        let generation = self.generation();
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Self::check(key, objects.get(key), precondition)?;
        objects.insert(key.to_string(), StoredObject { data, generation });
        Ok(generation)
    }

    async fn delete(
        &self,
        key: &str,
        precondition: Precondition,
    ) -> Result<bool, ObjectStoreError> {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        if !objects.contains_key(key) && precondition == Precondition::None {
            return Ok(false);
        }
        Self::check(key, objects.get(key), precondition)?;
        Ok(objects.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

impl From<ObjectStoreError> for StateError {
    fn from(e: ObjectStoreError) -> Self {
        StateError::Backend(e.to_string())
    }
}

impl From<ObjectStoreError> for LockError {
    fn from(e: ObjectStoreError) -> Self {
        LockError::Backend(e.to_string())
    }
}

pub struct ObjectBackend<O: ObjectStore> {
    store: O,
}

impl<O: ObjectStore> ObjectBackend<O> {
    pub fn new(store: O) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &O {
        &self.store
    }

    fn state_key(key: &str) -> String {
        format!("{}/{}.json", STATE_PREFIX, key)
    }

    fn lock_key(key: &str) -> String {
        format!("{}/{}.lock", LOCK_PREFIX, key)
    }

    async fn current_lock(&self, key: &str) -> Result<Option<(LockInfo, u64)>, LockError> {
        let Some(object) = self.store.get(&Self::lock_key(key)).await? else {
            return Ok(None);
        };
        let info: LockInfo = serde_json::from_slice(&object.data)?;
        Ok(Some((info, object.generation)))
    }

    /// Writes are only accepted from the active lock holder
    async fn check_lock(&self, key: &str, lock_id: &str) -> Result<(), StateError> {
        let object = self.store.get(&Self::lock_key(key)).await?;
        let held = match object {
            Some(object) => serde_json::from_slice::<LockInfo>(&object.data)?.lock_id == lock_id,
            None => false,
        };
        if held {
            Ok(())
        } else {
            Err(StateError::StaleLock {
                path: key.to_string(),
                message: format!("lock {} is not the active lock", lock_id),
            })
        }
    }

    async fn read<T: DeserializeOwned>(
        &self,
        key: &str,
        version_of: impl Fn(&T) -> u32,
    ) -> Result<Option<T>, StateError> {
        let Some(object) = self.store.get(&Self::state_key(key)).await? else {
            return Ok(None);
        };
        let record: T = serde_json::from_slice(&object.data)?;
        check_version(key, version_of(&record))?;
        Ok(Some(record))
    }

    async fn write<T: Serialize>(
        &self,
        key: &str,
        record: &T,
        lock_id: &str,
    ) -> Result<(), StateError> {
        self.check_lock(key, lock_id).await?;
        let data = serde_json::to_vec(record)?;
        self.store
            .put(&Self::state_key(key), data, Precondition::None)
            .await?;
        tracing::debug!("Wrote object {}", Self::state_key(key));
        Ok(())
    }

    async fn remove(&self, key: &str, lock_id: &str) -> Result<(), StateError> {
        self.check_lock(key, lock_id).await?;
        self.store
            .delete(&Self::state_key(key), Precondition::None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<O: ObjectStore> StateStore for ObjectBackend<O> {
    async fn load_environment(
        &self,
        env: &EnvironmentRef,
    ) -> Result<Option<EnvironmentState>, StateError> {
        self.read(&env.key(), |s: &EnvironmentState| s.version).await
    }

    async fn save_environment(
        &self,
        env: &EnvironmentRef,
        state: &EnvironmentState,
        lock_id: &str,
    ) -> Result<(), StateError> {
        self.write(&env.key(), state, lock_id).await
    }

    async fn delete_environment(
        &self,
        env: &EnvironmentRef,
        lock_id: &str,
    ) -> Result<(), StateError> {
        self.remove(&env.key(), lock_id).await
    }

    async fn load(&self, entity: &EntityRef) -> Result<Option<PersistedState>, StateError> {
        self.read(&entity.key(), |s: &PersistedState| s.version)
            .await
    }

    async fn save(
        &self,
        entity: &EntityRef,
        state: &PersistedState,
        lock_id: &str,
    ) -> Result<(), StateError> {
        self.write(&entity.key(), state, lock_id).await
    }

    async fn delete(&self, entity: &EntityRef, lock_id: &str) -> Result<(), StateError> {
        self.remove(&entity.key(), lock_id).await
    }

    async fn list(
        &self,
        env: &EnvironmentRef,
        kind: EntityKind,
    ) -> Result<BTreeMap<String, PersistedState>, StateError> {
        let prefix = format!("{}/{}/{}/", STATE_PREFIX, env.key(), kind.collection());
        let mut found = BTreeMap::new();
        for key in self.store.list(&prefix).await? {
            let Some(name) = key
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".json"))
            else {
                continue;
            };
            if name.contains('/') {
                continue;
            }
            if let Some(state) = self.load(&env.entity(kind, name)).await? {
                found.insert(name.to_string(), state);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl<O: ObjectStore> LockProvider for ObjectBackend<O> {
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
        let data = serde_json::to_vec(&lock.info())?;

        match self
            .store
            .put(&Self::lock_key(&key), data, Precondition::IfAbsent)
            .await
        {
            Ok(_) => {
                tracing::debug!("Acquired lock object for {}", key);
                Ok(lock)
            }
            Err(ObjectStoreError::PreconditionFailed(_)) => {
                let holder = match self.current_lock(&key).await? {
                    Some((info, _)) => info.describe(),
                    None => "unknown".to_string(),
                };
                Err(LockError::AlreadyLocked { path: key, holder })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, lock: &Lock, reason: ReleaseReason) -> Result<(), LockError> {
        let key = lock.path.key();
        let Some((info, generation)) = self.current_lock(&key).await? else {
            tracing::debug!("Lock object for {} already gone", key);
            return Ok(());
        };
        if info.lock_id != lock.lock_id {
            return Err(LockError::NotHeld {
                path: key,
                lock_id: lock.lock_id.clone(),
            });
        }

        match self
            .store
            .delete(
                &Self::lock_key(&key),
                Precondition::IfGenerationMatch(generation),
            )
            .await
        {
            Ok(_) => {
                tracing::debug!("Released lock object for {} ({})", key, reason);
                Ok(())
            }
            Err(ObjectStoreError::PreconditionFailed(_)) => Err(LockError::NotHeld {
                path: key,
                lock_id: lock.lock_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn force_release(&self, path: &StatePath) -> Result<ForceRelease, LockError> {
        let removed = self
            .store
            .delete(&Self::lock_key(&path.key()), Precondition::None)
            .await?;
        if removed {
            tracing::warn!("Force-released lock on {}", path);
            Ok(ForceRelease::Released)
        } else {
            Ok(ForceRelease::NotFound)
        }
    }
}
