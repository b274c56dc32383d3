//! Filesystem backend
//!
//! Records live at `<root>/<key>.json`, locks at `<root>/<key>.lock`.
//! A lock is written to a private temp file and hard-linked onto the lock
//! path, so acquisition is atomic per entity and readers never see a
//! partially written lock.
//!
//! Replacing a stale lock is serialized through `<key>.lock.takeover`,
//! created with `create_new`. A guard left behind by a crashed process is
//! cleared by `force_release`.

use crate::entity::{EntityKind, EntityRef, EnvironmentRef, StatePath};
use crate::error::{LockError, StateError};
use crate::lock::{ForceRelease, Lock, LockInfo, LockOperation, LockProvider, ReleaseReason};
use crate::state::{EnvironmentState, PersistedState, StateStore, check_version};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

const STATE_EXT: &str = "json";
const LOCK_EXT: &str = "lock";
const BACKUP_EXT: &str = "json.backup";
const TAKEOVER_EXT: &str = "lock.takeover";

pub struct LocalBackend {
    root: PathBuf,
    /// Locks older than this are removed on acquire
    stale_after: Option<Duration>,
}

impl LocalBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            stale_after: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_for(&self, key: &str, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{}", key, ext))
    }

    fn lock_path(&self, path: &StatePath) -> PathBuf {
        self.file_for(&path.key(), LOCK_EXT)
    }

    async fn read_record<T: DeserializeOwned>(
        &self,
        key: &str,
        version_of: impl Fn(&T) -> u32,
    ) -> Result<Option<T>, StateError> {
        let path = self.file_for(key, STATE_EXT);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: T = serde_json::from_str(&content)?;
        check_version(key, version_of(&record))?;
        tracing::debug!("Loaded {}", path.display());
        Ok(Some(record))
    }

    async fn write_record<T: Serialize>(&self, key: &str, record: &T) -> Result<(), StateError> {
        let path = self.file_for(key, STATE_EXT);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }

        if fs::try_exists(&path).await? {
            fs::copy(&path, self.file_for(key, BACKUP_EXT)).await?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(record)?).await?;
        fs::rename(&tmp, &path).await?;

        tracing::debug!("Saved {}", path.display());
        Ok(())
    }

    async fn remove_record(&self, key: &str) -> Result<(), StateError> {
        for ext in [STATE_EXT, BACKUP_EXT] {
            match fs::remove_file(self.file_for(key, ext)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        tracing::debug!("Deleted {}", key);
        Ok(())
    }

    async fn read_lock(&self, path: &Path) -> Result<Option<LockInfo>, LockError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Publish `lock` at `path` unless a lock is already there
    async fn create_lock_file(&self, path: &Path, lock: &Lock) -> Result<bool, LockError> {
        let tmp = self.write_temp_lock(path, lock).await?;
        let linked = fs::hard_link(&tmp, path).await;
        remove_temp(&tmp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_temp_lock(&self, path: &Path, lock: &Lock) -> Result<PathBuf, LockError> {
        let tmp = path.with_extension(format!("{}.{}.tmp", LOCK_EXT, uuid::Uuid::new_v4()));
        let content = serde_json::to_string_pretty(&lock.info())?;
        if let Err(e) = fs::write(&tmp, content).await {
            remove_temp(&tmp).await;
            return Err(e.into());
        }
        Ok(tmp)
    }

    /// Replace a stale lock while holding the takeover guard
    async fn take_over(
        &self,
        path: &StatePath,
        lock_path: &Path,
        stale: &LockInfo,
        lock: Lock,
    ) -> Result<Lock, LockError> {
        let guard = self.file_for(&path.key(), TAKEOVER_EXT);
        let created = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&guard)
            .await;
        match created {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(already_locked(path, stale.describe()));
            }
            Err(e) => return Err(e.into()),
        }

        let outcome = self.replace_stale(path, lock_path, stale, lock).await;
        if let Err(e) = fs::remove_file(&guard).await {
            tracing::warn!("Failed to remove takeover guard {}: {}", guard.display(), e);
        }
        outcome
    }

    async fn replace_stale(
        &self,
        path: &StatePath,
        lock_path: &Path,
        stale: &LockInfo,
        lock: Lock,
    ) -> Result<Lock, LockError> {
        let current = match self.read_lock(lock_path).await {
            Ok(current) => current,
            Err(LockError::Json(_)) => return Err(already_locked(path, UNKNOWN_HOLDER)),
            Err(e) => return Err(e),
        };

        match current {
            None => {
                if self.create_lock_file(lock_path, &lock).await? {
                    return Ok(lock);
                }
                Err(already_locked(path, UNKNOWN_HOLDER))
            }
            // Someone else already replaced it, or it was refreshed
            Some(info) if info.lock_id != stale.lock_id || !self.is_stale(&info) => {
                Err(already_locked(path, info.describe()))
            }
            Some(info) => {
                tracing::warn!(
                    "Replacing stale lock on {} held by {}",
                    path,
                    info.describe()
                );
                // rename keeps the lock path occupied throughout
                let tmp = self.write_temp_lock(lock_path, &lock).await?;
                if let Err(e) = fs::rename(&tmp, lock_path).await {
                    remove_temp(&tmp).await;
                    return Err(e.into());
                }
                Ok(lock)
            }
        }
    }

    fn is_stale(&self, info: &LockInfo) -> bool {
        let Some(stale_after) = self.stale_after else {
            return false;
        };
        let age = Utc::now().signed_duration_since(info.acquired_at);
        age.to_std().is_ok_and(|age| age >= stale_after)
    }
}

#[async_trait]
impl StateStore for LocalBackend {
    async fn load_environment(
        &self,
        env: &EnvironmentRef,
    ) -> Result<Option<EnvironmentState>, StateError> {
        self.read_record(&env.key(), |s: &EnvironmentState| s.version)
            .await
    }

    async fn save_environment(
        &self,
        env: &EnvironmentRef,
        state: &EnvironmentState,
        _lock_id: &str,
    ) -> Result<(), StateError> {
        self.write_record(&env.key(), state).await
    }

    async fn delete_environment(
        &self,
        env: &EnvironmentRef,
        _lock_id: &str,
    ) -> Result<(), StateError> {
        self.remove_record(&env.key()).await
    }

    async fn load(&self, entity: &EntityRef) -> Result<Option<PersistedState>, StateError> {
        self.read_record(&entity.key(), |s: &PersistedState| s.version)
            .await
    }

    async fn save(
        &self,
        entity: &EntityRef,
        state: &PersistedState,
        _lock_id: &str,
    ) -> Result<(), StateError> {
        self.write_record(&entity.key(), state).await
    }

    async fn delete(&self, entity: &EntityRef, _lock_id: &str) -> Result<(), StateError> {
        self.remove_record(&entity.key()).await
    }

    async fn list(
        &self,
        env: &EnvironmentRef,
        kind: EntityKind,
    ) -> Result<BTreeMap<String, PersistedState>, StateError> {
        let dir = self.root.join(env.key()).join(kind.collection());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(STATE_EXT) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(state) = self.load(&env.entity(kind, name)).await? {
                found.insert(name.to_string(), state);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl LockProvider for LocalBackend {
    async fn acquire(
        &self,
        path: &StatePath,
        operation: LockOperation,
        metadata: &str,
    ) -> Result<Lock, LockError> {
        let lock_path = self.lock_path(path);
        if let Some(dir) = lock_path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let lock = Lock::new(path.clone(), operation, metadata);
        if self.create_lock_file(&lock_path, &lock).await? {
            tracing::debug!("Acquired lock {}", lock_path.display());
            return Ok(lock);
        }

        let info = match self.read_lock(&lock_path).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                // Released between our attempt and the read
                if self.create_lock_file(&lock_path, &lock).await? {
                    return Ok(lock);
                }
                return Err(already_locked(path, UNKNOWN_HOLDER));
            }
            Err(LockError::Json(e)) => {
                tracing::warn!("Unreadable lock file {}: {}", lock_path.display(), e);
                return Err(already_locked(path, UNKNOWN_HOLDER));
            }
            Err(e) => return Err(e),
        };

        if self.is_stale(&info) {
            return self.take_over(path, &lock_path, &info, lock).await;
        }

        Err(already_locked(path, info.describe()))
    }

    async fn release(&self, lock: &Lock, reason: ReleaseReason) -> Result<(), LockError> {
        let lock_path = self.lock_path(&lock.path);
        let Some(info) = self.read_lock(&lock_path).await? else {
            tracing::debug!("Lock file {} already gone", lock_path.display());
            return Ok(());
        };
        if info.lock_id != lock.lock_id {
            return Err(LockError::NotHeld {
                path: lock.path.key(),
                lock_id: lock.lock_id.clone(),
            });
        }

        match fs::remove_file(&lock_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::debug!("Released lock {} ({})", lock_path.display(), reason);
        Ok(())
    }

    async fn force_release(&self, path: &StatePath) -> Result<ForceRelease, LockError> {
        match fs::remove_file(self.file_for(&path.key(), TAKEOVER_EXT)).await {
            Ok(()) => tracing::warn!("Removed takeover guard on {}", path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(self.lock_path(path)).await {
            Ok(()) => {
                tracing::warn!("Force-released lock on {}", path);
                Ok(ForceRelease::Released)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ForceRelease::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

const UNKNOWN_HOLDER: &str = "unknown";

fn already_locked(path: &StatePath, holder: impl Into<String>) -> LockError {
    LockError::AlreadyLocked {
        path: path.key(),
        holder: holder.into(),
    }
}

async fn remove_temp(tmp: &Path) {
    match fs::remove_file(tmp).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", tmp.display(), e),
    }
}
