//! StateStore and LockProvider implementations

mod local;
mod memory;
mod object;
mod remote;

pub use local::LocalBackend;
pub use memory::{LockEvent, MemoryBackend};
pub use object::{
    MemoryObjectStore, ObjectBackend, ObjectStore, ObjectStoreError, Precondition, StoredObject,
};
pub use remote::{LOCK_ID_HEADER, RemoteBackend};
