//! The two stores the sync core talks to. Both are caches of the session's
//! entity store and may lag behind it.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;

use crate::core::entity::Entity;
use crate::core::record::EntityType;
use crate::error::StoreError;

/// Durable on-device storage used for offline work and crash recovery.
/// Writes are best effort from the session's point of view: failures are
/// logged and never undo the in-memory change.
pub trait LocalStore: Send + Sync + 'static {
    fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>, StoreError>;

    fn put(&self, record: &Entity) -> Result<(), StoreError>;

    fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), StoreError>;

    fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>, StoreError>;
}

/// The multi-device backend. `upsert` is keyed by `(type, id)`, so pushing
/// the same record twice is harmless.
pub trait RemoteStore: Send + Sync + 'static {
    /// Store the record and return the `updatedAt` the backend kept.
    fn upsert(&self, record: &Entity) -> impl Future<Output = Result<DateTime<Utc>, StoreError>> + Send;

    fn delete(&self, entity_type: EntityType, id: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn fetch_all(&self, entity_type: EntityType) -> impl Future<Output = Result<Vec<Entity>, StoreError>> + Send;
}

// Shared handles, so several sessions (devices) can talk to one backend.
impl<T: LocalStore> LocalStore for Arc<T> {
    fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>, StoreError> {
        (**self).get(entity_type, id)
    }

    fn put(&self, record: &Entity) -> Result<(), StoreError> {
        (**self).put(record)
    }

    fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), StoreError> {
        (**self).delete(entity_type, id)
    }

    fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>, StoreError> {
        (**self).list(entity_type)
    }
}

impl<T: RemoteStore> RemoteStore for Arc<T> {
    fn upsert(&self, record: &Entity) -> impl Future<Output = Result<DateTime<Utc>, StoreError>> + Send {
        (**self).upsert(record)
    }

    fn delete(&self, entity_type: EntityType, id: &str) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).delete(entity_type, id)
    }

    fn fetch_all(&self, entity_type: EntityType) -> impl Future<Output = Result<Vec<Entity>, StoreError>> + Send {
        (**self).fetch_all(entity_type)
    }
}
