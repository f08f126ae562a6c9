//! In-process stores. The remote one can be switched offline and given a
//! latency, which is how other devices and flaky networks are simulated.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::backend::{LocalStore, RemoteStore};
use crate::core::entity::Entity;
use crate::core::record::{EntityKey, EntityType, Syncable};
use crate::error::StoreError;

type Records = BTreeMap<EntityKey, Entity>;

fn lock(records: &Mutex<Records>) -> MutexGuard<'_, Records> {
    records.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    records: Mutex<Records>,
    failing: AtomicBool,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, as a full disk or revoked storage quota would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("local storage disabled".into()));
        }
        Ok(())
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>, StoreError> {
        self.check()?;
        Ok(lock(&self.records).get(&EntityKey::new(entity_type, id)).cloned())
    }

    fn put(&self, record: &Entity) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.records).insert(record.key(), record.clone());
        Ok(())
    }

    fn delete(&self, entity_type: EntityType, id: &str) -> Result<(), StoreError> {
        self.check()?;
        lock(&self.records).remove(&EntityKey::new(entity_type, id));
        Ok(())
    }

    fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>, StoreError> {
        self.check()?;
        Ok(lock(&self.records)
            .iter()
            .filter(|(k, _)| k.entity_type == entity_type)
            .map(|(_, v)| v.clone())
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    records: Mutex<Records>,
    offline: AtomicBool,
    latency: Mutex<Option<Duration>>,
    upserts: AtomicUsize,
    deletes: AtomicUsize,
    in_flight: Mutex<HashMap<EntityKey, usize>>,
    peak_in_flight: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every call fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Write as another device would, bypassing counters.
    pub fn put_raw(&self, record: Entity) {
        lock(&self.records).insert(record.key(), record);
    }

    pub fn record(&self, key: &EntityKey) -> Option<Entity> {
        lock(&self.records).get(key).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful upserts so far.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Most upserts ever outstanding at once for a single record.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn begin_upsert(&self, key: &EntityKey) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let count = in_flight.entry(key.clone()).or_default();
        *count += 1;
        self.peak_in_flight.fetch_max(*count, Ordering::SeqCst);
    }

    fn end_upsert(&self, key: &EntityKey) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = in_flight.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(key);
            }
        }
    }

    fn latency(&self) -> Option<Duration> {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn round_trip(&self, latency: Option<Duration>) -> Result<(), StoreError> {
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("remote unreachable".into()));
        }
        Ok(())
    }
}

impl RemoteStore for MemoryRemoteStore {
    fn upsert(&self, record: &Entity) -> impl Future<Output = Result<DateTime<Utc>, StoreError>> + Send {
        let mut record = record.clone();
        let latency = self.latency();
        async move {
            let key = record.key();
            self.begin_upsert(&key);
            let reached = self.round_trip(latency).await;
            self.end_upsert(&key);
            reached?;
            let updated_at = record.updated_at().unwrap_or_else(Utc::now);
            record.set_updated_at(updated_at);
            lock(&self.records).insert(record.key(), record);
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Ok(updated_at)
        }
    }

    fn delete(&self, entity_type: EntityType, id: &str) -> impl Future<Output = Result<(), StoreError>> + Send {
        let key = EntityKey::new(entity_type, id);
        let latency = self.latency();
        async move {
            self.round_trip(latency).await?;
            lock(&self.records).remove(&key);
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fetch_all(&self, entity_type: EntityType) -> impl Future<Output = Result<Vec<Entity>, StoreError>> + Send {
        let latency = self.latency();
        async move {
            self.round_trip(latency).await?;
            Ok(lock(&self.records)
                .iter()
                .filter(|(k, _)| k.entity_type == entity_type)
                .map(|(_, v)| v.clone())
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::goal::Goal;

    #[test]
    fn local_store_round_trip() {
        let store = MemoryLocalStore::new();
        let goal = Goal::vision("Travel", 2025);
        store.put(&goal.clone().into()).unwrap();
        assert_eq!(
            store.get(EntityType::Goal, &goal.id).unwrap(),
            Some(Entity::Goal(goal.clone()))
        );
        assert_eq!(store.list(EntityType::Goal).unwrap().len(), 1);
        store.delete(EntityType::Goal, &goal.id).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn failing_local_store_errors() {
        let store = MemoryLocalStore::new();
        store.set_failing(true);
        assert!(matches!(
            store.put(&Goal::vision("x", 2025).into()),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn remote_upsert_echoes_timestamp() {
        let remote = MemoryRemoteStore::new();
        let goal = Goal::vision("Garden", 2025);
        let at = remote.upsert(&goal.clone().into()).await.unwrap();
        assert_eq!(Some(at), goal.updated_at);
        assert_eq!(remote.upsert_count(), 1);
        assert_eq!(remote.fetch_all(EntityType::Goal).await.unwrap().len(), 1);
        assert!(remote.fetch_all(EntityType::Event).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_upserts_are_counted_per_record() {
        let remote = MemoryRemoteStore::new();
        remote.set_latency(Some(Duration::from_millis(100)));
        let goal: Entity = Goal::vision("Twice", 2025).into();
        let other: Entity = Goal::vision("Once", 2025).into();

        let (a, b, c) = tokio::join!(remote.upsert(&goal), remote.upsert(&goal), remote.upsert(&other));
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(remote.peak_in_flight(), 2);
        assert_eq!(remote.upsert_count(), 3);
    }

    #[tokio::test]
    async fn offline_remote_fails() {
        let remote = MemoryRemoteStore::new();
        remote.set_offline(true);
        assert!(remote.upsert(&Goal::vision("x", 2025).into()).await.is_err());
        assert_eq!(remote.upsert_count(), 0);
        assert!(remote.is_empty());
    }
}
