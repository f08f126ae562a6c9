use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex as WriteLock;

use crate::core::record::EntityKey;

/// A write that could not be sent yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedWrite {
    Upsert(EntityKey),
    Delete(EntityKey),
}

impl QueuedWrite {
    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Upsert(key) | Self::Delete(key) => key,
        }
    }
}

/// Outbound writes waiting for connectivity, plus the per-record locks that
/// keep at most one remote write in flight per id.
#[derive(Debug, Default)]
pub struct SyncQueue {
    buffered: VecDeque<QueuedWrite>,
    locks: HashMap<EntityKey, Arc<WriteLock<()>>>,
}

impl SyncQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a write, keeping at most one entry per key. A delete replaces
    /// a pending upsert; an upsert after a pending delete replaces it too
    /// (the record was re-created under the same id).
    pub fn buffer(&mut self, write: QueuedWrite) -> bool {
        if self.buffered.contains(&write) {
            return false;
        }
        self.buffered.retain(|w| w.key() != write.key());
        log::debug!("Buffered {:?}", write);
        self.buffered.push_back(write);
        true
    }

    /// Remove a pending upsert, e.g. because the record was deleted while
    /// offline and the delete is queued separately.
    pub fn discard(&mut self, key: &EntityKey) {
        self.buffered.retain(|w| w.key() != key);
    }

    /// Take everything buffered, oldest first.
    pub fn drain(&mut self) -> Vec<QueuedWrite> {
        self.buffered.drain(..).collect()
    }

    pub fn buffered(&self) -> impl Iterator<Item = &QueuedWrite> {
        self.buffered.iter()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.buffered.iter().any(|w| w.key() == key)
    }

    /// The record was deleted locally and the remote has not heard yet.
    pub fn has_pending_delete(&self, key: &EntityKey) -> bool {
        self.buffered
            .iter()
            .any(|w| matches!(w, QueuedWrite::Delete(k) if k == key))
    }

    pub fn len(&self) -> usize {
        self.buffered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffered.is_empty()
    }

    /// The lock a remote write for `key` must hold for its whole duration.
    pub fn write_lock(&mut self, key: &EntityKey) -> Arc<WriteLock<()>> {
        self.locks.entry(key.clone()).or_default().clone()
    }

    pub fn is_in_flight(&self, key: &EntityKey) -> bool {
        self.locks.get(key).is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Drop the lock entry once nobody else holds or waits on it.
    pub fn release(&mut self, key: &EntityKey) {
        if self
            .locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            self.locks.remove(key);
        }
    }

    /// Discard everything, as on logout.
    pub fn clear(&mut self) {
        self.buffered.clear();
        self.locks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::EntityType;

    #[test]
    fn buffer_dedupes_per_key() {
        let mut queue = SyncQueue::new();
        let a = EntityKey::goal("a");
        let b = EntityKey::new(EntityType::Event, "b");

        assert!(queue.buffer(QueuedWrite::Upsert(a.clone())));
        assert!(!queue.buffer(QueuedWrite::Upsert(a.clone())));
        assert!(queue.buffer(QueuedWrite::Upsert(b.clone())));
        assert!(queue.buffer(QueuedWrite::Delete(a.clone())));
        assert!(queue.has_pending_delete(&a));
        assert!(!queue.has_pending_delete(&b));

        assert_eq!(
            queue.drain(),
            vec![QueuedWrite::Upsert(b), QueuedWrite::Delete(a)]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn discard_drops_pending_writes() {
        let mut queue = SyncQueue::new();
        let a = EntityKey::goal("a");
        queue.buffer(QueuedWrite::Upsert(a.clone()));
        assert!(queue.contains(&a));
        queue.discard(&a);
        assert!(!queue.contains(&a));
    }

    #[tokio::test]
    async fn write_lock_marks_in_flight() {
        let mut queue = SyncQueue::new();
        let key = EntityKey::goal("g");
        let lock = queue.write_lock(&key);
        assert!(!queue.is_in_flight(&key));

        let guard = lock.clone().lock_owned().await;
        assert!(queue.is_in_flight(&key));
        drop(guard);
        assert!(!queue.is_in_flight(&key));

        queue.release(&key);
        assert!(queue.locks.contains_key(&key));
        drop(lock);
        queue.release(&key);
        assert!(!queue.locks.contains_key(&key));
    }
}
