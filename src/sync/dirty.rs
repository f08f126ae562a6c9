use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::record::{EntityKey, EntityType};

/// Snapshot of how much is waiting to be pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyStats {
    pub entities: BTreeMap<EntityType, usize>,
    pub total_dirty: usize,
}

/// When a record was last saved. The wall time is for display; the save
/// gate runs on Tokio's clock, same as the timers that consult it.
#[derive(Debug, Clone, Copy)]
struct SaveStamp {
    at: DateTime<Utc>,
    instant: Instant,
}

/// Which records still need a remote write, and when each was last saved.
///
/// Not persisted: a fresh session starts clean and the reconciliation pass
/// re-derives dirtiness from `updatedAt` comparisons.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    dirty: HashMap<EntityType, BTreeSet<String>>,
    last_save: HashMap<EntityKey, SaveStamp>,
}

impl DirtyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&mut self, entity_type: EntityType, id: &str) {
        let newly = self.dirty.entry(entity_type).or_default().insert(id.to_string());
        if newly {
            log::debug!("Marked dirty: {}:{}", entity_type, id);
        }
    }

    /// Clear the flag and stamp the save time.
    pub fn mark_clean(&mut self, entity_type: EntityType, id: &str) {
        if let Some(ids) = self.dirty.get_mut(&entity_type) {
            ids.remove(id);
            if ids.is_empty() {
                self.dirty.remove(&entity_type);
            }
        }
        self.last_save.insert(
            EntityKey::new(entity_type, id),
            SaveStamp {
                at: Utc::now(),
                instant: Instant::now(),
            },
        );
    }

    pub fn is_dirty(&self, entity_type: EntityType, id: &str) -> bool {
        self.dirty
            .get(&entity_type)
            .is_some_and(|ids| ids.contains(id))
    }

    /// Dirty ids of one type, sorted.
    pub fn get_dirty(&self, entity_type: EntityType) -> Vec<String> {
        self.dirty
            .get(&entity_type)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_dirty(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .dirty
            .iter()
            .flat_map(|(t, ids)| ids.iter().map(|id| EntityKey::new(*t, id.clone())))
            .collect();
        keys.sort();
        keys
    }

    pub fn last_save(&self, entity_type: EntityType, id: &str) -> Option<DateTime<Utc>> {
        self.last_save
            .get(&EntityKey::new(entity_type, id))
            .map(|stamp| stamp.at)
    }

    fn saved_instant(&self, entity_type: EntityType, id: &str) -> Option<Instant> {
        self.last_save
            .get(&EntityKey::new(entity_type, id))
            .map(|stamp| stamp.instant)
    }

    /// Dirty ids that were never saved, or saved at least `min_interval` ago.
    pub fn items_needing_save(&self, entity_type: EntityType, min_interval: Duration) -> Vec<String> {
        self.items_needing_save_at(entity_type, min_interval, Instant::now())
    }

    pub fn items_needing_save_at(&self, entity_type: EntityType, min_interval: Duration, now: Instant) -> Vec<String> {
        self.get_dirty(entity_type)
            .into_iter()
            .filter(|id| match self.saved_instant(entity_type, id) {
                None => true,
                Some(saved) => now.saturating_duration_since(saved) >= min_interval,
            })
            .collect()
    }

    /// How long until the first gated dirty id becomes eligible again.
    /// `None` when nothing dirty is being held back; ids that are already
    /// eligible do not count.
    pub fn next_save_due(&self, entity_type: EntityType, min_interval: Duration) -> Option<Duration> {
        let now = Instant::now();
        self.get_dirty(entity_type)
            .iter()
            .filter_map(|id| self.saved_instant(entity_type, id))
            .filter_map(|saved| saved.checked_add(min_interval))
            .map(|due| due.saturating_duration_since(now))
            .filter(|wait| !wait.is_zero())
            .min()
    }

    pub fn stats(&self) -> DirtyStats {
        let entities: BTreeMap<EntityType, usize> = self
            .dirty
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(t, ids)| (*t, ids.len()))
            .collect();
        let total_dirty = entities.values().sum();
        DirtyStats {
            entities,
            total_dirty,
        }
    }

    /// Drop every trace of a record, including its save stamp.
    pub fn forget(&mut self, entity_type: EntityType, id: &str) {
        if let Some(ids) = self.dirty.get_mut(&entity_type) {
            ids.remove(id);
        }
        self.last_save.remove(&EntityKey::new(entity_type, id));
    }

    pub fn clear_entity(&mut self, entity_type: EntityType) {
        self.dirty.remove(&entity_type);
        self.last_save.retain(|k, _| k.entity_type != entity_type);
    }

    pub fn clear_all(&mut self) {
        self.dirty.clear();
        self.last_save.clear();
    }
}
