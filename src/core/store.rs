use std::collections::{BTreeMap, HashMap};

use super::entity::Entity;
use super::goal::Goal;
use super::hierarchy::GoalIndex;
use super::record::{EntityKey, EntityType, Syncable};

/// In-memory state for one session. Everything the UI reads comes from
/// here; the local and remote stores may lag behind it.
#[derive(Debug, Default, Clone)]
pub struct EntityStore {
    records: HashMap<EntityType, BTreeMap<String, Entity>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&Entity> {
        self.records.get(&key.entity_type)?.get(&key.id)
    }

    pub fn get_mut(&mut self, key: &EntityKey) -> Option<&mut Entity> {
        self.records.get_mut(&key.entity_type)?.get_mut(&key.id)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace; returns the previous record.
    pub fn insert(&mut self, entity: Entity) -> Option<Entity> {
        self.records
            .entry(entity.entity_type())
            .or_default()
            .insert(entity.id().to_string(), entity)
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<Entity> {
        self.records.get_mut(&key.entity_type)?.remove(&key.id)
    }

    /// Records of one type, ordered by id.
    pub fn list(&self, entity_type: EntityType) -> Vec<&Entity> {
        self.records
            .get(&entity_type)
            .map(|m| m.values().collect())
            .unwrap_or_default()
    }

    pub fn keys(&self, entity_type: EntityType) -> Vec<EntityKey> {
        self.records
            .get(&entity_type)
            .map(|m| m.keys().map(|id| EntityKey::new(entity_type, id.clone())).collect())
            .unwrap_or_default()
    }

    pub fn get_goal(&self, id: &str) -> Option<&Goal> {
        self.records.get(&EntityType::Goal)?.get(id)?.as_goal()
    }

    pub fn get_goal_mut(&mut self, id: &str) -> Option<&mut Goal> {
        self.records
            .get_mut(&EntityType::Goal)?
            .get_mut(id)?
            .as_goal_mut()
    }

    pub fn len(&self) -> usize {
        self.records.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl GoalIndex for EntityStore {
    fn goal(&self, id: &str) -> Option<&Goal> {
        self.get_goal(id)
    }

    fn goals(&self) -> Vec<&Goal> {
        self.records
            .get(&EntityType::Goal)
            .map(|m| m.values().filter_map(Entity::as_goal).collect())
            .unwrap_or_default()
    }

    fn goal_count(&self) -> usize {
        self.records.get(&EntityType::Goal).map_or(0, |m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::{AggregateState, BrainDumpItem};

    #[test]
    fn insert_get_remove() {
        let mut store = EntityStore::new();
        let goal = Goal::vision("Learn piano", 2025);
        let key = goal.key();

        assert!(store.insert(goal.clone().into()).is_none());
        assert_eq!(store.get_goal(&goal.id).map(|g| g.title.as_str()), Some("Learn piano"));
        assert!(store.contains(&key));
        assert_eq!(store.goal_count(), 1);

        assert!(store.remove(&key).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn types_are_partitioned() {
        let mut store = EntityStore::new();
        store.insert(BrainDumpItem::new("idea").into());
        store.insert(Entity::Preferences(AggregateState::new(serde_json::json!({}))));
        store.insert(Entity::Streak(AggregateState::new(serde_json::json!({}))));

        assert_eq!(store.len(), 3);
        assert_eq!(store.list(EntityType::BrainDump).len(), 1);
        assert_eq!(store.keys(EntityType::Streak), vec![EntityKey::new(EntityType::Streak, "default")]);
        assert!(store.goals().is_empty());
    }
}
