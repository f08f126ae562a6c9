//! Pull-side planning: compare what the remote returned for one entity type
//! with the local store and decide, per record, which side wins.
//!
//! Planning is pure so it can run under the session lock; the session then
//! applies the steps and reports conflicts outside of it.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use super::conflict::ConflictDetector;
use crate::core::entity::Entity;
use crate::core::record::{EntityKey, EntityType, Syncable};
use crate::core::store::EntityStore;

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Only the remote has it.
    Insert(Entity),
    /// Same record, but the local copy carries no timestamp or is an
    /// unsaved copy the remote refreshed within the skew tolerance.
    Replace(Entity),
    /// Remote is newer beyond the tolerance: a conflict, remote wins.
    TakeRemote {
        remote: Entity,
        local_updated_at: Option<DateTime<Utc>>,
        title: Option<String>,
    },
    /// Local is newer or missing remotely; push it.
    PushLocal(EntityKey),
    Unchanged(EntityKey),
}

impl Step {
    pub fn key(&self) -> EntityKey {
        match self {
            Self::Insert(e) | Self::Replace(e) => e.key(),
            Self::TakeRemote { remote, .. } => remote.key(),
            Self::PushLocal(key) | Self::Unchanged(key) => key.clone(),
        }
    }
}

/// Counts per step kind, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub conflicts: usize,
    pub to_push: usize,
    pub unchanged: usize,
}

impl PlanSummary {
    pub fn of(steps: &[Step]) -> Self {
        let mut summary = Self::default();
        for step in steps {
            match step {
                Step::Insert(_) => summary.inserted += 1,
                Step::Replace(_) => summary.replaced += 1,
                Step::TakeRemote { .. } => summary.conflicts += 1,
                Step::PushLocal(_) => summary.to_push += 1,
                Step::Unchanged(_) => summary.unchanged += 1,
            }
        }
        summary
    }

    pub fn pulled(&self) -> usize {
        self.inserted + self.replaced + self.conflicts
    }
}

/// Decide what to do with every record of `entity_type` present on either
/// side. `is_dirty` reports records with unsaved local edits.
pub fn plan(
    entity_type: EntityType,
    store: &EntityStore,
    remote: Vec<Entity>,
    detector: &ConflictDetector,
    is_dirty: impl Fn(&EntityKey) -> bool,
) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut seen: BTreeSet<EntityKey> = BTreeSet::new();

    for remote_record in remote {
        if remote_record.entity_type() != entity_type {
            log::warn!(
                "Ignoring {} returned while fetching {}",
                remote_record.key(),
                entity_type
            );
            continue;
        }
        let key = remote_record.key();
        if !seen.insert(key.clone()) {
            continue;
        }

        let Some(local) = store.get(&key) else {
            steps.push(Step::Insert(remote_record));
            continue;
        };

        let local_at = local.updated_at();
        let remote_at = remote_record.updated_at();
        let step = match (local_at, remote_at) {
            (None, _) => Step::Replace(remote_record),
            (Some(_), None) => Step::PushLocal(key),
            (Some(l), Some(r)) => {
                if detector.has_conflict(local_at, remote_at) {
                    Step::TakeRemote {
                        title: local.title().map(str::to_string),
                        local_updated_at: local_at,
                        remote: remote_record,
                    }
                } else if l - r > detector.tolerance() {
                    Step::PushLocal(key)
                } else if is_dirty(&key) {
                    // Within tolerance: the pending local write goes out as is.
                    Step::PushLocal(key)
                } else if r > l && remote_record != *local {
                    Step::Replace(remote_record)
                } else {
                    Step::Unchanged(key)
                }
            }
        };
        steps.push(step);
    }

    for key in store.keys(entity_type) {
        if !seen.contains(&key) {
            steps.push(Step::PushLocal(key));
        }
    }
    steps
}
