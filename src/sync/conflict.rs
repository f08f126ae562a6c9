//! Timestamp-based conflict detection with a bounded, observable history.
//!
//! Detection is asymmetric: only a remote write that is newer than the
//! local one by more than the clock-skew tolerance counts. A local write
//! that is ahead simply gets pushed, so `LocalWins` records are only ever
//! produced by callers that build them explicitly.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::config::SyncConfig;
use crate::core::record::EntityType;

pub const DEFAULT_TOLERANCE_MS: i64 = 1000;
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    RemoteWins,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_title: Option<String>,
    pub local_updated_at: DateTime<Utc>,
    pub remote_updated_at: DateTime<Utc>,
    pub resolution: Resolution,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn message(&self) -> String {
        format_conflict_message(self)
    }
}

/// One-sentence description suitable for a toast.
pub fn format_conflict_message(record: &ConflictRecord) -> String {
    let name = record
        .entity_title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(&record.entity_id);
    match record.resolution {
        Resolution::RemoteWins => format!(
            "\"{}\" was updated on another device. Your local change was overwritten.",
            name
        ),
        Resolution::LocalWins => format!("\"{}\" was synced. Your version was kept.", name),
    }
}

type Callback = Arc<dyn Fn(&ConflictRecord) + Send + Sync>;

struct Listener {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

#[derive(Default)]
struct DetectorState {
    history: VecDeque<ConflictRecord>,
    listeners: Vec<Listener>,
    next_listener: u64,
}

/// Handle returned by [`ConflictDetector::on_conflict`].
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<Mutex<DetectorState>>,
}

impl Subscription {
    /// Stop delivery. Takes effect before the next notification, including
    /// one already being dispatched on this thread.
    pub fn unsubscribe(self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .listeners
                .retain(|l| l.id != self.id);
        }
    }
}

pub struct ConflictDetector {
    tolerance: TimeDelta,
    capacity: usize,
    state: Arc<Mutex<DetectorState>>,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(
            TimeDelta::milliseconds(DEFAULT_TOLERANCE_MS),
            DEFAULT_HISTORY_CAPACITY,
        )
    }
}

impl ConflictDetector {
    pub fn new(tolerance: TimeDelta, capacity: usize) -> Self {
        Self {
            tolerance,
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(DetectorState::default())),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.clock_skew_tolerance(),
            config.conflict_history_capacity,
        )
    }

    fn state(&self) -> MutexGuard<'_, DetectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn tolerance(&self) -> TimeDelta {
        self.tolerance
    }

    /// True only when `remote` is newer than `local` by more than the
    /// tolerance. Missing timestamps never conflict.
    pub fn has_conflict(&self, local: Option<DateTime<Utc>>, remote: Option<DateTime<Utc>>) -> bool {
        match (local, remote) {
            (Some(local), Some(remote)) => remote - local > self.tolerance,
            _ => false,
        }
    }

    /// Record and broadcast a remote-wins conflict, or return `None` without
    /// side effects when there is none.
    pub fn detect_conflict(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        local: Option<DateTime<Utc>>,
        remote: Option<DateTime<Utc>>,
        title: Option<&str>,
    ) -> Option<ConflictRecord> {
        if !self.has_conflict(local, remote) {
            return None;
        }
        let record = ConflictRecord {
            entity_type,
            entity_id: entity_id.to_string(),
            entity_title: title.map(str::to_string),
            local_updated_at: local?,
            remote_updated_at: remote?,
            resolution: Resolution::RemoteWins,
            detected_at: Utc::now(),
        };
        log::info!(
            "Conflict on {}:{} (local {}, remote {}), remote wins",
            entity_type,
            entity_id,
            record.local_updated_at.to_rfc3339(),
            record.remote_updated_at.to_rfc3339()
        );
        self.record(record.clone());
        Some(record)
    }

    /// Append to the history and notify listeners. Callbacks run after the
    /// internal lock is released, so they may call back into the detector.
    pub fn record(&self, record: ConflictRecord) {
        let listeners: Vec<(Arc<AtomicBool>, Callback)> = {
            let mut state = self.state();
            while state.history.len() >= self.capacity {
                state.history.pop_front();
            }
            state.history.push_back(record.clone());
            state
                .listeners
                .iter()
                .map(|l| (l.active.clone(), l.callback.clone()))
                .collect()
        };

        for (active, callback) in listeners {
            if active.load(Ordering::SeqCst) {
                callback(&record);
            }
        }
    }

    pub fn on_conflict<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConflictRecord) + Send + Sync + 'static,
    {
        let mut state = self.state();
        let id = state.next_listener;
        state.next_listener += 1;
        let active = Arc::new(AtomicBool::new(true));
        state.listeners.push(Listener {
            id,
            active: active.clone(),
            callback: Arc::new(callback),
        });
        Subscription {
            id,
            active,
            registry: Arc::downgrade(&self.state),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    /// Most recent first.
    pub fn recent_conflicts(&self) -> Vec<ConflictRecord> {
        self.state().history.iter().rev().cloned().collect()
    }

    pub fn clear_conflicts(&self) {
        self.state().history.clear();
    }
}
