pub mod backend;
pub mod conflict;
pub mod dirty;
pub mod json_store;
pub mod memory;
pub mod queue;
pub mod reconcile;
pub mod scheduler;

use chrono::{DateTime, Utc};

use crate::core::record::EntityKey;

/// Sync status for display.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Offline,
    Error(String),
    LastSynced(DateTime<Utc>),
}

impl SyncStatus {
    pub fn label(&self) -> String {
        match self {
            Self::Idle => "Idle".to_string(),
            Self::Syncing => "Syncing…".to_string(),
            Self::Offline => "Offline".to_string(),
            Self::Error(e) => format!("Sync error: {}", e),
            Self::LastSynced(at) => format!("Last synced {}", at.format("%H:%M")),
        }
    }
}

/// User-facing events broadcast by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// A freshly created record could not reach the remote. It stays dirty
    /// and is retried on the next trigger.
    SaveFailed {
        key: EntityKey,
        title: Option<String>,
        message: String,
    },
    SyncCompleted(SyncReport),
}

/// Result of a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Records inserted or replaced from the remote.
    pub pulled: usize,
    /// Records the remote acknowledged.
    pub pushed: usize,
    /// Buffered deletes sent.
    pub deleted: usize,
    /// Remote-wins conflicts resolved.
    pub conflicts: usize,
    /// Records still dirty after the pass.
    pub failed: usize,
    /// Errors encountered (non-fatal).
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn merge(&mut self, other: SyncReport) {
        self.pulled += other.pulled;
        self.pushed += other.pushed;
        self.deleted += other.deleted;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
        self.errors.extend(other.errors);
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.errors.is_empty()
    }
}
