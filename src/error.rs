use std::path::PathBuf;

use crate::core::goal::GoalLevel;
use crate::core::record::EntityKey;

/// Integrity violations in the goal tree. Raised at mutation time; the
/// offending change is never stored or persisted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HierarchyError {
    #[error("vision cannot have a parent (goal {child_id}, parent {parent_id})")]
    VisionWithParent { child_id: String, parent_id: String },
    #[error("parent goal not found: {0}")]
    ParentNotFound(String),
    #[error("a {child} must have a {expected} parent, but {parent_id} is a {actual}")]
    LevelMismatch {
        child: GoalLevel,
        expected: GoalLevel,
        actual: GoalLevel,
        parent_id: String,
    },
    #[error("circular hierarchy: {child_id} would become its own ancestor via {parent_id}")]
    CircularHierarchy { child_id: String, parent_id: String },
}

/// Failures reported by a local or remote store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("write rejected for {key}: {reason}")]
    Rejected { key: EntityKey, reason: String },
    #[error("record not found: {0}")]
    NotFound(EntityKey),
    #[error("could not access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by [`crate::session::SyncSession`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("record not found: {0}")]
    NotFound(EntityKey),
    #[error("record already exists: {0}")]
    AlreadyExists(EntityKey),
    #[error("remote store is offline")]
    Offline,
    #[error("sync session has been closed")]
    SessionClosed,
}
