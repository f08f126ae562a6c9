//! Offline-first sync core for a personal goal tracker: a four-level goal
//! hierarchy, dirty tracking, debounced and throttled pushes, an offline
//! write queue and last-write-wins conflict handling with a clock-skew
//! tolerance.
//!
//! Logging goes through the `log` facade; installing a logger is up to the
//! application.

pub mod config;
pub mod core;
pub mod error;
pub mod session;
pub mod sync;

pub use crate::config::SyncConfig;
pub use crate::core::entity::Entity;
pub use crate::core::goal::{Goal, GoalLevel, GoalStatus, ParentLink};
pub use crate::core::record::{EntityKey, EntityType, Syncable};
pub use crate::error::{HierarchyError, StoreError, SyncError};
pub use crate::session::SyncSession;
pub use crate::sync::backend::{LocalStore, RemoteStore};
pub use crate::sync::{SyncNotice, SyncReport, SyncStatus};
