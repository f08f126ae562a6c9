use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Discriminator shared by every record that takes part in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Goal,
    Event,
    BrainDump,
    WeeklyReview,
    Preferences,
    Analytics,
    Streak,
}

/// How outbound writes for a type are coalesced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Per-record timer, reset on every edit.
    Debounce,
    /// At most one flush per window for the whole type.
    Throttle,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        Self::Goal,
        Self::Event,
        Self::BrainDump,
        Self::WeeklyReview,
        Self::Preferences,
        Self::Analytics,
        Self::Streak,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Goal => "goal",
            Self::Event => "event",
            Self::BrainDump => "brain_dump",
            Self::WeeklyReview => "weekly_review",
            Self::Preferences => "preferences",
            Self::Analytics => "analytics",
            Self::Streak => "streak",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        match self {
            Self::Goal | Self::Event | Self::BrainDump | Self::WeeklyReview => {
                SyncPolicy::Debounce
            }
            Self::Preferences | Self::Analytics | Self::Streak => SyncPolicy::Throttle,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(type, id)` pair addressing one record. Displays as `type:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }

    pub fn goal(id: impl Into<String>) -> Self {
        Self::new(EntityType::Goal, id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

/// A record the conflict detector and dirty tracker can reason about
/// without knowing its concrete type.
pub trait Syncable {
    fn id(&self) -> &str;

    fn entity_type(&self) -> EntityType;

    fn updated_at(&self) -> Option<DateTime<Utc>>;

    fn set_updated_at(&mut self, at: DateTime<Utc>);

    /// Human-readable name used in conflict messages.
    fn title(&self) -> Option<&str> {
        None
    }

    fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type(), self.id())
    }

    fn touch(&mut self) {
        self.set_updated_at(Utc::now());
    }
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_round_trips_through_str() {
        for t in EntityType::ALL {
            assert_eq!(EntityType::parse(t.as_str()), Some(t));
        }
        assert_eq!(EntityType::parse("habit"), None);
    }

    #[test]
    fn aggregates_are_throttled() {
        assert_eq!(EntityType::Goal.sync_policy(), SyncPolicy::Debounce);
        assert_eq!(EntityType::Streak.sync_policy(), SyncPolicy::Throttle);
        assert_eq!(EntityType::Preferences.sync_policy(), SyncPolicy::Throttle);
    }

    #[test]
    fn key_display() {
        assert_eq!(EntityKey::goal("abc").to_string(), "goal:abc");
        assert_eq!(
            EntityKey::new(EntityType::BrainDump, "x").to_string(),
            "brain_dump:x"
        );
    }
}
