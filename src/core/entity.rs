use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use super::goal::Goal;
use super::record::{EntityType, Syncable, new_id};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub title: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub start_time: Option<NaiveTime>,
    #[serde(default)]
    pub end_time: Option<NaiveTime>,
    #[serde(default)]
    pub goal_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(title: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            id: new_id(),
            title: title.into(),
            date,
            start_time: None,
            end_time: None,
            goal_id: None,
            updated_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrainDumpItem {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BrainDumpItem {
    pub fn new(text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            text: text.into(),
            processed: false,
            created_at: now,
            updated_at: Some(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyReview {
    pub id: String,
    /// Always a Monday.
    pub week_start: NaiveDate,
    #[serde(default)]
    pub wins: Vec<String>,
    #[serde(default)]
    pub challenges: Vec<String>,
    #[serde(default)]
    pub next_focus: Vec<String>,
    #[serde(default)]
    pub rating: Option<u8>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl WeeklyReview {
    pub fn for_week(date: NaiveDate) -> Self {
        let week_start = date - chrono::Duration::days(date.weekday().num_days_from_monday() as i64);
        Self {
            id: new_id(),
            week_start,
            wins: Vec::new(),
            challenges: Vec::new(),
            next_focus: Vec::new(),
            rating: None,
            updated_at: Some(Utc::now()),
        }
    }
}

/// Singleton, low-priority state such as preferences or streak counters.
/// The payload is opaque to the sync core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateState {
    pub id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl AggregateState {
    pub const DEFAULT_ID: &'static str = "default";

    pub fn new(data: serde_json::Value) -> Self {
        Self {
            id: Self::DEFAULT_ID.to_string(),
            data,
            updated_at: Some(Utc::now()),
        }
    }
}

/// Every record kind the session stores, tagged by `entityType` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entityType", rename_all = "snake_case")]
pub enum Entity {
    Goal(Goal),
    Event(Event),
    BrainDump(BrainDumpItem),
    WeeklyReview(WeeklyReview),
    Preferences(AggregateState),
    Analytics(AggregateState),
    Streak(AggregateState),
}

impl Entity {
    pub fn as_goal(&self) -> Option<&Goal> {
        match self {
            Self::Goal(goal) => Some(goal),
            _ => None,
        }
    }

    pub fn as_goal_mut(&mut self) -> Option<&mut Goal> {
        match self {
            Self::Goal(goal) => Some(goal),
            _ => None,
        }
    }

    fn record(&self) -> &dyn Syncable {
        match self {
            Self::Goal(r) => r,
            Self::Event(r) => r,
            Self::BrainDump(r) => r,
            Self::WeeklyReview(r) => r,
            Self::Preferences(r) | Self::Analytics(r) | Self::Streak(r) => r,
        }
    }

    fn record_mut(&mut self) -> &mut dyn Syncable {
        match self {
            Self::Goal(r) => r,
            Self::Event(r) => r,
            Self::BrainDump(r) => r,
            Self::WeeklyReview(r) => r,
            Self::Preferences(r) | Self::Analytics(r) | Self::Streak(r) => r,
        }
    }
}

impl Syncable for Entity {
    fn id(&self) -> &str {
        self.record().id()
    }

    fn entity_type(&self) -> EntityType {
        match self {
            Self::Goal(_) => EntityType::Goal,
            Self::Event(_) => EntityType::Event,
            Self::BrainDump(_) => EntityType::BrainDump,
            Self::WeeklyReview(_) => EntityType::WeeklyReview,
            Self::Preferences(_) => EntityType::Preferences,
            Self::Analytics(_) => EntityType::Analytics,
            Self::Streak(_) => EntityType::Streak,
        }
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.record().updated_at()
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.record_mut().set_updated_at(at);
    }

    fn title(&self) -> Option<&str> {
        self.record().title()
    }
}

impl From<Goal> for Entity {
    fn from(goal: Goal) -> Self {
        Self::Goal(goal)
    }
}

impl From<Event> for Entity {
    fn from(event: Event) -> Self {
        Self::Event(event)
    }
}

impl From<BrainDumpItem> for Entity {
    fn from(item: BrainDumpItem) -> Self {
        Self::BrainDump(item)
    }
}

impl From<WeeklyReview> for Entity {
    fn from(review: WeeklyReview) -> Self {
        Self::WeeklyReview(review)
    }
}

macro_rules! syncable {
    ($ty:ty, $kind:expr, $title:expr) => {
        impl Syncable for $ty {
            fn id(&self) -> &str {
                &self.id
            }

            fn entity_type(&self) -> EntityType {
                $kind
            }

            fn updated_at(&self) -> Option<DateTime<Utc>> {
                self.updated_at
            }

            fn set_updated_at(&mut self, at: DateTime<Utc>) {
                self.updated_at = Some(at);
            }

            fn title(&self) -> Option<&str> {
                let title: fn(&$ty) -> Option<&str> = $title;
                title(self)
            }
        }
    };
}

syncable!(Event, EntityType::Event, |e| Some(e.title.as_str()));
syncable!(BrainDumpItem, EntityType::BrainDump, |b| Some(b.text.as_str()));
syncable!(WeeklyReview, EntityType::WeeklyReview, |_| None);
// The concrete aggregate kind lives on the `Entity` variant.
syncable!(AggregateState, EntityType::Preferences, |_| None);
