use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::record::{EntityType, Syncable, new_id};

/// The four tiers of the goal tree, broadest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalLevel {
    Vision,
    Milestone,
    Focus,
    Intention,
}

impl GoalLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::Milestone => "milestone",
            Self::Focus => "focus",
            Self::Intention => "intention",
        }
    }

    /// The only level a parent of this level may have.
    pub fn expected_parent_level(&self) -> Option<GoalLevel> {
        match self {
            Self::Vision => None,
            Self::Milestone => Some(Self::Vision),
            Self::Focus => Some(Self::Milestone),
            Self::Intention => Some(Self::Focus),
        }
    }
}

impl fmt::Display for GoalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    #[default]
    NotStarted,
    InProgress,
    Done,
    Blocked,
    Archived,
}

impl GoalStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done | Self::Archived)
    }

    pub fn is_active(&self) -> bool {
        !self.is_done()
    }
}

/// A goal's link to its parent. Serialized as a nullable `parentId`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum ParentLink {
    #[default]
    None,
    Linked(String),
}

impl ParentLink {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::Linked(id) => Some(id),
        }
    }
}

impl From<Option<String>> for ParentLink {
    fn from(value: Option<String>) -> Self {
        match value {
            Some(id) if !id.is_empty() => Self::Linked(id),
            _ => Self::None,
        }
    }
}

impl From<ParentLink> for Option<String> {
    fn from(value: ParentLink) -> Self {
        match value {
            ParentLink::None => None,
            ParentLink::Linked(id) => Some(id),
        }
    }
}

/// Weekly repetition on a fixed set of weekdays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub weekdays: Vec<Weekday>,
}

impl Recurrence {
    pub fn on(weekdays: impl IntoIterator<Item = Weekday>) -> Self {
        let mut weekdays: Vec<Weekday> = weekdays.into_iter().collect();
        weekdays.sort_by_key(|d| d.num_days_from_monday());
        weekdays.dedup();
        Self { weekdays }
    }

    pub fn occurs_on(&self, date: NaiveDate) -> bool {
        use chrono::Datelike;
        self.weekdays.contains(&date.weekday())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalNote {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntry {
    pub id: String,
    pub minutes: u32,
    pub logged_at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub title: String,
    pub level: GoalLevel,
    #[serde(rename = "parentId", default)]
    pub parent: ParentLink,
    #[serde(default)]
    pub parent_level: Option<GoalLevel>,
    pub year: i32,
    /// 1-based start month.
    pub month: u32,
    #[serde(default)]
    pub duration_months: Option<u32>,
    #[serde(default)]
    pub week_start: Option<NaiveDate>,
    #[serde(default)]
    pub duration_weeks: Option<u32>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    #[serde(default)]
    pub status: GoalStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub notes: Vec<GoalNote>,
    #[serde(default)]
    pub time_log: Vec<TimeEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Goal {
    pub fn new(title: impl Into<String>, level: GoalLevel, year: i32, month: u32) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            title: title.into(),
            level,
            parent: ParentLink::None,
            parent_level: None,
            year,
            month: month.clamp(1, 12),
            duration_months: None,
            week_start: None,
            duration_weeks: None,
            due_date: None,
            recurrence: None,
            status: GoalStatus::NotStarted,
            progress: 0,
            subtasks: Vec::new(),
            notes: Vec::new(),
            time_log: Vec::new(),
            created_at: now,
            updated_at: Some(now),
        }
    }

    pub fn vision(title: impl Into<String>, year: i32) -> Self {
        Self::new(title, GoalLevel::Vision, year, 1)
    }

    pub fn milestone(title: impl Into<String>, year: i32, month: u32, duration_months: u32) -> Self {
        let mut goal = Self::new(title, GoalLevel::Milestone, year, month);
        goal.duration_months = Some(duration_months.max(1));
        goal
    }

    pub fn focus(title: impl Into<String>, week_start: NaiveDate, duration_weeks: u32) -> Self {
        use chrono::Datelike;
        let mut goal = Self::new(title, GoalLevel::Focus, week_start.year(), week_start.month());
        goal.week_start = Some(week_start);
        goal.duration_weeks = Some(duration_weeks.max(1));
        goal
    }

    pub fn intention(title: impl Into<String>, due_date: NaiveDate) -> Self {
        use chrono::Datelike;
        let mut goal = Self::new(title, GoalLevel::Intention, due_date.year(), due_date.month());
        goal.due_date = Some(due_date);
        goal
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent = ParentLink::Linked(parent_id.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent.id()
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
        if self.progress == 100 {
            self.status = GoalStatus::Done;
        } else if self.progress > 0 && self.status == GoalStatus::NotStarted {
            self.status = GoalStatus::InProgress;
        }
    }

    pub fn complete(&mut self) {
        self.status = GoalStatus::Done;
        self.progress = 100;
    }

    pub fn add_subtask(&mut self, title: impl Into<String>) -> &Subtask {
        self.subtasks.push(Subtask {
            id: new_id(),
            title: title.into(),
            done: false,
        });
        self.sync_progress_from_subtasks();
        &self.subtasks[self.subtasks.len() - 1]
    }

    /// Flip a subtask and recompute progress. Returns false for unknown ids.
    pub fn toggle_subtask(&mut self, subtask_id: &str) -> bool {
        let Some(subtask) = self.subtasks.iter_mut().find(|s| s.id == subtask_id) else {
            return false;
        };
        subtask.done = !subtask.done;
        self.sync_progress_from_subtasks();
        true
    }

    fn sync_progress_from_subtasks(&mut self) {
        if self.subtasks.is_empty() {
            return;
        }
        let done = self.subtasks.iter().filter(|s| s.done).count();
        let pct = (done * 100 / self.subtasks.len()) as u8;
        self.set_progress(pct);
        if pct < 100 && self.status == GoalStatus::Done {
            self.status = GoalStatus::InProgress;
        }
    }

    pub fn add_note(&mut self, text: impl Into<String>) {
        self.notes.push(GoalNote {
            id: new_id(),
            text: text.into(),
            created_at: Utc::now(),
        });
    }

    pub fn log_time(&mut self, minutes: u32, note: Option<String>) {
        self.time_log.push(TimeEntry {
            id: new_id(),
            minutes,
            logged_at: Utc::now(),
            note,
        });
    }

    pub fn total_minutes(&self) -> u32 {
        self.time_log.iter().map(|e| e.minutes).sum()
    }
}

impl Syncable for Goal {
    fn id(&self) -> &str {
        &self.id
    }

    fn entity_type(&self) -> EntityType {
        EntityType::Goal
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }

    fn title(&self) -> Option<&str> {
        Some(&self.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_levels_follow_the_tree() {
        assert_eq!(GoalLevel::Vision.expected_parent_level(), None);
        assert_eq!(GoalLevel::Milestone.expected_parent_level(), Some(GoalLevel::Vision));
        assert_eq!(GoalLevel::Focus.expected_parent_level(), Some(GoalLevel::Milestone));
        assert_eq!(GoalLevel::Intention.expected_parent_level(), Some(GoalLevel::Focus));
    }

    #[test]
    fn parent_link_serializes_as_nullable_id() {
        let goal = Goal::vision("Ship it", 2025);
        let json = serde_json::to_value(&goal).unwrap();
        assert!(json["parentId"].is_null());

        let child = Goal::milestone("Beta", 2025, 3, 2).with_parent("v1");
        let json = serde_json::to_value(&child).unwrap();
        assert_eq!(json["parentId"], "v1");
        assert_eq!(json["durationMonths"], 2);

        let back: Goal = serde_json::from_value(json).unwrap();
        assert_eq!(back.parent, ParentLink::Linked("v1".into()));
    }

    #[test]
    fn empty_parent_id_means_unlinked() {
        assert_eq!(ParentLink::from(Some(String::new())), ParentLink::None);
    }

    #[test]
    fn progress_is_clamped_and_drives_status() {
        let mut goal = Goal::vision("Run", 2025);
        goal.set_progress(40);
        assert_eq!(goal.status, GoalStatus::InProgress);
        goal.set_progress(250);
        assert_eq!(goal.progress, 100);
        assert_eq!(goal.status, GoalStatus::Done);
    }

    #[test]
    fn subtasks_update_progress() {
        let mut goal = Goal::vision("Garden", 2025);
        let a = goal.add_subtask("dig").id.clone();
        goal.add_subtask("plant");
        assert!(goal.toggle_subtask(&a));
        assert_eq!(goal.progress, 50);
        assert!(!goal.toggle_subtask("missing"));
        assert!(goal.toggle_subtask(&a));
        assert_eq!(goal.progress, 0);
    }

    #[test]
    fn time_log_totals() {
        let mut goal = Goal::vision("Write", 2025);
        goal.log_time(25, None);
        goal.log_time(50, Some("deep work".into()));
        assert_eq!(goal.total_minutes(), 75);
    }
}
