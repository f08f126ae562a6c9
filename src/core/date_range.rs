use chrono::{Datelike, Days, NaiveDate};

use super::goal::{Goal, GoalLevel};
use super::hierarchy::GoalIndex;

/// Inclusive span of calendar days a goal is active for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if end < start {
            Self { start: end, end: start }
        } else {
            Self { start, end }
        }
    }

    pub fn day(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        if !self.overlaps(other) {
            return None;
        }
        Some(DateRange {
            start: self.start.max(other.start),
            end: self.end.min(other.end),
        })
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.start.iter_days().take_while(|d| *d <= self.end)
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

/// `None` only at the very start of chrono's calendar.
pub fn monday_of(date: NaiveDate) -> Option<NaiveDate> {
    date.checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))
}

fn first_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month.clamp(1, 12), 1)
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let next = if month == 12 {
        first_of_month(year.checked_add(1)?, 1)?
    } else {
        first_of_month(year, month + 1)?
    };
    Some(next.pred_opt()?.day())
}

fn add_months(date: NaiveDate, months: u32) -> Option<NaiveDate> {
    let total_months = date.month0().checked_add(months)?;
    let year = date.year().checked_add(i32::try_from(total_months / 12).ok()?)?;
    let month = (total_months % 12) + 1;
    let day = date.day().min(days_in_month(year, month)?);
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Jan 1 through Dec 31 of `year`.
pub fn vision_range(year: i32) -> Option<DateRange> {
    Some(DateRange {
        start: NaiveDate::from_ymd_opt(year, 1, 1)?,
        end: NaiveDate::from_ymd_opt(year, 12, 31)?,
    })
}

/// First day of the start month through the last day of the final month.
pub fn milestone_range(year: i32, month: u32, duration_months: u32) -> Option<DateRange> {
    let start = first_of_month(year, month)?;
    let after = add_months(start, duration_months.max(1))?;
    Some(DateRange {
        start,
        end: after.pred_opt()?,
    })
}

/// Monday of the week containing `week_start`, spanning whole weeks.
/// `None` when the span runs off the calendar.
pub fn focus_range(week_start: NaiveDate, duration_weeks: u32) -> Option<DateRange> {
    let start = monday_of(week_start)?;
    let end = start.checked_add_days(Days::new(7 * u64::from(duration_weeks.max(1)) - 1))?;
    Some(DateRange { start, end })
}

/// Active window of a goal, computed from its own persisted fields.
///
/// Intentions may borrow the due date of a recurring parent; that is a
/// single lookup, never a walk. Recurring intentions without any due date
/// get the window their occurrences are drawn from (the parent focus week,
/// or the goal's own month) and must be checked with [`occurrences`].
pub fn date_range(goal: &Goal, index: &impl GoalIndex) -> Option<DateRange> {
    match goal.level {
        GoalLevel::Vision => vision_range(goal.year),
        GoalLevel::Milestone => {
            milestone_range(goal.year, goal.month, goal.duration_months.unwrap_or(1))
        }
        GoalLevel::Focus => {
            let anchor = match goal.week_start {
                Some(date) => date,
                None => first_of_month(goal.year, goal.month)?,
            };
            focus_range(anchor, goal.duration_weeks.unwrap_or(1))
        }
        GoalLevel::Intention => intention_range(goal, index),
    }
}

fn intention_range(goal: &Goal, index: &impl GoalIndex) -> Option<DateRange> {
    if let Some(due) = goal.due_date {
        return Some(DateRange::day(due));
    }

    let parent = goal.parent_id().and_then(|id| index.goal(id));
    if let Some(parent) = parent {
        if let (Some(_), Some(due)) = (&parent.recurrence, parent.due_date) {
            return Some(DateRange::day(due));
        }
    }

    if goal.recurrence.is_some() {
        return match parent {
            Some(parent) if parent.level == GoalLevel::Focus => date_range(parent, index),
            _ => milestone_range(goal.year, goal.month, 1),
        };
    }

    None
}

/// Concrete days within `window` on which the goal is scheduled.
pub fn occurrences(goal: &Goal, index: &impl GoalIndex, window: &DateRange) -> Vec<NaiveDate> {
    let Some(range) = date_range(goal, index) else {
        return Vec::new();
    };
    let Some(overlap) = range.intersect(window) else {
        return Vec::new();
    };

    match (&goal.recurrence, goal.level, goal.due_date) {
        (Some(recurrence), GoalLevel::Intention, None) => overlap
            .days()
            .filter(|d| recurrence.occurs_on(*d))
            .collect(),
        _ => overlap.days().collect(),
    }
}

pub fn is_active_in(goal: &Goal, index: &impl GoalIndex, window: &DateRange) -> bool {
    match (&goal.recurrence, goal.level, goal.due_date) {
        (Some(_), GoalLevel::Intention, None) => !occurrences(goal, index, window).is_empty(),
        _ => date_range(goal, index).is_some_and(|r| r.overlaps(window)),
    }
}

/// All goals active in `window`. One pass over the goals.
pub fn goals_active_in<'a>(index: &'a impl GoalIndex, window: &DateRange) -> Vec<&'a Goal> {
    let mut active: Vec<&Goal> = index
        .goals()
        .into_iter()
        .filter(|g| g.status.is_active() && is_active_in(g, index, window))
        .collect();
    active.sort_by(|a, b| a.level.cmp(&b.level).then_with(|| a.title.cmp(&b.title)));
    active
}
