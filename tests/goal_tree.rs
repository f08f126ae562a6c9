use std::sync::Arc;

use chrono::{NaiveDate, Weekday};
use lodestar::core::date_range::DateRange;
use lodestar::core::goal::Recurrence;
use lodestar::sync::memory::{MemoryLocalStore, MemoryRemoteStore};
use lodestar::{Goal, GoalLevel, HierarchyError, SyncConfig, SyncError, SyncSession};

type Session = SyncSession<Arc<MemoryRemoteStore>, MemoryLocalStore>;

fn session() -> Session {
    SyncSession::new(
        SyncConfig::default(),
        Arc::new(MemoryRemoteStore::new()),
        MemoryLocalStore::new(),
    )
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test]
async fn full_chain_has_nested_ranges() {
    let session = session();
    let vision = session.create_goal(Goal::vision("Get fit", 2025)).await.unwrap();
    let milestone = session
        .create_goal(Goal::milestone("Run 10k", 2025, 3, 1).with_parent(&vision.id))
        .await
        .unwrap();
    // A Wednesday; the range snaps to that week's Monday.
    let focus = session
        .create_goal(Goal::focus("Build base", date(2025, 3, 12), 1).with_parent(&milestone.id))
        .await
        .unwrap();
    let intention = session
        .create_goal(Goal::intention("Easy 5k", date(2025, 3, 13)).with_parent(&focus.id))
        .await
        .unwrap();

    assert_eq!(milestone.parent_level, Some(GoalLevel::Vision));
    assert_eq!(focus.parent_level, Some(GoalLevel::Milestone));
    assert_eq!(intention.parent_level, Some(GoalLevel::Focus));

    let range = |id: &str| session.goal_date_range(id).unwrap();
    assert_eq!(range(&vision.id), DateRange::new(date(2025, 1, 1), date(2025, 12, 31)));
    assert_eq!(range(&milestone.id), DateRange::new(date(2025, 3, 1), date(2025, 3, 31)));
    assert_eq!(range(&focus.id), DateRange::new(date(2025, 3, 10), date(2025, 3, 16)));
    assert_eq!(range(&intention.id), DateRange::day(date(2025, 3, 13)));

    let active = session.goals_active_in(&DateRange::day(date(2025, 3, 13)));
    assert_eq!(active.len(), 4);
    let active = session.goals_active_in(&DateRange::day(date(2025, 3, 20)));
    assert_eq!(
        active.iter().map(|g| g.level).collect::<Vec<_>>(),
        vec![GoalLevel::Vision, GoalLevel::Milestone]
    );
}

#[tokio::test]
async fn milestone_under_intention_is_a_level_mismatch() {
    let session = session();
    let intention = session
        .create_goal(Goal::intention("Stretch", date(2025, 5, 5)))
        .await
        .unwrap();

    let err = session
        .create_goal(Goal::milestone("Flexibility", 2025, 5, 1).with_parent(&intention.id))
        .await
        .unwrap_err();
    match err {
        SyncError::Hierarchy(HierarchyError::LevelMismatch { expected, actual, .. }) => {
            assert_eq!(expected, GoalLevel::Vision);
            assert_eq!(actual, GoalLevel::Intention);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(session.goals().len(), 1);
}

#[tokio::test]
async fn vision_cannot_take_a_parent() {
    let session = session();
    let first = session.create_goal(Goal::vision("One", 2025)).await.unwrap();
    let err = session
        .create_goal(Goal::vision("Two", 2025).with_parent(&first.id))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Hierarchy(HierarchyError::VisionWithParent { .. })
    ));
}

#[tokio::test]
async fn unknown_parent_is_rejected() {
    let session = session();
    let err = session
        .create_goal(Goal::milestone("Orphan", 2025, 1, 1).with_parent("nope"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Hierarchy(HierarchyError::ParentNotFound(id)) if id == "nope"
    ));
}

#[tokio::test]
async fn unlinked_intention_is_allowed() {
    let session = session();
    let goal = session
        .create_goal(Goal::intention("Call the bank", date(2025, 2, 3)))
        .await
        .unwrap();
    assert!(goal.parent_id().is_none());
    assert!(goal.parent_level.is_none());
}

#[tokio::test]
async fn recurring_intention_occurs_on_weekdays_of_its_focus_week() {
    let session = session();
    let vision = session.create_goal(Goal::vision("Write", 2025)).await.unwrap();
    let milestone = session
        .create_goal(Goal::milestone("Draft", 2025, 6, 1).with_parent(&vision.id))
        .await
        .unwrap();
    let focus = session
        .create_goal(Goal::focus("Chapter one", date(2025, 6, 2), 1).with_parent(&milestone.id))
        .await
        .unwrap();

    let mut daily = Goal::new("Morning pages", GoalLevel::Intention, 2025, 6).with_parent(&focus.id);
    daily.recurrence = Some(Recurrence::on([Weekday::Mon, Weekday::Wed]));
    let daily = session.create_goal(daily).await.unwrap();

    let active = |d: NaiveDate| {
        session
            .goals_active_in(&DateRange::day(d))
            .iter()
            .any(|g| g.id == daily.id)
    };
    assert!(active(date(2025, 6, 2)));
    assert!(!active(date(2025, 6, 3)));
    assert!(active(date(2025, 6, 4)));
    // Outside the focus week.
    assert!(!active(date(2025, 6, 9)));
}
