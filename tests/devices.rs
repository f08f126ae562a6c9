use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::TimeDelta;
use lodestar::sync::conflict::Resolution;
use lodestar::sync::memory::{MemoryLocalStore, MemoryRemoteStore};
use lodestar::sync::queue::QueuedWrite;
use lodestar::{Entity, Goal, SyncConfig, SyncNotice, SyncSession, SyncStatus, Syncable};

type Device = SyncSession<Arc<MemoryRemoteStore>, MemoryLocalStore>;

fn config() -> SyncConfig {
    SyncConfig {
        debounce_ms: 1500,
        min_save_interval_ms: 0,
        ..SyncConfig::default()
    }
}

fn device(remote: &Arc<MemoryRemoteStore>) -> Device {
    SyncSession::new(config(), remote.clone(), MemoryLocalStore::new())
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn later_write_from_another_device_wins() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let device_a = device(&remote);
    let device_b = device(&remote);

    let goal = device_a.create_goal(Goal::vision("Learn piano", 2025)).await.unwrap();
    device_b.sync_now().await.unwrap();
    assert!(device_b.goal(&goal.id).is_some());

    // B edits five seconds after A's write.
    let mut from_b = device_b.goal(&goal.id).unwrap();
    from_b.title = "Learn piano and guitar".into();
    from_b.updated_at = goal.updated_at.map(|t| t + TimeDelta::milliseconds(5000));
    remote.put_raw(from_b.into());

    let delivered = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    let _sub = device_a.on_conflict(move |record| {
        sink.lock().unwrap().push(record.message());
    });

    let report = device_a.sync_now().await.unwrap();
    assert_eq!(report.conflicts, 1);

    let conflicts = device_a.recent_conflicts();
    assert_eq!(conflicts[0].resolution, Resolution::RemoteWins);
    assert_eq!(conflicts[0].entity_id, goal.id);

    let messages = delivered.lock().unwrap().clone();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].contains("Learn piano"));
    assert!(messages[0].contains("overwritten"));

    assert_eq!(device_a.goal(&goal.id).unwrap().title, "Learn piano and guitar");
}

#[tokio::test]
async fn near_simultaneous_writes_are_not_conflicts() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let device_a = device(&remote);
    let goal = device_a.create_goal(Goal::vision("Sleep more", 2025)).await.unwrap();

    let mut other = goal.clone();
    other.updated_at = goal.updated_at.map(|t| t + TimeDelta::milliseconds(800));
    remote.put_raw(other.into());

    let report = device_a.sync_now().await.unwrap();
    assert_eq!(report.conflicts, 0);
    assert!(device_a.recent_conflicts().is_empty());
}

#[tokio::test]
async fn unsubscribed_listener_hears_nothing_more() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let session = device(&remote);
    let heard = Arc::new(AtomicUsize::new(0));
    let h = heard.clone();
    let sub = session.on_conflict(move |_| {
        h.fetch_add(1, Ordering::SeqCst);
    });
    sub.unsubscribe();

    let goal = session.create_goal(Goal::vision("Quiet", 2025)).await.unwrap();
    let mut newer = goal.clone();
    newer.updated_at = goal.updated_at.map(|t| t + TimeDelta::seconds(30));
    remote.put_raw(newer.into());

    session.sync_now().await.unwrap();
    assert_eq!(session.recent_conflicts().len(), 1);
    assert_eq!(heard.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn rapid_edits_become_one_write() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let session = device(&remote);
    let goal = session.create_goal(Goal::vision("Typing", 2025)).await.unwrap();
    let baseline = remote.upsert_count();

    for word in ["T", "Ty", "Typ", "Typi", "Typin", "Typing fast"] {
        session.edit_goal(&goal.id, |g| g.title = word.to_string()).unwrap();
        settle(100).await;
    }
    assert_eq!(remote.upsert_count(), baseline);

    settle(1500).await;
    assert_eq!(remote.upsert_count(), baseline + 1);
    assert_eq!(
        remote.record(&goal.key()).and_then(|e| e.title().map(str::to_string)),
        Some("Typing fast".to_string())
    );
    assert_eq!(session.dirty_stats().total_dirty, 0);
}

#[tokio::test(start_paused = true)]
async fn offline_session_catches_up_on_reconnect() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let session = device(&remote);
    let kept = session.create_goal(Goal::vision("Kept", 2025)).await.unwrap();
    let dropped = session.create_goal(Goal::vision("Dropped", 2025)).await.unwrap();

    session.set_offline();
    session.edit_goal(&kept.id, |g| g.title = "Kept, renamed".into()).unwrap();
    session.delete_goal(&dropped.id).await.unwrap();
    settle(2000).await;

    assert_eq!(
        session.pending_writes(),
        vec![QueuedWrite::Delete(dropped.key()), QueuedWrite::Upsert(kept.key())]
    );
    assert_eq!(remote.len(), 2);

    let report = session.reconnect().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.deleted, 1);
    assert_eq!(report.conflicts, 0);
    assert!(session.pending_writes().is_empty());
    assert_eq!(remote.len(), 1);
    assert_eq!(
        remote.record(&kept.key()).and_then(|e| e.title().map(str::to_string)),
        Some("Kept, renamed".to_string())
    );
    assert!(matches!(session.status(), SyncStatus::LastSynced(_)));
}

#[tokio::test]
async fn creation_failure_is_reported_once() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let session = device(&remote);
    let mut notices = session.subscribe_notices();

    remote.set_offline(true);
    let goal = session.create_goal(Goal::vision("Unlucky", 2025)).await.unwrap();
    assert!(matches!(
        notices.try_recv(),
        Ok(SyncNotice::SaveFailed { .. })
    ));

    // Updates that fail stay quiet.
    session
        .update_goal(&goal.id, |g| g.title = "Still unlucky".into())
        .await
        .unwrap();
    assert!(notices.try_recv().is_err());
    assert!(session.is_dirty(&goal.key()));

    remote.set_offline(false);
    let report = session.force_sync().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(!session.is_dirty(&goal.key()));
    assert!(matches!(
        notices.try_recv(),
        Ok(SyncNotice::SyncCompleted(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn logout_mid_write_leaves_nothing_behind() {
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.set_latency(Some(Duration::from_millis(800)));
    let session = device(&remote);

    let goal = Goal::vision("In flight", 2025);
    session.save_record(Entity::Goal(goal.clone())).unwrap();
    settle(1600).await;
    session.destroy();

    settle(2000).await;
    assert!(session.goal(&goal.id).is_none());
    assert_eq!(session.pending_timers(), 0);
    assert_eq!(session.dirty_stats().total_dirty, 0);
    assert!(session.force_sync().await.is_err());
}
