//! One signed-in sync context: the entity store, dirty tracking, timers and
//! queue for a single user, plus handles to the local and remote stores.
//!
//! Everything mutable lives behind one `std::sync::Mutex` that is only held
//! for short synchronous sections. Remote I/O happens outside of it, under a
//! per-record write lock, and every response is checked against the session
//! id before it is applied, so `destroy` makes late responses harmless.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, join_all};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::core::date_range::{self, DateRange};
use crate::core::entity::Entity;
use crate::core::goal::{Goal, GoalLevel, ParentLink};
use crate::core::hierarchy::{self, GoalIndex};
use crate::core::record::{EntityKey, EntityType, SyncPolicy, Syncable};
use crate::core::store::EntityStore;
use crate::error::{HierarchyError, StoreError, SyncError};
use crate::sync::backend::{LocalStore, RemoteStore};
use crate::sync::conflict::{ConflictDetector, ConflictRecord, Subscription};
use crate::sync::dirty::{DirtyStats, DirtyTracker};
use crate::sync::queue::{QueuedWrite, SyncQueue};
use crate::sync::reconcile::{self, PlanSummary, Step};
use crate::sync::scheduler::{SyncScheduler, ThrottleDecision};
use crate::sync::{SyncNotice, SyncReport, SyncStatus};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct SessionState {
    /// `None` once destroyed.
    session_id: Option<SessionId>,
    online: bool,
    status: SyncStatus,
    store: EntityStore,
    dirty: DirtyTracker,
    scheduler: SyncScheduler,
    queue: SyncQueue,
}

impl SessionState {
    fn is_current(&self, id: SessionId) -> bool {
        self.session_id == Some(id)
    }

    fn ensure_open(&self, id: SessionId) -> Result<(), SyncError> {
        if self.is_current(id) {
            Ok(())
        } else {
            Err(SyncError::SessionClosed)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushMode {
    /// From a timer: skip if another write for the id is in flight.
    Scheduled,
    /// Straight after a mutation, same skip rule.
    Immediate,
    /// From `force_sync`: wait for the in-flight write, then push.
    Forced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PushOutcome {
    Pushed,
    InFlight,
    Buffered,
    Failed(String),
    /// Session was destroyed; nothing applied.
    Stale,
    Missing,
    Clean,
}

struct Inner<R, L> {
    config: SyncConfig,
    remote: R,
    local: L,
    conflicts: ConflictDetector,
    state: Mutex<SessionState>,
    notices: broadcast::Sender<SyncNotice>,
}

impl<R: RemoteStore, L: LocalStore> Inner<R, L> {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, notice: SyncNotice) {
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }

    fn persist_local(&self, record: &Entity) {
        if let Err(e) = self.local.put(record) {
            log::error!("Failed to save {} locally: {}", record.key(), e);
        }
    }

    fn remove_local(&self, key: &EntityKey) {
        if let Err(e) = self.local.delete(key.entity_type, &key.id) {
            log::error!("Failed to delete {} locally: {}", key, e);
        }
    }

    /// Arm the timer matching the record type's policy.
    fn schedule(self: &Arc<Self>, state: &mut SessionState, session: SessionId, key: EntityKey) {
        match key.entity_type.sync_policy() {
            SyncPolicy::Debounce => self.schedule_debounce(state, session, key),
            SyncPolicy::Throttle => {
                let decision = self.schedule_throttle(state, session, key.entity_type);
                log::debug!("Throttle for {}: {:?}", key, decision);
            }
        }
    }

    fn schedule_debounce(self: &Arc<Self>, state: &mut SessionState, session: SessionId, key: EntityKey) {
        let weak = Arc::downgrade(self);
        let fired = key.clone();
        state.scheduler.debounce(key, move |generation| async move {
            if let Some(inner) = weak.upgrade() {
                inner.run_debounced(session, fired, generation).await;
            }
        });
    }

    fn schedule_throttle(
        self: &Arc<Self>,
        state: &mut SessionState,
        session: SessionId,
        entity_type: EntityType,
    ) -> ThrottleDecision {
        let weak = Arc::downgrade(self);
        state.scheduler.throttle(entity_type, move |generation| async move {
            if let Some(inner) = weak.upgrade() {
                inner.flush_throttled(session, entity_type, generation).await;
            }
        })
    }

    fn run_debounced(self: Arc<Self>, session: SessionId, key: EntityKey, generation: u64) -> BoxFuture<'static, ()> {
        async move {
            {
                let mut state = self.state();
                if !state.is_current(session) || !state.scheduler.complete(&key, generation) {
                    return;
                }
            }
            match self.push(session, &key, PushMode::Scheduled).await {
                PushOutcome::InFlight => {
                    log::debug!("{} still in flight, re-arming", key);
                    let mut state = self.state();
                    if state.is_current(session) {
                        self.schedule_debounce(&mut state, session, key);
                    }
                }
                PushOutcome::Failed(e) => {
                    log::debug!("Retry of {} failed: {}", key, e);
                }
                _ => {}
            }
        }
        .boxed()
    }

    fn flush_throttled(
        self: Arc<Self>,
        session: SessionId,
        entity_type: EntityType,
        generation: u64,
    ) -> BoxFuture<'static, ()> {
        async move {
            let min_interval = self.config.min_save_interval();
            let ids = {
                let mut state = self.state();
                if !state.is_current(session) || !state.scheduler.complete_throttle(entity_type, generation) {
                    return;
                }
                state.dirty.items_needing_save(entity_type, min_interval)
            };

            let keys: Vec<EntityKey> = ids
                .into_iter()
                .map(|id| EntityKey::new(entity_type, id))
                .collect();
            let mut pushes = Vec::with_capacity(keys.len());
            for key in &keys {
                pushes.push(self.push(session, key, PushMode::Scheduled));
            }
            let outcomes = join_all(pushes).await;

            let mut in_flight = false;
            for (key, outcome) in keys.iter().zip(outcomes) {
                match outcome {
                    PushOutcome::Failed(e) => log::debug!("Throttled save of {} failed: {}", key, e),
                    PushOutcome::InFlight => in_flight = true,
                    _ => {}
                }
            }

            let mut state = self.state();
            if !state.is_current(session) {
                return;
            }
            // Ids held back by the minimum save interval get a trailing flush.
            let retry_in = if in_flight {
                Some(self.config.throttle())
            } else {
                state.dirty.next_save_due(entity_type, min_interval)
            };
            if let Some(delay) = retry_in {
                let weak = Arc::downgrade(&self);
                state.scheduler.throttle_after(entity_type, delay, move |generation| async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.flush_throttled(session, entity_type, generation).await;
                    }
                });
            }
        }
        .boxed()
    }

    /// Push one record under its write lock.
    async fn push(&self, session: SessionId, key: &EntityKey, mode: PushMode) -> PushOutcome {
        let lock = {
            let mut state = self.state();
            if !state.is_current(session) {
                return PushOutcome::Stale;
            }
            state.queue.write_lock(key)
        };

        let outcome = match mode {
            PushMode::Forced => {
                let _guard = lock.clone().lock_owned().await;
                self.push_locked(session, key).await
            }
            PushMode::Scheduled | PushMode::Immediate => match lock.clone().try_lock_owned() {
                Ok(_guard) => self.push_locked(session, key).await,
                Err(_) => PushOutcome::InFlight,
            },
        };

        drop(lock);
        self.state().queue.release(key);
        outcome
    }

    async fn push_locked(&self, session: SessionId, key: &EntityKey) -> PushOutcome {
        let record = {
            let mut state = self.state();
            if !state.is_current(session) {
                return PushOutcome::Stale;
            }
            if !state.dirty.is_dirty(key.entity_type, &key.id) {
                return PushOutcome::Clean;
            }
            let Some(record) = state.store.get(key).cloned() else {
                return PushOutcome::Missing;
            };
            if !state.online {
                state.queue.buffer(QueuedWrite::Upsert(key.clone()));
                return PushOutcome::Buffered;
            }
            record
        };

        let sent_at = record.updated_at();
        let result = self.remote.upsert(&record).await;

        let mut guard = self.state();
        if !guard.is_current(session) {
            log::debug!("Discarding response for {} from a closed session", key);
            return PushOutcome::Stale;
        }
        let state = &mut *guard;
        match result {
            Ok(remote_at) => {
                let saved = match state.store.get_mut(key) {
                    Some(current) if current.updated_at() == sent_at => {
                        current.set_updated_at(remote_at);
                        state.dirty.mark_clean(key.entity_type, &key.id);
                        Some(current.clone())
                    }
                    Some(_) => {
                        log::debug!("{} changed while being pushed, stays dirty", key);
                        None
                    }
                    None => None,
                };
                drop(guard);
                if let Some(record) = saved {
                    self.persist_local(&record);
                }
                PushOutcome::Pushed
            }
            Err(e) => PushOutcome::Failed(e.to_string()),
        }
    }

    /// Send one delete, ordered after any in-flight write for the same id.
    async fn remote_delete(&self, key: &EntityKey) -> Result<(), StoreError> {
        let lock = self.state().queue.write_lock(key);
        let result = {
            let _guard = lock.clone().lock_owned().await;
            self.remote.delete(key.entity_type, &key.id).await
        };
        drop(lock);
        self.state().queue.release(key);
        result
    }
}

/// A sync session. Dropping it cancels its timers; in-flight writes finish
/// but their responses are ignored.
pub struct SyncSession<R: RemoteStore, L: LocalStore> {
    inner: Arc<Inner<R, L>>,
    id: SessionId,
}

impl<R: RemoteStore, L: LocalStore> SyncSession<R, L> {
    pub fn new(config: SyncConfig, remote: R, local: L) -> Self {
        let id = SessionId::new();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let state = SessionState {
            session_id: Some(id),
            online: true,
            status: SyncStatus::Idle,
            store: EntityStore::new(),
            dirty: DirtyTracker::new(),
            scheduler: SyncScheduler::new(config.debounce(), config.throttle()),
            queue: SyncQueue::new(),
        };
        log::info!("Opened sync session {}", id);
        Self {
            inner: Arc::new(Inner {
                conflicts: ConflictDetector::from_config(&config),
                config,
                remote,
                local,
                state: Mutex::new(state),
                notices,
            }),
            id,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn remote(&self) -> &R {
        &self.inner.remote
    }

    pub fn local(&self) -> &L {
        &self.inner.local
    }

    fn open_state(&self) -> Result<MutexGuard<'_, SessionState>, SyncError> {
        let state = self.inner.state();
        state.ensure_open(self.id)?;
        Ok(state)
    }

    // --- Loading ---

    /// Fill the entity store from the local store, e.g. after a crash.
    /// Records already present are replaced only by newer local copies.
    /// Returns how many records were loaded.
    pub fn load_local(&self) -> Result<usize, SyncError> {
        let mut loaded = Vec::new();
        for entity_type in EntityType::ALL {
            match self.inner.local.list(entity_type) {
                Ok(records) => loaded.extend(records),
                Err(e) => log::error!("Failed to load {} records locally: {}", entity_type, e),
            }
        }

        let mut state = self.open_state()?;
        let mut count = 0;
        for record in loaded {
            let newer = state
                .store
                .get(&record.key())
                .is_none_or(|existing| record.updated_at() > existing.updated_at());
            if newer {
                state.store.insert(record);
                count += 1;
            }
        }
        log::info!("Loaded {} records from local storage", count);
        Ok(count)
    }

    // --- Goals ---

    /// Validate and store a new goal, then push it right away. A failed
    /// push leaves it dirty, arms a retry and broadcasts
    /// [`SyncNotice::SaveFailed`].
    pub async fn create_goal(&self, mut goal: Goal) -> Result<Goal, SyncError> {
        let key = goal.key();
        {
            let mut state = self.open_state()?;
            if state.store.contains(&key) {
                return Err(SyncError::AlreadyExists(key));
            }
            check_goal(&state.store, &mut goal, None)?;
            goal.touch();
            state.store.insert(goal.clone().into());
            state.dirty.mark_dirty(EntityType::Goal, &goal.id);
        }
        self.inner.persist_local(&goal.clone().into());

        match self.inner.push(self.id, &key, PushMode::Immediate).await {
            PushOutcome::Failed(message) => {
                log::warn!("Could not save goal \"{}\": {}", goal.title, message);
                self.inner.notify(SyncNotice::SaveFailed {
                    key: key.clone(),
                    title: Some(goal.title.clone()),
                    message,
                });
                self.retry_later(key.clone());
            }
            PushOutcome::InFlight => self.retry_later(key.clone()),
            PushOutcome::Stale => return Err(SyncError::SessionClosed),
            _ => {}
        }
        Ok(self.goal(&key.id).unwrap_or(goal))
    }

    /// Apply `edit` to a stored goal and push the result immediately.
    pub async fn update_goal(&self, id: &str, edit: impl FnOnce(&mut Goal)) -> Result<Goal, SyncError> {
        let goal = self.apply_goal_edit(id, edit)?;
        let key = goal.key();
        match self.inner.push(self.id, &key, PushMode::Immediate).await {
            PushOutcome::Failed(message) => {
                log::debug!("Immediate save of {} failed: {}", key, message);
                self.retry_later(key.clone());
            }
            PushOutcome::InFlight => self.retry_later(key.clone()),
            PushOutcome::Stale => return Err(SyncError::SessionClosed),
            _ => {}
        }
        Ok(self.goal(id).unwrap_or(goal))
    }

    /// Apply `edit` and leave the push to the debounce timer, so a burst of
    /// keystrokes becomes one remote write. Needs a Tokio runtime.
    pub fn edit_goal(&self, id: &str, edit: impl FnOnce(&mut Goal)) -> Result<Goal, SyncError> {
        let goal = self.apply_goal_edit(id, edit)?;
        let mut state = self.open_state()?;
        self.inner.schedule(&mut state, self.id, goal.key());
        Ok(goal)
    }

    fn apply_goal_edit(&self, id: &str, edit: impl FnOnce(&mut Goal)) -> Result<Goal, SyncError> {
        let key = EntityKey::goal(id);
        let goal = {
            let mut state = self.open_state()?;
            let Some(existing) = state.store.get_goal(id) else {
                return Err(SyncError::NotFound(key));
            };
            let previous_level = existing.level;
            let mut goal = existing.clone();
            edit(&mut goal);
            goal.id = id.to_string();
            check_goal(&state.store, &mut goal, Some(previous_level))?;
            goal.touch();
            state.store.insert(goal.clone().into());
            state.dirty.mark_dirty(EntityType::Goal, id);
            // The caller pushes now or re-arms.
            state.scheduler.cancel(&key);
            goal
        };
        self.inner.persist_local(&goal.clone().into());
        Ok(goal)
    }

    /// Delete a goal. Its direct children are detached and re-saved so no
    /// goal is left pointing at a missing parent.
    pub async fn delete_goal(&self, id: &str) -> Result<(), SyncError> {
        let detached: Vec<Goal> = {
            let mut state = self.open_state()?;
            if state.store.get_goal(id).is_none() {
                return Err(SyncError::NotFound(EntityKey::goal(id)));
            }
            let child_ids: Vec<String> = hierarchy::children_of(&state.store, id)
                .into_iter()
                .map(|g| g.id.clone())
                .collect();
            let mut detached = Vec::new();
            for child_id in child_ids {
                if let Some(child) = state.store.get_goal_mut(&child_id) {
                    child.parent = ParentLink::None;
                    child.parent_level = None;
                    child.touch();
                    detached.push(child.clone());
                }
                state.dirty.mark_dirty(EntityType::Goal, &child_id);
                self.inner.schedule(&mut state, self.id, EntityKey::goal(child_id));
            }
            detached
        };
        for child in &detached {
            log::debug!("Detached goal {} from deleted parent {}", child.id, id);
            self.inner.persist_local(&child.clone().into());
        }
        self.delete_record(EntityType::Goal, id).await
    }

    // --- Any record ---

    /// Store a record of any type and schedule its push by the type's
    /// policy: debounced per record, or throttled per type for aggregates.
    /// Goals are validated like in [`Self::edit_goal`]. Needs a Tokio runtime.
    pub fn save_record(&self, record: impl Into<Entity>) -> Result<(), SyncError> {
        let mut record: Entity = record.into();
        let key = record.key();
        {
            let mut state = self.open_state()?;
            if let Entity::Goal(goal) = &mut record {
                let previous = state.store.get_goal(&goal.id).map(|g| g.level);
                check_goal(&state.store, goal, previous)?;
            }
            record.touch();
            state.store.insert(record.clone());
            state.dirty.mark_dirty(key.entity_type, &key.id);
            self.inner.schedule(&mut state, self.id, key);
        }
        self.inner.persist_local(&record);
        Ok(())
    }

    /// Remove a record everywhere. Local removal is immediate; the remote
    /// delete is best effort and, while offline, buffered once.
    pub async fn delete_record(&self, entity_type: EntityType, id: &str) -> Result<(), SyncError> {
        let key = EntityKey::new(entity_type, id);
        let online = {
            let mut state = self.open_state()?;
            if state.store.remove(&key).is_none() {
                return Err(SyncError::NotFound(key));
            }
            state.scheduler.cancel(&key);
            state.dirty.forget(entity_type, id);
            state.queue.discard(&key);
            if !state.online {
                state.queue.buffer(QueuedWrite::Delete(key.clone()));
            }
            state.online
        };
        self.inner.remove_local(&key);

        if online {
            if let Err(e) = self.inner.remote_delete(&key).await {
                log::warn!("Failed to delete {} remotely: {}", key, e);
            }
        }
        Ok(())
    }

    // --- Sync passes ---

    /// Cancel every timer and push all dirty records now, waiting for the
    /// writes to finish. Buffered deletes are sent once. Offline, nothing
    /// is sent and the buffer is kept.
    pub async fn force_sync(&self) -> Result<SyncReport, SyncError> {
        let report = self.flush_all().await?;
        Ok(self.finish(report))
    }

    /// Pull every entity type, resolve conflicts (remote wins when newer
    /// beyond the skew tolerance) and mark records the remote lacks or has
    /// older copies of as dirty. Does not push.
    pub async fn reconcile(&self) -> Result<SyncReport, SyncError> {
        {
            let mut state = self.open_state()?;
            if !state.online {
                return Err(SyncError::Offline);
            }
            state.status = SyncStatus::Syncing;
        }

        let mut report = SyncReport::default();
        for entity_type in EntityType::ALL {
            let remote = match self.inner.remote.fetch_all(entity_type).await {
                Ok(records) => records,
                Err(e) => {
                    log::warn!("Failed to fetch {} records: {}", entity_type, e);
                    report.errors.push(format!("{}: {}", entity_type, e));
                    continue;
                }
            };

            let (conflicts, adopted) = {
                let mut guard = self.open_state()?;
                let state = &mut *guard;
                // Deleted here while offline; the buffered delete wins.
                let remote: Vec<Entity> = remote
                    .into_iter()
                    .filter(|record| !state.queue.has_pending_delete(&record.key()))
                    .collect();
                let steps = reconcile::plan(entity_type, &state.store, remote, &self.inner.conflicts, |key| {
                    state.dirty.is_dirty(key.entity_type, &key.id)
                });
                let summary = PlanSummary::of(&steps);
                if summary != PlanSummary::default() {
                    log::info!(
                        "Reconciled {}: {} new, {} replaced, {} conflicts, {} to push",
                        entity_type,
                        summary.inserted,
                        summary.replaced,
                        summary.conflicts,
                        summary.to_push
                    );
                }
                report.pulled += summary.pulled();

                let mut conflicts = Vec::new();
                let mut adopted = Vec::new();
                for step in steps {
                    match step {
                        Step::Insert(record) | Step::Replace(record) => adopted.push(record),
                        Step::TakeRemote {
                            remote,
                            local_updated_at,
                            title,
                        } => {
                            conflicts.push((remote.key(), local_updated_at, remote.updated_at(), title));
                            adopted.push(remote);
                        }
                        Step::PushLocal(key) => state.dirty.mark_dirty(key.entity_type, &key.id),
                        Step::Unchanged(_) => {}
                    }
                }
                for record in &adopted {
                    let key = record.key();
                    state.scheduler.cancel(&key);
                    state.queue.discard(&key);
                    state.dirty.mark_clean(key.entity_type, &key.id);
                    state.store.insert(record.clone());
                }
                (conflicts, adopted)
            };

            for (key, local_at, remote_at, title) in conflicts {
                if self
                    .inner
                    .conflicts
                    .detect_conflict(key.entity_type, &key.id, local_at, remote_at, title.as_deref())
                    .is_some()
                {
                    report.conflicts += 1;
                }
            }
            for record in &adopted {
                self.inner.persist_local(record);
            }
        }

        let mut state = self.open_state()?;
        for (id, problem) in hierarchy::validate_all(&state.store) {
            log::warn!("Goal {} failed validation after sync: {}", id, problem);
        }
        state.status = match report.errors.first() {
            None => SyncStatus::LastSynced(Utc::now()),
            Some(e) => SyncStatus::Error(e.clone()),
        };
        Ok(report)
    }

    /// Reconcile with the remote, then push everything dirty.
    pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
        let mut report = match self.reconcile().await {
            Ok(report) => report,
            Err(SyncError::Offline) => return Err(SyncError::Offline),
            Err(e) => {
                self.set_status_if_open(SyncStatus::Error(e.to_string()));
                return Err(e);
            }
        };
        report.merge(self.flush_all().await?);
        Ok(self.finish(report))
    }

    /// Come back online and run a full sync.
    pub async fn reconnect(&self) -> Result<SyncReport, SyncError> {
        {
            let mut state = self.open_state()?;
            state.online = true;
            state.status = SyncStatus::Idle;
        }
        log::info!("Back online, syncing");
        self.sync_now().await
    }

    /// Stop talking to the remote. Pushes are buffered until
    /// [`Self::reconnect`] or [`Self::force_sync`] after going online.
    pub fn set_offline(&self) {
        let mut state = self.inner.state();
        if state.is_current(self.id) {
            state.online = false;
            state.status = SyncStatus::Offline;
            log::info!("Sync session {} offline", self.id);
        }
    }

    pub fn is_online(&self) -> bool {
        self.inner.state().online
    }

    async fn flush_all(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let (writes, dirty) = {
            let mut state = self.open_state()?;
            state.scheduler.cancel_all();
            if !state.online {
                log::info!("Offline, keeping {} buffered writes", state.queue.len());
                report.failed = state.dirty.stats().total_dirty;
                return Ok(report);
            }
            state.status = SyncStatus::Syncing;
            (state.queue.drain(), state.dirty.all_dirty())
        };

        // Buffered upserts are covered by the dirty set.
        for write in writes {
            if let QueuedWrite::Delete(key) = write {
                match self.inner.remote_delete(&key).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => {
                        log::warn!("Dropping buffered delete of {}: {}", key, e);
                        report.errors.push(format!("{}: {}", key, e));
                    }
                }
            }
        }

        let mut pushes = Vec::with_capacity(dirty.len());
        for key in &dirty {
            pushes.push(self.inner.push(self.id, key, PushMode::Forced));
        }
        let outcomes = join_all(pushes).await;
        for (key, outcome) in dirty.iter().zip(outcomes) {
            match outcome {
                PushOutcome::Pushed => report.pushed += 1,
                PushOutcome::Failed(e) => {
                    log::warn!("Failed to push {}: {}", key, e);
                    report.errors.push(format!("{}: {}", key, e));
                }
                PushOutcome::Stale => return Err(SyncError::SessionClosed),
                _ => {}
            }
        }

        report.failed = self.open_state()?.dirty.stats().total_dirty;
        Ok(report)
    }

    fn finish(&self, report: SyncReport) -> SyncReport {
        {
            let mut state = self.inner.state();
            if !state.is_current(self.id) {
                return report;
            }
            state.status = if !state.online {
                SyncStatus::Offline
            } else if report.is_clean() {
                SyncStatus::LastSynced(Utc::now())
            } else {
                SyncStatus::Error(format!("{} records not saved", report.failed.max(report.errors.len())))
            };
        }
        log::info!(
            "Sync finished: pulled {}, pushed {}, deleted {}, conflicts {}, still dirty {}",
            report.pulled,
            report.pushed,
            report.deleted,
            report.conflicts,
            report.failed
        );
        self.inner.notify(SyncNotice::SyncCompleted(report.clone()));
        report
    }

    fn set_status_if_open(&self, status: SyncStatus) {
        let mut state = self.inner.state();
        if state.is_current(self.id) {
            state.status = status;
        }
    }

    fn retry_later(&self, key: EntityKey) {
        let mut state = self.inner.state();
        if state.is_current(self.id) {
            self.inner.schedule(&mut state, self.id, key);
        }
    }

    /// Tear the session down, as on logout: timers are cancelled, queued
    /// writes and all in-memory state are discarded, and responses to
    /// writes still in flight are ignored. Idempotent.
    pub fn destroy(&self) {
        let mut state = self.inner.state();
        if state.session_id.take().is_none() {
            return;
        }
        let cancelled = state.scheduler.cancel_all();
        state.scheduler.reset();
        state.queue.clear();
        state.dirty.clear_all();
        state.store.clear();
        state.status = SyncStatus::Idle;
        drop(state);
        self.inner.conflicts.clear_conflicts();
        log::info!("Closed sync session {} ({} timers cancelled)", self.id, cancelled);
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.state().is_current(self.id)
    }

    // --- Reading ---

    pub fn goal(&self, id: &str) -> Option<Goal> {
        self.inner.state().store.get_goal(id).cloned()
    }

    /// All goals, oldest first.
    pub fn goals(&self) -> Vec<Goal> {
        let state = self.inner.state();
        let mut goals: Vec<Goal> = state.store.goals().into_iter().cloned().collect();
        goals.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        goals
    }

    pub fn children_of(&self, id: &str) -> Vec<Goal> {
        let state = self.inner.state();
        hierarchy::children_of(&state.store, id).into_iter().cloned().collect()
    }

    pub fn get(&self, key: &EntityKey) -> Option<Entity> {
        self.inner.state().store.get(key).cloned()
    }

    pub fn records(&self, entity_type: EntityType) -> Vec<Entity> {
        self.inner
            .state()
            .store
            .list(entity_type)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn goal_date_range(&self, id: &str) -> Option<DateRange> {
        let state = self.inner.state();
        let goal = state.store.get_goal(id)?;
        date_range::date_range(goal, &state.store)
    }

    pub fn goals_active_in(&self, window: &DateRange) -> Vec<Goal> {
        let state = self.inner.state();
        date_range::goals_active_in(&state.store, window)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn is_dirty(&self, key: &EntityKey) -> bool {
        self.inner.state().dirty.is_dirty(key.entity_type, &key.id)
    }

    pub fn dirty_stats(&self) -> DirtyStats {
        self.inner.state().dirty.stats()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.state().status.clone()
    }

    /// Writes waiting for connectivity, oldest first.
    pub fn pending_writes(&self) -> Vec<QueuedWrite> {
        self.inner.state().queue.buffered().cloned().collect()
    }

    /// Armed debounce and trailing throttle timers.
    pub fn pending_timers(&self) -> usize {
        self.inner.state().scheduler.pending_count()
    }

    pub fn conflicts(&self) -> &ConflictDetector {
        &self.inner.conflicts
    }

    pub fn recent_conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.conflicts.recent_conflicts()
    }

    pub fn on_conflict<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConflictRecord) + Send + Sync + 'static,
    {
        self.inner.conflicts.on_conflict(callback)
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.inner.notices.subscribe()
    }
}

impl<R: RemoteStore, L: LocalStore> Drop for SyncSession<R, L> {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        if state.is_current(self.id) {
            state.session_id = None;
            state.scheduler.reset();
        }
    }
}

/// Validate a goal's parent link against the store and stamp its
/// `parent_level`. When the level changes, existing children must still
/// accept it.
fn check_goal(store: &EntityStore, goal: &mut Goal, previous_level: Option<GoalLevel>) -> Result<(), HierarchyError> {
    let parent = hierarchy::ensure_valid_parent_link(store, &goal.id, goal.level, goal.parent_id())?;
    goal.parent_level = parent.map(|p| p.level);
    if previous_level.is_some_and(|level| level != goal.level) {
        hierarchy::ensure_children_accept_level(store, &goal.id, goal.level)?;
    }
    Ok(())
}
