//! Debounce and throttle timers for outbound writes.
//!
//! Every armed timer is an explicit entry in an owned map holding the
//! spawned task's abort handle, so teardown can walk the maps and cancel
//! everything.
//!
//! A timer's callback is handed the entry's generation and must call
//! [`SyncScheduler::complete`] (or [`SyncScheduler::complete_throttle`])
//! before doing any I/O. Completion removes the entry, which means a later
//! re-arm or `cancel_all` never aborts a write that is already in flight.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::core::record::{EntityKey, EntityType};

struct ScheduledTask {
    handle: AbortHandle,
    generation: u64,
    fire_at: Instant,
}

#[derive(Default)]
struct ThrottleWindow {
    last_fired: Option<Instant>,
    /// Generation of a spawned leading fire that has not run yet.
    leading: Option<u64>,
    trailing: Option<ScheduledTask>,
}

/// What a throttle call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Window was open; the flush was spawned right away.
    FiredNow,
    /// A trailing flush was armed for the end of the window.
    Scheduled(Duration),
    /// A trailing flush was already armed; it will pick this change up.
    Coalesced,
}

pub struct SyncScheduler {
    debounce: Duration,
    throttle: Duration,
    debounced: HashMap<EntityKey, ScheduledTask>,
    throttled: HashMap<EntityType, ThrottleWindow>,
    next_generation: u64,
}

impl SyncScheduler {
    pub fn new(debounce: Duration, throttle: Duration) -> Self {
        Self {
            debounce,
            throttle,
            debounced: HashMap::new(),
            throttled: HashMap::new(),
            next_generation: 0,
        }
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Arm (or re-arm) the per-record timer with the default delay.
    pub fn debounce<F, Fut>(&mut self, key: EntityKey, fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.debounce_after(key, self.debounce, fire)
    }

    /// Reset the timer for `key`: any armed-but-unfired timer is aborted and
    /// replaced.
    pub fn debounce_after<F, Fut>(&mut self, key: EntityKey, delay: Duration, fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Some(existing) = self.debounced.remove(&key) {
            existing.handle.abort();
        }
        let generation = self.generation();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(generation).await;
        })
        .abort_handle();
        log::debug!("Debounce armed for {} ({:?})", key, delay);
        self.debounced.insert(
            key,
            ScheduledTask {
                handle,
                generation,
                fire_at: Instant::now() + delay,
            },
        );
        generation
    }

    /// Claim a fired debounce entry. False when it was re-armed or
    /// cancelled meanwhile; the caller must then do nothing.
    pub fn complete(&mut self, key: &EntityKey, generation: u64) -> bool {
        let current = self
            .debounced
            .get(key)
            .is_some_and(|task| task.generation == generation);
        if current {
            self.debounced.remove(key);
        }
        current
    }

    /// Fire at most once per window for `entity_type`. The first call in an
    /// open window fires immediately; later calls share one trailing fire.
    pub fn throttle<F, Fut>(&mut self, entity_type: EntityType, fire: F) -> ThrottleDecision
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = Instant::now();
        let window = self.throttle;
        let open = {
            let slot = self.throttled.entry(entity_type).or_default();
            if slot.trailing.is_some() {
                return ThrottleDecision::Coalesced;
            }
            slot.last_fired.is_none_or(|last| now.duration_since(last) >= window)
        };

        if open {
            let generation = self.generation();
            if let Some(slot) = self.throttled.get_mut(&entity_type) {
                slot.last_fired = Some(now);
                slot.leading = Some(generation);
            }
            log::debug!("Throttle open for {}, flushing now", entity_type);
            tokio::spawn(fire(generation));
            return ThrottleDecision::FiredNow;
        }

        let last = self
            .throttled
            .get(&entity_type)
            .and_then(|s| s.last_fired)
            .unwrap_or(now);
        let delay = (last + window).saturating_duration_since(now);
        self.arm_trailing(entity_type, delay, fire);
        ThrottleDecision::Scheduled(delay)
    }

    /// Arm a trailing fire after an explicit delay unless one is pending.
    pub fn throttle_after<F, Fut>(&mut self, entity_type: EntityType, delay: Duration, fire: F) -> bool
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self
            .throttled
            .get(&entity_type)
            .is_some_and(|s| s.trailing.is_some())
        {
            return false;
        }
        self.arm_trailing(entity_type, delay, fire);
        true
    }

    fn arm_trailing<F, Fut>(&mut self, entity_type: EntityType, delay: Duration, fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire(generation).await;
        })
        .abort_handle();
        log::debug!("Throttle trailing flush for {} in {:?}", entity_type, delay);
        self.throttled.entry(entity_type).or_default().trailing = Some(ScheduledTask {
            handle,
            generation,
            fire_at: Instant::now() + delay,
        });
    }

    /// Claim a trailing throttle fire; also starts the next window.
    pub fn complete_throttle(&mut self, entity_type: EntityType, generation: u64) -> bool {
        let Some(slot) = self.throttled.get_mut(&entity_type) else {
            return false;
        };
        if slot.leading == Some(generation) {
            slot.leading = None;
            return true;
        }
        let current = slot
            .trailing
            .as_ref()
            .is_some_and(|task| task.generation == generation);
        if current {
            slot.trailing = None;
            slot.last_fired = Some(Instant::now());
        }
        current
    }

    pub fn cancel(&mut self, key: &EntityKey) -> bool {
        match self.debounced.remove(key) {
            Some(task) => {
                task.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every armed timer. Returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = 0;
        for (_, task) in self.debounced.drain() {
            task.handle.abort();
            cancelled += 1;
        }
        for slot in self.throttled.values_mut() {
            if let Some(task) = slot.trailing.take() {
                task.handle.abort();
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            log::debug!("Cancelled {} pending sync timers", cancelled);
        }
        cancelled
    }

    /// Forget window history too, as for a brand new session.
    pub fn reset(&mut self) {
        self.cancel_all();
        self.throttled.clear();
    }

    pub fn is_pending(&self, key: &EntityKey) -> bool {
        self.debounced.contains_key(key)
    }

    pub fn is_throttle_pending(&self, entity_type: EntityType) -> bool {
        self.throttled
            .get(&entity_type)
            .is_some_and(|s| s.trailing.is_some())
    }

    pub fn pending_keys(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self.debounced.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Debounced keys whose timers should already have fired.
    pub fn due_keys(&self) -> Vec<EntityKey> {
        let now = Instant::now();
        let mut keys: Vec<EntityKey> = self
            .debounced
            .iter()
            .filter(|(_, t)| t.fire_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn pending_count(&self) -> usize {
        self.debounced.len()
            + self
                .throttled
                .values()
                .filter(|s| s.trailing.is_some())
                .count()
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
