/*
Focus-window task cache.

Bounded, time-keyed cache of task lists for a sliding window of days.

- An entry older than the TTL is treated as absent.
- At most one load per key is in flight. Callers that hit an in-flight
  marker get `CacheRead::Pending` instead of starting a second load. A
  marker older than `inflight_secs` is considered crashed and ignored.
- Sorting by priority/due time runs as a deferred continuation on an
  immutable snapshot. If the entry was replaced or invalidated meanwhile,
  the sorted result is dropped.
- Eviction drops idle entries first, then least-recently-accessed ones
  until the cache is back under capacity.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::generator::sort_tasks;
use crate::models::Task;
use crate::store::{CompletionFilter, PlantFilter};
use crate::window::{FocusWindow, PrefetchDirection};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: i64,
    pub idle_secs: i64,
    pub inflight_secs: i64,
    pub prefetch_days: u32,
    pub maintenance_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            ttl_secs: 5 * 60,
            idle_secs: 10 * 60,
            inflight_secs: 30,
            prefetch_days: 2,
            maintenance_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CacheKey {
    pub date: NaiveDate,
    pub plant: PlantFilter,
    pub completion: CompletionFilter,
}

impl CacheKey {
    pub fn new(date: NaiveDate, plant: PlantFilter, completion: CompletionFilter) -> Self {
        Self {
            date,
            plant,
            completion,
        }
    }
}

// Produces the task list for one key (store fetch + adjustment).
#[async_trait]
pub trait TaskLoader: Send + Sync {
    async fn load(&self, key: CacheKey) -> Result<Vec<Task>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheRead {
    Ready(Arc<Vec<Task>>),
    Pending, // another caller is loading this key
}

impl CacheRead {
    pub fn tasks(&self) -> &[Task] {
        match self {
            CacheRead::Ready(tasks) => tasks.as_slice(),
            CacheRead::Pending => &[],
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, CacheRead::Pending)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    tasks: Arc<Vec<Task>>,
    created_at: DateTime<FixedOffset>,
    last_access: DateTime<FixedOffset>,
    loading: bool,
    sorted: bool,
    ticket: u64, // identifies the load that produced this entry
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    next_ticket: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub resident: usize,
    pub loads: u64,
    pub hits: u64,
}

enum Begin {
    Hit(Arc<Vec<Task>>),
    Pending,
    Load(u64),
}

pub struct FocusWindowCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    loader: Arc<dyn TaskLoader>,
    state: Arc<Mutex<CacheState>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    loads: AtomicU64,
    hits: AtomicU64,
}

impl FocusWindowCache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>, loader: Arc<dyn TaskLoader>) -> Self {
        Self {
            config,
            clock,
            loader,
            state: Arc::new(Mutex::new(CacheState::default())),
            background: Mutex::new(Vec::new()),
            loads: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn get(
        &self,
        date: NaiveDate,
        plant: PlantFilter,
        completion: CompletionFilter,
    ) -> Result<CacheRead> {
        let key = CacheKey::new(date, plant, completion);
        let ticket = match self.begin(key) {
            Begin::Hit(tasks) => return Ok(CacheRead::Ready(tasks)),
            Begin::Pending => return Ok(CacheRead::Pending),
            Begin::Load(ticket) => ticket,
        };

        self.loads.fetch_add(1, Ordering::Relaxed);
        debug!(
            date = %key.date,
            plant = ?key.plant,
            completion = ?key.completion,
            "cache miss, loading"
        );
        match self.loader.load(key).await {
            Ok(tasks) => Ok(CacheRead::Ready(self.finish(key, ticket, tasks))),
            Err(e) => {
                self.abandon(key, ticket);
                Err(e)
            }
        }
    }

    // Warm the days just outside `window`. Failures are logged only.
    pub fn prefetch(
        self: &Arc<Self>,
        window: &FocusWindow,
        direction: PrefetchDirection,
        plant: PlantFilter,
        completion: CompletionFilter,
    ) {
        for date in window.adjacent(direction, self.config.prefetch_days) {
            let cache = Arc::clone(self);
            let handle = tokio::spawn(async move {
                if let Err(e) = cache.get(date, plant, completion).await {
                    warn!(%date, error = %e, "prefetch failed");
                }
            });
            self.track(handle);
        }
    }

    // Periodic / over-capacity maintenance. Returns how many entries went.
    pub fn evict(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.lock_state();
        evict_locked(&mut state, now, &self.config)
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.lock_state().entries.remove(key);
    }

    pub fn invalidate_date(&self, date: NaiveDate) {
        self.lock_state().entries.retain(|k, _| k.date != date);
    }

    pub fn invalidate_all(&self) {
        self.lock_state().entries.clear();
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        let ttl = Duration::seconds(self.config.ttl_secs);
        self.lock_state()
            .entries
            .get(key)
            .is_some_and(|e| !e.loading && now - e.created_at < ttl)
    }

    pub fn is_sorted(&self, key: &CacheKey) -> bool {
        self.lock_state().entries.get(key).is_some_and(|e| e.sorted)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            resident: self.lock_state().entries.len(),
            loads: self.loads.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }

    // Wait for outstanding background work (sorts, prefetches).
    pub async fn settle(&self) {
        loop {
            let handles = std::mem::take(
                &mut *self.background.lock().unwrap_or_else(PoisonError::into_inner),
            );
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "background cache task failed");
                }
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        background.retain(|h| !h.is_finished());
        background.push(handle);
    }

    fn begin(&self, key: CacheKey) -> Begin {
        let now = self.clock.now();
        let ttl = Duration::seconds(self.config.ttl_secs);
        let inflight = Duration::seconds(self.config.inflight_secs);
        let mut state = self.lock_state();

        if let Some(entry) = state.entries.get_mut(&key) {
            if entry.loading {
                if now - entry.created_at < inflight {
                    return Begin::Pending;
                }
                warn!(date = %key.date, "stale in-flight marker, reloading");
            } else if now - entry.created_at < ttl {
                entry.last_access = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Begin::Hit(Arc::clone(&entry.tasks));
            }
        }

        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.entries.insert(
            key,
            CacheEntry {
                tasks: Arc::new(Vec::new()),
                created_at: now,
                last_access: now,
                loading: true,
                sorted: false,
                ticket,
            },
        );
        Begin::Load(ticket)
    }

    fn finish(&self, key: CacheKey, ticket: u64, tasks: Vec<Task>) -> Arc<Vec<Task>> {
        let now = self.clock.now();
        let tasks = Arc::new(tasks);
        {
            let mut state = self.lock_state();
            let ours = state
                .entries
                .get(&key)
                .is_some_and(|e| e.loading && e.ticket == ticket);
            if !ours {
                // invalidated while loading: hand the result out, keep nothing
                debug!(date = %key.date, "load superseded, not caching");
                return tasks;
            }
            state.entries.insert(
                key,
                CacheEntry {
                    tasks: Arc::clone(&tasks),
                    created_at: now,
                    last_access: now,
                    loading: false,
                    sorted: false,
                    ticket,
                },
            );
            if state.entries.len() > self.config.capacity {
                evict_locked(&mut state, now, &self.config);
            }
        }
        self.schedule_sort(key, ticket, Arc::clone(&tasks));
        tasks
    }

    fn abandon(&self, key: CacheKey, ticket: u64) {
        let mut state = self.lock_state();
        if state.entries.get(&key).is_some_and(|e| e.ticket == ticket) {
            state.entries.remove(&key);
        }
    }

    // Sort one tick later, off the caller's path.
    fn schedule_sort(&self, key: CacheKey, ticket: u64, snapshot: Arc<Vec<Task>>) {
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            tokio::task::yield_now().await;
            let mut sorted = snapshot.as_ref().clone();
            sort_tasks(&mut sorted);

            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.entries.get_mut(&key) {
                Some(entry) if entry.ticket == ticket && Arc::ptr_eq(&entry.tasks, &snapshot) => {
                    entry.tasks = Arc::new(sorted);
                    entry.sorted = true;
                }
                _ => debug!(date = %key.date, "entry changed, dropping sorted result"),
            }
        });
        self.track(handle);
    }
}

fn evict_locked(state: &mut CacheState, now: DateTime<FixedOffset>, config: &CacheConfig) -> usize {
    let before = state.entries.len();
    let idle = Duration::seconds(config.idle_secs);
    let inflight = Duration::seconds(config.inflight_secs);

    state.entries.retain(|_, e| {
        if e.loading {
            now - e.created_at < inflight
        } else {
            now - e.last_access < idle
        }
    });

    if state.entries.len() > config.capacity {
        let mut ready: Vec<(CacheKey, DateTime<FixedOffset>)> = state
            .entries
            .iter()
            .filter(|(_, e)| !e.loading)
            .map(|(k, e)| (*k, e.last_access))
            .collect();
        ready.sort_by(|a, b| a.1.cmp(&b.1));
        let excess = state.entries.len() - config.capacity;
        for (key, _) in ready.into_iter().take(excess) {
            state.entries.remove(&key);
        }
    }

    let removed = before - state.entries.len();
    if removed > 0 {
        debug!(removed, resident = state.entries.len(), "cache eviction");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{Priority, TaskKind};
    use uuid::Uuid;

    struct FixedLoader {
        tasks: Vec<Task>,
    }

    #[async_trait]
    impl TaskLoader for FixedLoader {
        async fn load(&self, key: CacheKey) -> Result<Vec<Task>> {
            Ok(self
                .tasks
                .iter()
                .filter(|t| t.due_at.date_naive() == key.date)
                .cloned()
                .collect())
        }
    }

    fn start() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-05-01T08:00:00+00:00").unwrap()
    }

    fn task(priority: Priority, hours: i64) -> Task {
        Task {
            id: Uuid::new_v4(),
            plant_id: Uuid::nil(),
            kind: TaskKind::Inspection,
            due_at: start() + Duration::hours(hours),
            priority,
            completed: false,
            deleted: false,
            recurrence_seq: None,
        }
    }

    fn cache(config: CacheConfig, tasks: Vec<Task>) -> (Arc<ManualClock>, FocusWindowCache) {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = FocusWindowCache::new(config, clock.clone(), Arc::new(FixedLoader { tasks }));
        (clock, cache)
    }

    fn day(offset: u64) -> NaiveDate {
        start().date_naive() + chrono::Days::new(offset)
    }

    #[tokio::test]
    async fn background_sort_orders_resident_entry() {
        let (_clock, cache) = cache(
            CacheConfig::default(),
            vec![task(Priority::Low, 1), task(Priority::Critical, 3), task(Priority::High, 2)],
        );
        let key = CacheKey::new(day(0), PlantFilter::All, CompletionFilter::All);
        cache.get(day(0), PlantFilter::All, CompletionFilter::All).await.unwrap();
        cache.settle().await;
        assert!(cache.is_sorted(&key));

        let read = cache.get(day(0), PlantFilter::All, CompletionFilter::All).await.unwrap();
        let priorities: Vec<_> = read.tasks().iter().map(|t| t.priority).collect();
        assert_eq!(priorities, vec![Priority::Critical, Priority::High, Priority::Low]);
    }

    #[tokio::test]
    async fn ttl_expiry_forces_reload() {
        let (clock, cache) = cache(CacheConfig::default(), vec![task(Priority::Low, 1)]);
        cache.get(day(0), PlantFilter::All, CompletionFilter::All).await.unwrap();
        clock.advance(Duration::minutes(4));
        cache.get(day(0), PlantFilter::All, CompletionFilter::All).await.unwrap();
        assert_eq!(cache.stats().loads, 1);

        clock.advance(Duration::minutes(2));
        cache.get(day(0), PlantFilter::All, CompletionFilter::All).await.unwrap();
        assert_eq!(cache.stats().loads, 2);
    }

    #[tokio::test]
    async fn lru_eviction_keeps_recently_used() {
        let config = CacheConfig {
            capacity: 2,
            ..CacheConfig::default()
        };
        let (clock, cache) = cache(config, Vec::new());
        let f = (PlantFilter::All, CompletionFilter::All);
        cache.get(day(0), f.0, f.1).await.unwrap();
        clock.advance(Duration::seconds(10));
        cache.get(day(1), f.0, f.1).await.unwrap();
        clock.advance(Duration::seconds(10));
        // touch day 0 so day 1 becomes the oldest
        cache.get(day(0), f.0, f.1).await.unwrap();
        clock.advance(Duration::seconds(10));
        cache.get(day(2), f.0, f.1).await.unwrap();

        assert_eq!(cache.stats().resident, 2);
        assert!(cache.contains(&CacheKey::new(day(0), f.0, f.1)));
        assert!(!cache.contains(&CacheKey::new(day(1), f.0, f.1)));
        assert!(cache.contains(&CacheKey::new(day(2), f.0, f.1)));
    }

    #[tokio::test]
    async fn evict_spares_recent_entries_with_headroom() {
        let (clock, cache) = cache(CacheConfig::default(), Vec::new());
        let f = (PlantFilter::All, CompletionFilter::All);
        cache.get(day(0), f.0, f.1).await.unwrap();
        cache.get(day(1), f.0, f.1).await.unwrap();
        clock.advance(Duration::minutes(4));
        assert_eq!(cache.evict(), 0);
        assert_eq!(cache.stats().resident, 2);

        // idle past the long threshold
        clock.advance(Duration::minutes(7));
        assert_eq!(cache.evict(), 2);
    }

    #[tokio::test]
    async fn invalidation_during_sort_discards_result() {
        let tasks = vec![task(Priority::Low, 1), task(Priority::High, 2)];
        let (_clock, cache) = cache(CacheConfig::default(), tasks);
        let key = CacheKey::new(day(0), PlantFilter::All, CompletionFilter::All);
        cache.get(day(0), PlantFilter::All, CompletionFilter::All).await.unwrap();
        cache.invalidate(&key);
        cache.settle().await;
        assert!(!cache.is_sorted(&key));
        assert_eq!(cache.stats().resident, 0);
    }
}
