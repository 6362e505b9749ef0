/*
Care-task engine.

Wires the pieces together for one user:

  profiles -> generator -> store -> cache loader (+ environmental adjust)
           -> focus-window cache -> notification scheduler -> sink

plus the optimistic synchronizer for the notification feed. One engine
instance owns its cache, scheduler state and maintenance ticker; nothing
is process-global.
*/

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{Days, Duration, NaiveDate};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, CacheRead, FocusWindowCache, TaskLoader};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::environment::{AdjustmentRules, adjust_all};
use crate::error::{EngineError, Result};
use crate::generator::{plan_for_plant, sort_tasks};
use crate::models::{EnvironmentalReading, Task};
use crate::notifier::{NotificationScheduler, ScheduleReport};
use crate::preferences::NotificationPreferences;
use crate::profiles::ProfileStore;
use crate::sink::{NotificationId, NotificationSink};
use crate::store::{
    CompletionFilter, DateRange, JsonStore, NotificationPage, NotificationStore, PlantFilter,
    PreferenceSource, ReadFilter, TaskStore,
};
use crate::sync::{MultiViewCache, OptimisticSync};
use crate::ticker::Ticker;
use crate::window::{FocusWindow, PrefetchDirection};

pub const FEED_VIEW: &str = "feed";

// Collaborators the engine talks to.
pub struct Collaborators {
    pub tasks: Arc<dyn TaskStore>,
    pub notifications: Arc<dyn NotificationStore>,
    pub preferences: Arc<dyn PreferenceSource>,
    pub sink: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    // All three store seams backed by one JSON document.
    pub fn json(
        store: Arc<JsonStore>,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tasks: store.clone(),
            notifications: store.clone(),
            preferences: store,
            sink,
            clock,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FocusWindowTasks {
    pub window: FocusWindow,
    pub by_date: BTreeMap<NaiveDate, Vec<Task>>,
    pub pending: Vec<NaiveDate>, // days another caller is still loading
}

impl FocusWindowTasks {
    pub fn all_tasks(&self) -> Vec<Task> {
        self.by_date.values().flatten().cloned().collect()
    }
}

// Shared "latest reading" slot; rewrites tasks on their way out of the store.
#[derive(Clone)]
struct Adjuster {
    rules: AdjustmentRules,
    reading: Arc<RwLock<Option<EnvironmentalReading>>>,
}

impl Adjuster {
    fn apply(&self, tasks: Vec<Task>) -> Vec<Task> {
        let reading = self
            .reading
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match reading {
            Some(reading) => adjust_all(&tasks, &reading, &self.rules),
            None => tasks,
        }
    }

    // Stored days whose tasks can land on `date` once adjusted.
    fn source_range(&self, date: NaiveDate) -> DateRange {
        let margin = Days::new(self.rules.max_shift_days());
        DateRange {
            start: date.checked_sub_days(margin).unwrap_or(date),
            end: date.checked_add_days(margin).unwrap_or(date),
        }
    }
}

struct StoreLoader {
    store: Arc<dyn TaskStore>,
    adjuster: Adjuster,
}

// Cache entries hold the tasks whose adjusted due date is the key's date.
#[async_trait]
impl TaskLoader for StoreLoader {
    async fn load(&self, key: CacheKey) -> Result<Vec<Task>> {
        let tasks = self
            .store
            .fetch_tasks(self.adjuster.source_range(key.date), key.plant, key.completion)
            .await?;
        let mut tasks = self.adjuster.apply(tasks);
        tasks.retain(|t| t.due_at.date_naive() == key.date);
        Ok(tasks)
    }
}

pub struct Engine {
    config: EngineConfig,
    profiles: ProfileStore,
    clock: Arc<dyn Clock>,
    tasks: Arc<dyn TaskStore>,
    preferences: Arc<dyn PreferenceSource>,
    adjuster: Adjuster,
    cache: Arc<FocusWindowCache>,
    scheduler: NotificationScheduler,
    sync: OptimisticSync,
    focus: Mutex<Option<FocusWindow>>,
    ticker: Mutex<Option<Ticker>>,
}

impl Engine {
    pub fn new(config: EngineConfig, profiles: ProfileStore, parts: Collaborators) -> Self {
        let adjuster = Adjuster {
            rules: config.rules.clone(),
            reading: Arc::new(RwLock::new(None)),
        };
        let loader = Arc::new(StoreLoader {
            store: Arc::clone(&parts.tasks),
            adjuster: adjuster.clone(),
        });
        let cache = Arc::new(FocusWindowCache::new(
            config.cache.clone(),
            Arc::clone(&parts.clock),
            loader,
        ));
        let sync = OptimisticSync::new(Arc::new(MultiViewCache::new()), parts.notifications);

        Self {
            config,
            profiles,
            clock: parts.clock,
            tasks: parts.tasks,
            preferences: parts.preferences,
            adjuster,
            cache,
            scheduler: NotificationScheduler::new(parts.sink),
            sync,
            focus: Mutex::new(None),
            ticker: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<FocusWindowCache> {
        &self.cache
    }

    pub fn scheduler(&self) -> &NotificationScheduler {
        &self.scheduler
    }

    pub fn views(&self) -> &Arc<MultiViewCache> {
        self.sync.views()
    }

    pub fn focus(&self) -> Option<FocusWindow> {
        *self.focus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --------------------------------------------------
    // Focus window
    // --------------------------------------------------

    // Tasks of the window centred on `date`, grouped by day, each day in
    // display order.
    pub async fn focus_window_tasks(&self, date: NaiveDate) -> Result<FocusWindowTasks> {
        let window = FocusWindow::around(date, self.config.window_size);
        self.window_tasks(window).await
    }

    // Move the focus to `date`: warm the next days in the direction of
    // travel and bring notifications in line with the new window.
    pub async fn update_focus(&self, date: NaiveDate) -> Result<ScheduleReport> {
        let window = FocusWindow::around(date, self.config.window_size);
        let previous = self
            .focus
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(window);
        let direction = previous
            .map(|p| p.direction_to(&window))
            .unwrap_or(PrefetchDirection::Both);

        let view = self.window_tasks(window).await?;
        self.cache
            .prefetch(&window, direction, PlantFilter::All, CompletionFilter::All);

        let prefs = self.current_preferences().await?;
        let report = self
            .scheduler
            .sync_window(&view.all_tasks(), &window, &prefs, self.clock.now())
            .await;
        info!(
            start = %window.start,
            size = window.size,
            direction = ?direction,
            scheduled = report.scheduled.len(),
            "focus updated"
        );
        Ok(report)
    }

    async fn window_tasks(&self, window: FocusWindow) -> Result<FocusWindowTasks> {
        let mut by_date = BTreeMap::new();
        let mut pending = Vec::new();
        for day in window.days() {
            match self
                .cache
                .get(day, PlantFilter::All, CompletionFilter::All)
                .await?
            {
                CacheRead::Ready(tasks) => {
                    // the background sort may not have run yet
                    let mut tasks = tasks.as_ref().clone();
                    sort_tasks(&mut tasks);
                    by_date.insert(day, tasks);
                }
                CacheRead::Pending => {
                    debug!(%day, "day still loading");
                    by_date.insert(day, Vec::new());
                    pending.push(day);
                }
            }
        }
        Ok(FocusWindowTasks {
            window,
            by_date,
            pending,
        })
    }

    // --------------------------------------------------
    // Plant scheduling and task lifecycle
    // --------------------------------------------------

    // Generate stage tasks and recurrences for the next `horizon_days`
    // (config default when None). Tasks already planned for the same kind
    // and day are not duplicated.
    pub async fn schedule_for_plant(
        &self,
        plant_id: Uuid,
        horizon_days: Option<u32>,
    ) -> Result<Vec<Task>> {
        let plant = self
            .tasks
            .fetch_plant(plant_id)
            .await?
            .ok_or_else(|| EngineError::not_found("plant", plant_id))?;
        let horizon_days = horizon_days.unwrap_or(self.config.horizon_days);
        let now = self.clock.now();

        let planned = plan_for_plant(&self.profiles, &plant, horizon_days, now);
        let range = DateRange {
            start: now.date_naive(),
            end: now
                .date_naive()
                .checked_add_days(Days::new(u64::from(horizon_days)))
                .unwrap_or(now.date_naive()),
        };
        let existing: HashSet<_> = self
            .tasks
            .fetch_tasks(range, PlantFilter::Plant(plant_id), CompletionFilter::Pending)
            .await?
            .into_iter()
            .map(|t| (t.kind, t.due_at.date_naive()))
            .collect();
        let fresh: Vec<Task> = planned
            .into_iter()
            .filter(|t| !existing.contains(&(t.kind, t.due_at.date_naive())))
            .collect();

        self.tasks.upsert_tasks(&fresh).await?;
        self.cache.invalidate_all();
        info!(
            plant = %plant.id,
            stage = ?plant.stage,
            genetics = ?plant.genetics,
            horizon_days,
            created = fresh.len(),
            "plant scheduled"
        );
        Ok(fresh)
    }

    pub async fn complete_task(&self, task_id: Uuid) -> Result<Task> {
        let task = self
            .tasks
            .complete_task(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        self.close_task(&task).await;
        Ok(task)
    }

    pub async fn delete_task(&self, task_id: Uuid) -> Result<Task> {
        let task = self
            .tasks
            .delete_task(task_id)
            .await?
            .ok_or_else(|| EngineError::not_found("task", task_id))?;
        self.close_task(&task).await;
        Ok(task)
    }

    async fn close_task(&self, task: &Task) {
        let report = self.scheduler.cancel_task(task.id).await;
        // the cached copy may sit on a neighbouring day once adjusted
        let range = self.adjuster.source_range(task.due_at.date_naive());
        for day in range.start.iter_days().take_while(|d| *d <= range.end) {
            self.cache.invalidate_date(day);
        }
        debug!(task = %task.id, canceled = report.canceled.len(), "task closed");
    }

    // Latest environmental reading. Cached days are dropped so the next
    // focus update sees the rewritten due times.
    pub fn record_readings(&self, reading: EnvironmentalReading) -> Result<()> {
        if !(0.0..=100.0).contains(&reading.humidity_pct) {
            return Err(EngineError::validation("humidity_pct", "must be within 0..=100"));
        }
        if reading.ph.is_some_and(|ph| !(0.0..=14.0).contains(&ph)) {
            return Err(EngineError::validation("ph", "must be within 0..=14"));
        }
        info!(
            temperature_c = reading.temperature_c,
            humidity_pct = reading.humidity_pct,
            ph = ?reading.ph,
            condition = ?reading.condition,
            "reading recorded"
        );
        *self
            .adjuster
            .reading
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(reading);
        self.cache.invalidate_all();
        Ok(())
    }

    // Observe passed deliveries and remind about overdue tasks once.
    pub async fn process_overdue(&self) -> Result<ScheduleReport> {
        let now = self.clock.now();
        let today = now.date_naive();
        let range = DateRange {
            start: today
                .checked_sub_days(Days::new(u64::from(self.config.horizon_days)))
                .unwrap_or(today),
            // adjusted due times can move a later task into the past
            end: self.adjuster.source_range(today).end,
        };
        let tasks = self
            .tasks
            .fetch_tasks(range, PlantFilter::All, CompletionFilter::Pending)
            .await?;
        let tasks = self.adjuster.apply(tasks);
        let prefs = self.current_preferences().await?;
        Ok(self.scheduler.process_overdue(&tasks, &prefs, now).await)
    }

    // The OS side reports that a notification fired.
    pub async fn mark_delivered(&self, id: &NotificationId) -> bool {
        let delivered = self.scheduler.mark_delivered(id).await;
        debug!(%id, delivered, "delivery reported");
        delivered
    }

    async fn current_preferences(&self) -> Result<NotificationPreferences> {
        let stored = self.preferences.current_preferences().await?;
        Ok(NotificationPreferences::from_stored(&stored))
    }

    // --------------------------------------------------
    // Notification feed
    // --------------------------------------------------

    pub async fn mark_read(&self, id: Uuid, is_read: bool) -> Result<()> {
        self.sync.mark_read(id, is_read).await
    }

    pub async fn mark_all_read(&self) -> Result<()> {
        self.sync.mark_all_read(&self.config.user_id).await
    }

    pub async fn load_notifications(
        &self,
        cursor: Option<usize>,
        page_size: usize,
        read: ReadFilter,
    ) -> Result<NotificationPage> {
        self.sync
            .load_page(FEED_VIEW, &self.config.user_id, cursor, page_size, read)
            .await
    }

    // --------------------------------------------------
    // Maintenance
    // --------------------------------------------------

    pub fn start(self: &Arc<Self>) {
        let period = std::time::Duration::from_secs(self.config.cache.maintenance_interval_secs);
        let weak = Arc::downgrade(self);
        let ticker = Ticker::start("maintenance", period, move || {
            let weak = weak.clone();
            async move {
                if let Some(engine) = weak.upgrade() {
                    engine.maintain().await;
                }
            }
        });
        let old = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ticker);
        if old.is_some() {
            warn!("maintenance ticker restarted");
        }
    }

    pub async fn stop(&self) {
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            ticker.stop().await;
        }
        self.cache.settle().await;
    }

    // One maintenance pass: cache eviction, sink retries, overdue sweep,
    // a re-sync of the current focus window and pruning of finished
    // notification state older than the overdue lookback.
    pub async fn maintain(&self) {
        let evicted = self.cache.evict();
        let retried = self.scheduler.retry_pending().await;

        let mut report = match self.process_overdue().await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "overdue sweep failed");
                ScheduleReport::default()
            }
        };
        report.merge(retried);

        if let Some(window) = self.focus() {
            let resync = async {
                let view = self.window_tasks(window).await?;
                let prefs = self.current_preferences().await?;
                Ok::<_, EngineError>(
                    self.scheduler
                        .sync_window(&view.all_tasks(), &window, &prefs, self.clock.now())
                        .await,
                )
            };
            match resync.await {
                Ok(r) => report.merge(r),
                Err(e) => warn!(error = %e, "focus re-sync failed"),
            }
        }

        let lookback = Duration::days(i64::from(self.config.horizon_days));
        let pruned = self.scheduler.prune(self.clock.now() - lookback).await;

        debug!(
            evicted,
            pruned,
            scheduled = report.scheduled.len(),
            delivered = report.delivered,
            failed = report.failed,
            "maintenance pass"
        );
    }

    // Wait for background cache work (tests, shutdown).
    pub async fn settle(&self) {
        self.cache.settle().await;
    }
}
