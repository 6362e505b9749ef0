/*
Notification scheduler.

Per-notification state machine, keyed by `NotificationId`:

    Unscheduled -> Scheduled -> Delivered
                            \-> Canceled

- Scheduled: the task is open, due in the future and inside the focus
  window; the sink got a `notify` with the id as dedup key.
- Canceled: the task was completed/deleted or its due time was rewritten
  (the old id is canceled, the new one scheduled fresh).
- Delivered: observed once the delivery time has passed, or reported by
  the sink through `mark_delivered`.

A digest stands in for its members at the sink. Canceling any member
takes the digest down; the other open members are released and issued
again, regrouped or on their own. Delivering a digest delivers its
members.

A sink failure never changes state: the entry stays Scheduled with a
pending retry that is re-issued at the start of the next pass.
*/

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::generator::{overdue_tasks, sort_tasks};
use crate::models::Task;
use crate::preferences::NotificationPreferences;
use crate::sink::{NotificationId, NotificationRequest, NotificationSink};
use crate::window::FocusWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Unscheduled,
    Scheduled,
    Delivered,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkOp {
    Notify,
    Cancel,
}

#[derive(Debug, Clone)]
struct Tracked {
    task_id: Option<Uuid>, // None for digests
    state: DeliveryState,
    request: NotificationRequest,
    digest: Option<NotificationId>, // set when folded into a digest
    retry: Option<SinkOp>,
    overdue: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleReport {
    pub scheduled: Vec<NotificationId>,
    pub digests: Vec<NotificationId>,
    pub canceled: Vec<NotificationId>,
    pub suppressed: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl ScheduleReport {
    pub fn merge(&mut self, other: ScheduleReport) {
        self.scheduled.extend(other.scheduled);
        self.digests.extend(other.digests);
        self.canceled.extend(other.canceled);
        self.suppressed += other.suppressed;
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

type TrackedMap = BTreeMap<NotificationId, Tracked>;

pub struct NotificationScheduler {
    sink: Arc<dyn NotificationSink>,
    tracked: Mutex<TrackedMap>,
}

impl NotificationScheduler {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            sink,
            tracked: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn state_of(&self, id: &NotificationId) -> DeliveryState {
        self.tracked
            .lock()
            .await
            .get(id)
            .map(|t| t.state)
            .unwrap_or(DeliveryState::Unscheduled)
    }

    // Every id ever issued for a task, with its current state.
    pub async fn states_for_task(&self, task_id: Uuid) -> Vec<(NotificationId, DeliveryState)> {
        self.tracked
            .lock()
            .await
            .iter()
            .filter(|(_, t)| t.task_id == Some(task_id))
            .map(|(id, t)| (id.clone(), t.state))
            .collect()
    }

    // Bring the sink in line with the tasks currently in the focus window.
    pub async fn sync_window(
        &self,
        tasks: &[Task],
        window: &FocusWindow,
        prefs: &NotificationPreferences,
        now: DateTime<FixedOffset>,
    ) -> ScheduleReport {
        let mut tracked = self.tracked.lock().await;
        let mut report = ScheduleReport::default();
        self.retry_locked(&mut tracked, &mut report).await;

        // closed or rewritten tasks lose their old notification
        let mut released = Vec::new();
        for task in tasks {
            let current = NotificationId::for_task(task);
            let stale: Vec<NotificationId> = tracked
                .iter()
                .filter(|(_, t)| t.task_id == Some(task.id) && t.state == DeliveryState::Scheduled)
                .filter(|(id, t)| !task.is_open() || (**id != current && !t.overdue))
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                released.extend(self.cancel_locked(&mut tracked, &id, &mut report).await);
            }
        }
        // members of a dissolved digest that this pass does not see again
        for member in released {
            if !tasks.iter().any(|t| Some(t.id) == member.task_id) {
                self.issue(&mut tracked, member.request, member.task_id, false, &mut report)
                    .await;
            }
        }

        let mut fresh: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.is_open() && t.due_at > now && window.contains(t.due_at.date_naive()))
            .filter(|t| !is_live(&tracked, &NotificationId::for_task(t)))
            .collect();
        fresh.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.id.cmp(&b.id)));
        fresh.dedup_by_key(|t| t.id);

        let mut deliverable = Vec::with_capacity(fresh.len());
        for task in fresh {
            if prefs.should_deliver(task.kind, task.priority, task.due_at) {
                deliverable.push(task);
            } else {
                debug!(task_id = %task.id, kind = %task.kind, "suppressed by preferences");
                report.suppressed += 1;
            }
        }

        for cluster in clusters(&deliverable, prefs.batching_window_min) {
            if cluster.len() > prefs.max_batch_size {
                self.issue_digest(&mut tracked, &cluster, &mut report).await;
            } else {
                for task in cluster {
                    let request = task_request(task);
                    self.issue(&mut tracked, request, Some(task.id), false, &mut report)
                        .await;
                }
            }
        }

        if !report.scheduled.is_empty() || !report.canceled.is_empty() {
            info!(
                scheduled = report.scheduled.len(),
                digests = report.digests.len(),
                canceled = report.canceled.len(),
                suppressed = report.suppressed,
                "focus window synced"
            );
        }
        report
    }

    // Task completed or deleted: cancel everything issued for it.
    pub async fn cancel_task(&self, task_id: Uuid) -> ScheduleReport {
        let mut tracked = self.tracked.lock().await;
        let mut report = ScheduleReport::default();
        let ids: Vec<NotificationId> = tracked
            .iter()
            .filter(|(_, t)| t.task_id == Some(task_id) && t.state == DeliveryState::Scheduled)
            .map(|(id, _)| id.clone())
            .collect();
        let mut released = Vec::new();
        for id in ids {
            released.extend(self.cancel_locked(&mut tracked, &id, &mut report).await);
        }
        // the rest of a dissolved digest goes out one by one
        for member in released {
            self.issue(&mut tracked, member.request, member.task_id, false, &mut report)
                .await;
        }
        report
    }

    // The sink reported that a notification fired.
    pub async fn mark_delivered(&self, id: &NotificationId) -> bool {
        let mut tracked = self.tracked.lock().await;
        deliver_locked(&mut tracked, id)
    }

    // Observe deliveries whose time has passed, then send one immediate
    // reminder for each overdue task that was never notified.
    pub async fn process_overdue(
        &self,
        tasks: &[Task],
        prefs: &NotificationPreferences,
        now: DateTime<FixedOffset>,
    ) -> ScheduleReport {
        let mut tracked = self.tracked.lock().await;
        let mut report = ScheduleReport::default();
        self.retry_locked(&mut tracked, &mut report).await;

        let passed: Vec<NotificationId> = tracked
            .iter()
            .filter(|(_, t)| {
                t.state == DeliveryState::Scheduled
                    && t.retry.is_none()
                    && t.request.deliver_at <= now
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in passed {
            if deliver_locked(&mut tracked, &id) {
                report.delivered += 1;
            }
        }

        for task in overdue_tasks(tasks, now) {
            let regular = NotificationId::for_task(&task);
            let overdue_id = NotificationId::overdue(&task);
            if is_live(&tracked, &regular) || is_live(&tracked, &overdue_id) {
                continue;
            }
            if !prefs.should_deliver(task.kind, task.priority, now) {
                report.suppressed += 1;
                continue;
            }
            let mut request = task_request(&task);
            request.id = overdue_id;
            request.title = format!("{} overdue", task.kind.label());
            request.deliver_at = now;
            self.issue(&mut tracked, request, Some(task.id), true, &mut report).await;
        }
        report
    }

    // Forget finished entries whose delivery time is older than `before`.
    pub async fn prune(&self, before: DateTime<FixedOffset>) -> usize {
        let mut tracked = self.tracked.lock().await;
        let resident = tracked.len();
        tracked.retain(|_, t| {
            t.state == DeliveryState::Scheduled
                || t.retry.is_some()
                || t.request.deliver_at >= before
        });
        let pruned = resident - tracked.len();
        if pruned > 0 {
            debug!(pruned, resident = tracked.len(), "scheduler state pruned");
        }
        pruned
    }

    pub async fn retry_pending(&self) -> ScheduleReport {
        let mut tracked = self.tracked.lock().await;
        let mut report = ScheduleReport::default();
        self.retry_locked(&mut tracked, &mut report).await;
        report
    }

    async fn retry_locked(&self, tracked: &mut TrackedMap, report: &mut ScheduleReport) {
        let pending: Vec<(NotificationId, SinkOp)> = tracked
            .iter()
            .filter_map(|(id, t)| t.retry.map(|op| (id.clone(), op)))
            .collect();
        for (id, op) in pending {
            let Some(entry) = tracked.get_mut(&id) else {
                continue;
            };
            let outcome = match op {
                SinkOp::Notify => self.sink.notify(&entry.request).await,
                SinkOp::Cancel => self.sink.cancel(&id).await,
            };
            match outcome {
                Ok(()) => {
                    entry.retry = None;
                    match op {
                        SinkOp::Notify => report.scheduled.push(id),
                        SinkOp::Cancel => {
                            entry.state = DeliveryState::Canceled;
                            report.canceled.push(id);
                        }
                    }
                }
                Err(e) => {
                    warn!(%id, error = %e, "sink retry failed");
                    report.failed += 1;
                }
            }
        }
    }

    async fn issue(
        &self,
        tracked: &mut TrackedMap,
        request: NotificationRequest,
        task_id: Option<Uuid>,
        overdue: bool,
        report: &mut ScheduleReport,
    ) {
        let retry = match self.sink.notify(&request).await {
            Ok(()) => {
                report.scheduled.push(request.id.clone());
                None
            }
            Err(e) => {
                warn!(id = %request.id, error = %e, "sink rejected notification, will retry");
                report.failed += 1;
                Some(SinkOp::Notify)
            }
        };
        tracked.insert(
            request.id.clone(),
            Tracked {
                task_id,
                state: DeliveryState::Scheduled,
                request,
                digest: None,
                retry,
                overdue,
            },
        );
    }

    // `cluster` is ordered by due time.
    async fn issue_digest(
        &self,
        tracked: &mut TrackedMap,
        cluster: &[&Task],
        report: &mut ScheduleReport,
    ) {
        let digest_id = NotificationId::digest(cluster[0].due_at, cluster);
        let mut members: Vec<Task> = cluster.iter().map(|t| Task::clone(t)).collect();
        sort_tasks(&mut members);
        let request = digest_request(digest_id.clone(), cluster[0].due_at, &members);

        let before = report.scheduled.len();
        self.issue(tracked, request, None, false, report).await;
        if report.scheduled.len() > before {
            // counted as a digest, not a regular schedule
            report.scheduled.pop();
            report.digests.push(digest_id.clone());
        }

        for task in &members {
            tracked.insert(
                NotificationId::for_task(task),
                Tracked {
                    task_id: Some(task.id),
                    state: DeliveryState::Scheduled,
                    request: task_request(task),
                    digest: Some(digest_id.clone()),
                    retry: None,
                    overdue: false,
                },
            );
        }
    }

    // Cancel one id. For a digest member the digest is canceled at the
    // sink and its other open members are returned, untracked, so the
    // caller can issue them again.
    async fn cancel_locked(
        &self,
        tracked: &mut TrackedMap,
        id: &NotificationId,
        report: &mut ScheduleReport,
    ) -> Vec<Tracked> {
        let digest_id = match tracked.get(id) {
            Some(t) if t.state == DeliveryState::Scheduled => t.digest.clone(),
            _ => return Vec::new(),
        };
        let Some(digest_id) = digest_id else {
            self.cancel_at_sink(tracked, id, report).await;
            return Vec::new();
        };

        // never issued on its own, nothing to cancel at the sink
        if let Some(entry) = tracked.get_mut(id) {
            entry.state = DeliveryState::Canceled;
        }
        report.canceled.push(id.clone());

        let digest_live = tracked
            .get(&digest_id)
            .is_some_and(|d| d.state == DeliveryState::Scheduled);
        if !digest_live {
            return Vec::new();
        }
        self.cancel_at_sink(tracked, &digest_id, report).await;

        let members: Vec<NotificationId> = tracked
            .iter()
            .filter(|(_, t)| t.digest.as_ref() == Some(&digest_id))
            .filter(|(_, t)| t.state == DeliveryState::Scheduled)
            .map(|(id, _)| id.clone())
            .collect();
        debug!(digest = %digest_id, released = members.len(), "digest dissolved");
        members.iter().filter_map(|m| tracked.remove(m)).collect()
    }

    async fn cancel_at_sink(
        &self,
        tracked: &mut TrackedMap,
        id: &NotificationId,
        report: &mut ScheduleReport,
    ) {
        let Some(entry) = tracked.get_mut(id) else {
            return;
        };
        if entry.state != DeliveryState::Scheduled {
            return;
        }
        match self.sink.cancel(id).await {
            Ok(()) => {
                entry.state = DeliveryState::Canceled;
                entry.retry = None;
                report.canceled.push(id.clone());
            }
            Err(e) => {
                warn!(%id, error = %e, "sink rejected cancel, will retry");
                entry.retry = Some(SinkOp::Cancel);
                report.failed += 1;
            }
        }
    }
}

// Scheduled -> Delivered, cascading from a digest to its members.
fn deliver_locked(tracked: &mut TrackedMap, id: &NotificationId) -> bool {
    let Some(entry) = tracked.get_mut(id) else {
        return false;
    };
    if entry.state != DeliveryState::Scheduled {
        return false;
    }
    entry.state = DeliveryState::Delivered;
    if entry.task_id.is_none() {
        for member in tracked.values_mut().filter(|t| t.digest.as_ref() == Some(id)) {
            if member.state == DeliveryState::Scheduled {
                member.state = DeliveryState::Delivered;
            }
        }
    }
    true
}

fn is_live(tracked: &TrackedMap, id: &NotificationId) -> bool {
    matches!(
        tracked.get(id).map(|t| t.state),
        Some(DeliveryState::Scheduled | DeliveryState::Delivered)
    )
}

// Group tasks (sorted by due time) whose due times fall within
// `window_min` minutes of the first task of the group.
fn clusters<'a>(tasks: &[&'a Task], window_min: i64) -> Vec<Vec<&'a Task>> {
    let mut out: Vec<Vec<&'a Task>> = Vec::new();
    for task in tasks {
        match out.last_mut() {
            Some(group)
                if window_min > 0
                    && task.due_at - group[0].due_at <= Duration::minutes(window_min) =>
            {
                group.push(*task)
            }
            _ => out.push(vec![*task]),
        }
    }
    out
}

fn task_request(task: &Task) -> NotificationRequest {
    NotificationRequest {
        id: NotificationId::for_task(task),
        title: format!("{} due", task.kind.label()),
        body: format!(
            "{} ({} priority) is due at {}",
            task.kind.label(),
            task.priority.as_str(),
            task.due_at.format("%H:%M")
        ),
        payload: json!({
            "task_id": task.id,
            "plant_id": task.plant_id,
            "kind": task.kind,
            "priority": task.priority,
            "recurrence_seq": task.recurrence_seq,
        }),
        deliver_at: task.due_at,
    }
}

// Members arrive already in display order.
fn digest_request(
    id: NotificationId,
    deliver_at: DateTime<FixedOffset>,
    members: &[Task],
) -> NotificationRequest {
    NotificationRequest {
        id,
        title: format!("{} care tasks due", members.len()),
        body: members
            .iter()
            .map(|t| format!("{} ({})", t.kind.label(), t.priority.as_str()))
            .collect::<Vec<_>>()
            .join(", "),
        payload: json!({
            "digest": true,
            "task_ids": members.iter().map(|t| t.id).collect::<Vec<_>>(),
        }),
        deliver_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, Result};
    use crate::models::{Priority, TaskKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        notified: StdMutex<Vec<NotificationRequest>>,
        canceled: StdMutex<Vec<NotificationId>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, request: &NotificationRequest) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(EngineError::NotificationSink {
                    operation: "notify",
                    id: request.id.to_string(),
                    message: "permission revoked".into(),
                });
            }
            self.notified.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn cancel(&self, id: &NotificationId) -> Result<()> {
            self.canceled.lock().unwrap().push(id.clone());
            Ok(())
        }
    }

    fn now() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-05-01T09:00:00+00:00").unwrap()
    }

    fn task(kind: TaskKind, priority: Priority, hours: i64) -> Task {
        Task {
            id: Uuid::new_v4(),
            plant_id: Uuid::new_v4(),
            kind,
            due_at: now() + Duration::hours(hours),
            priority,
            completed: false,
            deleted: false,
            recurrence_seq: None,
        }
    }

    fn setup() -> (Arc<RecordingSink>, NotificationScheduler, FocusWindow) {
        let sink = Arc::new(RecordingSink::default());
        let scheduler = NotificationScheduler::new(sink.clone());
        (sink, scheduler, FocusWindow::around(now().date_naive(), 5))
    }

    #[tokio::test]
    async fn re_entering_window_never_double_schedules() {
        let (sink, scheduler, window) = setup();
        let prefs = NotificationPreferences::default();
        let tasks = vec![task(TaskKind::Watering, Priority::High, 3)];

        let first = scheduler.sync_window(&tasks, &window, &prefs, now()).await;
        let second = scheduler.sync_window(&tasks, &window, &prefs, now()).await;
        assert_eq!(first.scheduled.len(), 1);
        assert!(second.scheduled.is_empty());
        assert_eq!(sink.notified.lock().unwrap().len(), 1);
        assert_eq!(
            scheduler.state_of(&NotificationId::for_task(&tasks[0])).await,
            DeliveryState::Scheduled
        );
    }

    #[tokio::test]
    async fn past_and_out_of_window_tasks_are_skipped() {
        let (sink, scheduler, window) = setup();
        let tasks = vec![
            task(TaskKind::Watering, Priority::High, -1),
            task(TaskKind::Feeding, Priority::High, 24 * 9),
        ];
        let report = scheduler
            .sync_window(&tasks, &window, &NotificationPreferences::default(), now())
            .await;
        assert!(report.scheduled.is_empty());
        assert!(sink.notified.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rewritten_due_time_cancels_old_id() {
        let (sink, scheduler, window) = setup();
        let prefs = NotificationPreferences::default();
        let original = task(TaskKind::Feeding, Priority::Medium, 30);
        scheduler.sync_window(&[original.clone()], &window, &prefs, now()).await;

        let mut moved = original.clone();
        moved.due_at -= Duration::hours(12);
        let report = scheduler.sync_window(&[moved.clone()], &window, &prefs, now()).await;

        assert_eq!(report.canceled, vec![NotificationId::for_task(&original)]);
        assert_eq!(report.scheduled, vec![NotificationId::for_task(&moved)]);
        assert_eq!(*sink.canceled.lock().unwrap(), vec![NotificationId::for_task(&original)]);
        assert_eq!(
            scheduler.state_of(&NotificationId::for_task(&original)).await,
            DeliveryState::Canceled
        );
    }

    #[tokio::test]
    async fn completion_cancels() {
        let (_sink, scheduler, window) = setup();
        let t = task(TaskKind::Pruning, Priority::Low, 5);
        scheduler
            .sync_window(&[t.clone()], &window, &NotificationPreferences::default(), now())
            .await;
        let report = scheduler.cancel_task(t.id).await;
        assert_eq!(report.canceled.len(), 1);
        let states = scheduler.states_for_task(t.id).await;
        assert_eq!(states, vec![(NotificationId::for_task(&t), DeliveryState::Canceled)]);
    }

    #[tokio::test]
    async fn crowded_window_becomes_one_digest() {
        let (sink, scheduler, window) = setup();
        let prefs = NotificationPreferences {
            batching_window_min: 60,
            max_batch_size: 2,
            ..Default::default()
        };
        let base = now() + Duration::hours(4);
        let mut tasks: Vec<Task> = [Priority::Low, Priority::Critical, Priority::Medium]
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                let mut t = task(TaskKind::Inspection, p, 0);
                t.due_at = base + Duration::minutes(10 * i as i64);
                t
            })
            .collect();
        tasks.push(task(TaskKind::Watering, Priority::High, 30));

        let report = scheduler.sync_window(&tasks, &window, &prefs, now()).await;
        assert_eq!(report.digests.len(), 1);
        assert_eq!(report.scheduled.len(), 1);

        let notified = sink.notified.lock().unwrap().clone();
        assert_eq!(notified.len(), 2);
        let digest = notified.iter().find(|r| r.id == report.digests[0]).unwrap();
        assert_eq!(digest.title, "3 care tasks due");
        assert!(digest.body.starts_with("Inspection (critical)"));
        assert_eq!(digest.deliver_at, base);

        // members are tracked and not re-issued individually
        let again = scheduler.sync_window(&tasks, &window, &prefs, now()).await;
        assert!(again.scheduled.is_empty() && again.digests.is_empty());
    }

    fn live(sink: &RecordingSink) -> std::collections::BTreeSet<NotificationId> {
        let canceled = sink.canceled.lock().unwrap().clone();
        sink.notified
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.id.clone())
            .filter(|id| !canceled.contains(id))
            .collect()
    }

    fn batching() -> NotificationPreferences {
        NotificationPreferences {
            batching_window_min: 60,
            max_batch_size: 2,
            ..Default::default()
        }
    }

    // Three inspections ten minutes apart, a day out.
    fn trio() -> Vec<Task> {
        (0..3)
            .map(|i| {
                let mut t = task(TaskKind::Inspection, Priority::Medium, 24);
                t.due_at += Duration::minutes(10 * i);
                t
            })
            .collect()
    }

    #[tokio::test]
    async fn rewritten_members_take_their_digest_down() {
        let (sink, scheduler, window) = setup();
        let prefs = batching();
        let tasks = trio();
        let first = scheduler.sync_window(&tasks, &window, &prefs, now()).await;
        assert_eq!(first.digests.len(), 1);
        let old_digest = first.digests[0].clone();

        let moved: Vec<Task> = tasks
            .iter()
            .map(|t| {
                let mut m = t.clone();
                m.due_at -= Duration::hours(12);
                m
            })
            .collect();
        let second = scheduler.sync_window(&moved, &window, &prefs, now()).await;
        assert!(second.canceled.contains(&old_digest));
        assert_eq!(second.digests.len(), 1);
        assert_ne!(second.digests[0], old_digest);
        assert_eq!(live(&sink), [second.digests[0].clone()].into());

        // completing one member re-issues the other two on their own
        let report = scheduler.cancel_task(moved[0].id).await;
        assert!(report.canceled.contains(&second.digests[0]));
        assert_eq!(report.scheduled.len(), 2);
        for t in &moved[1..] {
            assert!(live(&sink).contains(&NotificationId::for_task(t)));
        }

        for t in &moved[1..] {
            scheduler.cancel_task(t.id).await;
        }
        assert!(live(&sink).is_empty());
    }

    #[tokio::test]
    async fn delivered_digest_delivers_its_members() {
        let (sink, scheduler, window) = setup();
        let tasks = trio();
        let report = scheduler.sync_window(&tasks, &window, &batching(), now()).await;
        let digest = report.digests[0].clone();

        assert!(scheduler.mark_delivered(&digest).await);
        assert!(!scheduler.mark_delivered(&digest).await);
        for t in &tasks {
            let state = scheduler.state_of(&NotificationId::for_task(t)).await;
            assert_eq!(state, DeliveryState::Delivered);
        }

        // nothing left to cancel once it fired
        let closed = scheduler.cancel_task(tasks[1].id).await;
        assert!(closed.canceled.is_empty() && closed.scheduled.is_empty());
        assert!(sink.canceled.lock().unwrap().is_empty());
        assert!(!scheduler.mark_delivered(&NotificationId::for_task(&tasks[0])).await);
    }

    #[tokio::test]
    async fn prune_forgets_only_finished_entries() {
        let (_sink, scheduler, window) = setup();
        let prefs = NotificationPreferences::default();
        let done = task(TaskKind::Pruning, Priority::Low, 2);
        let open = task(TaskKind::Watering, Priority::High, 3);
        scheduler
            .sync_window(&[done.clone(), open.clone()], &window, &prefs, now())
            .await;
        scheduler.cancel_task(done.id).await;

        let pruned = scheduler.prune(now() + Duration::days(1)).await;
        assert_eq!(pruned, 1);
        assert!(scheduler.states_for_task(done.id).await.is_empty());
        assert_eq!(scheduler.states_for_task(open.id).await.len(), 1);
        assert_eq!(scheduler.tracked.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn sink_failure_keeps_scheduled_and_retries() {
        let (sink, scheduler, window) = setup();
        let prefs = NotificationPreferences::default();
        let t = task(TaskKind::Watering, Priority::High, 6);
        sink.failing.store(true, Ordering::SeqCst);

        let report = scheduler.sync_window(&[t.clone()], &window, &prefs, now()).await;
        assert_eq!(report.failed, 1);
        let state = scheduler.state_of(&NotificationId::for_task(&t)).await;
        assert_eq!(state, DeliveryState::Scheduled);

        sink.failing.store(false, Ordering::SeqCst);
        let retry = scheduler.sync_window(&[t.clone()], &window, &prefs, now()).await;
        assert_eq!(retry.scheduled, vec![NotificationId::for_task(&t)]);
        assert_eq!(sink.notified.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn overdue_sweep_delivers_and_reminds_once() {
        let (sink, scheduler, window) = setup();
        let prefs = NotificationPreferences::default();
        let upcoming = task(TaskKind::Watering, Priority::High, 2);
        scheduler.sync_window(&[upcoming.clone()], &window, &prefs, now()).await;

        let later = now() + Duration::hours(3);
        let forgotten = task(TaskKind::Feeding, Priority::Medium, -5);
        let tasks = vec![upcoming.clone(), forgotten.clone()];

        let report = scheduler.process_overdue(&tasks, &prefs, later).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.scheduled, vec![NotificationId::overdue(&forgotten)]);
        assert_eq!(
            scheduler.state_of(&NotificationId::for_task(&upcoming)).await,
            DeliveryState::Delivered
        );

        let again = scheduler.process_overdue(&tasks, &prefs, later).await;
        assert!(again.scheduled.is_empty());
        assert_eq!(sink.notified.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn quiet_hours_suppress_non_critical() {
        let (sink, scheduler, window) = setup();
        let prefs = NotificationPreferences {
            quiet_hours: Some(crate::preferences::QuietHours {
                start: chrono::NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                end: chrono::NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            }),
            ..Default::default()
        };
        // 09:00 + 14h = 23:00
        let night = task(TaskKind::Inspection, Priority::Medium, 14);
        let urgent = task(TaskKind::Harvest, Priority::Critical, 14);
        let report = scheduler.sync_window(&[night, urgent.clone()], &window, &prefs, now()).await;
        assert_eq!(report.suppressed, 1);
        assert_eq!(report.scheduled, vec![NotificationId::for_task(&urgent)]);
        assert_eq!(sink.notified.lock().unwrap().len(), 1);
    }
}
