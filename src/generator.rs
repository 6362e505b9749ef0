/*
Care-task generation and ordering.
Module is independent from HTTP / Axum and from the cache for testing
*/

use std::cmp::Ordering;

use chrono::{DateTime, Duration, FixedOffset};
use uuid::Uuid;

use crate::models::{GrowthStage, Plant, Task, TaskKind};
use crate::profiles::ProfileStore;

// Two due timestamps in a recurrence may drift by this much (DST shifts).
pub const RECURRENCE_SKEW_TOLERANCE_SECS: i64 = 60 * 60;

// One task per recommended kind of the stage, all due `now`.
//
// The caller decides that a stage transition happened (days-in-stage
// thresholds are an input signal here, not something computed).
pub fn generate_for_stage(
    profiles: &ProfileStore,
    plant: &Plant,
    stage: GrowthStage,
    now: DateTime<FixedOffset>,
) -> Vec<Task> {
    let profile = profiles.stage_profile(stage);
    profile
        .recommended
        .iter()
        .map(|kind| Task {
            id: Uuid::new_v4(),
            plant_id: plant.id,
            kind: *kind,
            due_at: now,
            priority: profile.priority_of(*kind),
            completed: false,
            deleted: false,
            recurrence_seq: None,
        })
        .collect()
}

// Recurring instances at now + k * interval_days (k = 1, 2, ...) up to and
// including `horizon`.
//
// Empty when the horizon is not strictly after the first occurrence, or
// when the interval is zero.
pub fn expand_recurring(
    profiles: &ProfileStore,
    plant: &Plant,
    kind: TaskKind,
    interval_days: u32,
    horizon: DateTime<FixedOffset>,
    now: DateTime<FixedOffset>,
) -> Vec<Task> {
    if interval_days == 0 {
        return Vec::new();
    }
    let step = Duration::days(i64::from(interval_days));
    let first = now + step;
    if horizon <= first {
        return Vec::new();
    }

    let priority = profiles.stage_profile(plant.stage).priority_of(kind);
    let mut out = Vec::new();
    let mut due = first;
    let mut seq: u32 = 1;
    while due <= horizon {
        out.push(Task {
            id: Uuid::new_v4(),
            plant_id: plant.id,
            kind,
            due_at: due,
            priority,
            completed: false,
            deleted: false,
            recurrence_seq: Some(seq),
        });
        due += step;
        seq += 1;
    }
    out
}

// Everything a plant needs for the next `horizon_days`:
// the immediate stage tasks plus the recurring sequence of every
// recommended kind, spaced by the strain-adjusted interval.
pub fn plan_for_plant(
    profiles: &ProfileStore,
    plant: &Plant,
    horizon_days: u32,
    now: DateTime<FixedOffset>,
) -> Vec<Task> {
    let horizon = now + Duration::days(i64::from(horizon_days));
    let mut tasks = generate_for_stage(profiles, plant, plant.stage, now);

    for kind in &profiles.stage_profile(plant.stage).recommended {
        let Some(interval) = profiles.effective_interval_days(plant.stage, plant.genetics, *kind)
        else {
            continue;
        };
        tasks.extend(expand_recurring(profiles, plant, *kind, interval, horizon, now));
    }

    sort_tasks(&mut tasks);
    tasks
}

// Display and batch ordering:
// 1) Higher priority first
// 2) If tied, earlier due time first
pub fn task_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.due_at.cmp(&b.due_at))
}

pub fn sort_tasks(tasks: &mut [Task]) {
    tasks.sort_by(task_order);
}

// Open tasks whose due time has passed.
pub fn overdue_tasks(tasks: &[Task], now: DateTime<FixedOffset>) -> Vec<Task> {
    tasks
        .iter()
        .filter(|t| t.is_open())
        .filter(|t| now > t.due_at)
        .cloned()
        .collect()
}
