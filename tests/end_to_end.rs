mod common;

use chrono::{Duration, NaiveDate};
use common::{harness, plant, start, Harness};
use grow_scheduler::config::EngineConfig;
use grow_scheduler::models::{
    EnvironmentalReading, GrowthStage, Priority, StrainGenetics, Task, TaskKind, WeatherCondition,
};
use grow_scheduler::notifier::DeliveryState;
use grow_scheduler::preferences::StoredPreferences;
use grow_scheduler::sink::NotificationId;

fn reading(humidity_pct: f64) -> EnvironmentalReading {
    EnvironmentalReading {
        temperature_c: 24.0,
        humidity_pct,
        precipitation_mm: None,
        wind_kph: None,
        uv_index: None,
        ph: None,
        condition: WeatherCondition::Cloudy,
    }
}

// Vegetative sativa, planned for 30 days. Returns the first feeding
// recurrence as stored (unadjusted).
async fn planned_sativa(h: &Harness) -> Task {
    // no digests: every task gets its own notification
    h.store
        .put_preferences(StoredPreferences {
            max_batch_size: Some(100),
            ..Default::default()
        })
        .await
        .unwrap();
    let sativa = plant(StrainGenetics::Sativa, GrowthStage::Vegetative);
    h.store.insert_plant(sativa.clone()).await.unwrap();

    let tasks = h.engine.schedule_for_plant(sativa.id, Some(30)).await.unwrap();
    tasks
        .into_iter()
        .find(|t| t.kind == TaskKind::Feeding && t.recurrence_seq == Some(1))
        .unwrap()
}

fn feeding_day(baseline: &Task) -> NaiveDate {
    baseline.due_at.date_naive()
}

#[tokio::test]
async fn humid_sativa_feeding_is_raised_moved_and_notified_once() {
    let h = harness(EngineConfig::default());
    let baseline = planned_sativa(&h).await;
    // sativa feeds every round(7 * 1.2) = 8 days
    assert_eq!(baseline.due_at, start() + Duration::days(8));
    assert_eq!(baseline.priority, Priority::Medium);

    h.engine.record_readings(reading(75.0)).unwrap();
    let report = h.engine.update_focus(feeding_day(&baseline)).await.unwrap();
    h.engine.settle().await;

    let view = h.engine.focus_window_tasks(feeding_day(&baseline)).await.unwrap();
    let adjusted = view
        .all_tasks()
        .into_iter()
        .find(|t| t.id == baseline.id)
        .unwrap();
    assert!(adjusted.priority > baseline.priority);
    assert!(adjusted.due_at < baseline.due_at);
    assert_eq!(adjusted.due_at, baseline.due_at - Duration::hours(12));

    let id = NotificationId::for_task(&adjusted);
    assert!(report.scheduled.contains(&id));
    let count = |id: &NotificationId| h.sink.notified_ids().iter().filter(|n| *n == id).count();
    assert_eq!(count(&id), 1);
    assert_eq!(count(&NotificationId::for_task(&baseline)), 0);

    // same date again: nothing new reaches the sink
    let sent = h.sink.notified_ids().len();
    let again = h.engine.update_focus(feeding_day(&baseline)).await.unwrap();
    h.engine.settle().await;
    assert!(again.scheduled.is_empty());
    assert!(again.digests.is_empty());
    assert_eq!(h.sink.notified_ids().len(), sent);
    assert_eq!(count(&id), 1);
}

#[tokio::test]
async fn adjusted_tasks_are_filed_under_their_new_day() {
    let h = harness(EngineConfig::default());
    let baseline = planned_sativa(&h).await;
    h.engine.record_readings(reading(75.0)).unwrap();

    let view = h.engine.focus_window_tasks(feeding_day(&baseline)).await.unwrap();
    for (day, tasks) in &view.by_date {
        for t in tasks {
            assert_eq!(t.due_at.date_naive(), *day);
        }
    }
    let evening_before = feeding_day(&baseline) - Duration::days(1);
    assert!(view.by_date[&evening_before].iter().any(|t| t.id == baseline.id));
    assert!(!view.by_date[&feeding_day(&baseline)].iter().any(|t| t.id == baseline.id));
}

#[tokio::test]
async fn task_moved_into_last_window_day_is_scheduled() {
    let h = harness(EngineConfig::default());
    let baseline = planned_sativa(&h).await;
    h.engine.record_readings(reading(75.0)).unwrap();

    // window ends the day before the stored feeding day
    let centre = feeding_day(&baseline) - Duration::days(3);
    let report = h.engine.update_focus(centre).await.unwrap();
    h.engine.settle().await;

    let mut moved = baseline.clone();
    moved.due_at -= Duration::hours(12);
    moved.priority = Priority::High;
    assert!(report.scheduled.contains(&NotificationId::for_task(&moved)));
}

#[tokio::test]
async fn window_days_are_in_display_order() {
    let h = harness(EngineConfig::default());
    let baseline = planned_sativa(&h).await;

    let view = h.engine.focus_window_tasks(feeding_day(&baseline)).await.unwrap();
    assert_eq!(view.by_date.len(), 5);
    assert_eq!(view.window.start, feeding_day(&baseline) - Duration::days(2));
    for tasks in view.by_date.values() {
        for pair in tasks.windows(2) {
            assert!(
                pair[0].priority > pair[1].priority
                    || (pair[0].priority == pair[1].priority && pair[0].due_at <= pair[1].due_at)
            );
        }
    }
    let feeding_tasks = &view.by_date[&feeding_day(&baseline)];
    assert!(feeding_tasks.iter().any(|t| t.id == baseline.id));
}

#[tokio::test]
async fn replanning_does_not_duplicate() {
    let h = harness(EngineConfig::default());
    let sativa = plant(StrainGenetics::Sativa, GrowthStage::Vegetative);
    h.store.insert_plant(sativa.clone()).await.unwrap();

    let first = h.engine.schedule_for_plant(sativa.id, Some(30)).await.unwrap();
    assert!(!first.is_empty());
    let second = h.engine.schedule_for_plant(sativa.id, Some(30)).await.unwrap();
    assert!(second.is_empty());
    assert_eq!(h.store.load().await.unwrap().tasks.len(), first.len());
}

#[tokio::test]
async fn unknown_plant_is_not_found() {
    let h = harness(EngineConfig::default());
    let err = h
        .engine
        .schedule_for_plant(uuid::Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, grow_scheduler::EngineError::NotFound { what: "plant", .. }));
}

#[tokio::test]
async fn completing_a_task_cancels_its_notification() {
    let h = harness(EngineConfig::default());
    let baseline = planned_sativa(&h).await;
    h.engine.update_focus(feeding_day(&baseline)).await.unwrap();
    let id = NotificationId::for_task(&baseline);
    assert_eq!(h.engine.scheduler().state_of(&id).await, DeliveryState::Scheduled);

    let done = h.engine.complete_task(baseline.id).await.unwrap();
    assert!(done.completed);
    assert_eq!(h.sink.canceled_ids(), vec![id.clone()]);
    assert_eq!(h.engine.scheduler().state_of(&id).await, DeliveryState::Canceled);

    // and it never comes back
    h.engine.update_focus(feeding_day(&baseline)).await.unwrap();
    assert_eq!(h.engine.scheduler().state_of(&id).await, DeliveryState::Canceled);
    h.engine.settle().await;
}

#[tokio::test]
async fn new_reading_cancels_rewritten_ids() {
    let h = harness(EngineConfig::default());
    let baseline = planned_sativa(&h).await;

    h.engine.update_focus(feeding_day(&baseline)).await.unwrap();
    let plain = NotificationId::for_task(&baseline);

    h.engine.record_readings(reading(75.0)).unwrap();
    let report = h.engine.update_focus(feeding_day(&baseline)).await.unwrap();
    h.engine.settle().await;

    let mut moved = baseline.clone();
    moved.due_at -= Duration::hours(12);
    moved.priority = Priority::High;
    assert!(report.canceled.contains(&plain));
    assert!(report.scheduled.contains(&NotificationId::for_task(&moved)));
    assert_eq!(h.engine.scheduler().state_of(&plain).await, DeliveryState::Canceled);
}

#[tokio::test]
async fn overdue_sweep_marks_delivered_and_reminds_once() {
    let h = harness(EngineConfig::default());
    let baseline = planned_sativa(&h).await;
    h.engine.update_focus(feeding_day(&baseline)).await.unwrap();
    h.engine.settle().await;

    h.clock.set(baseline.due_at + Duration::hours(1));
    let report = h.engine.process_overdue().await.unwrap();
    assert!(report.delivered >= 1);
    assert_eq!(
        h.engine.scheduler().state_of(&NotificationId::for_task(&baseline)).await,
        DeliveryState::Delivered
    );
    // earlier tasks were never in a focus window: one reminder each
    assert!(!report.scheduled.is_empty());
    assert!(report.scheduled.iter().all(|id| id.as_str().ends_with(":overdue")));

    let again = h.engine.process_overdue().await.unwrap();
    assert!(again.scheduled.is_empty());
}

#[tokio::test]
async fn maintenance_forgets_old_notification_state() {
    let h = harness(EngineConfig::default());
    let baseline = planned_sativa(&h).await;
    h.engine.update_focus(feeding_day(&baseline)).await.unwrap();
    h.engine.complete_task(baseline.id).await.unwrap();
    assert_eq!(h.engine.scheduler().states_for_task(baseline.id).await.len(), 1);

    // past the overdue lookback
    h.clock.set(baseline.due_at + Duration::days(31));
    h.engine.maintain().await;
    h.engine.settle().await;
    assert!(h.engine.scheduler().states_for_task(baseline.id).await.is_empty());
}

#[tokio::test]
async fn invalid_reading_is_rejected() {
    let h = harness(EngineConfig::default());
    let mut bad = reading(140.0);
    assert!(h.engine.record_readings(bad.clone()).is_err());
    bad.humidity_pct = 50.0;
    bad.ph = Some(20.0);
    assert!(h.engine.record_readings(bad).is_err());
}
