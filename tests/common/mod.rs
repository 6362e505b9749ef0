#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset};
use grow_scheduler::clock::ManualClock;
use grow_scheduler::config::EngineConfig;
use grow_scheduler::error::{EngineError, Result};
use grow_scheduler::models::{GrowthStage, NotificationRecord, Plant, StrainGenetics};
use grow_scheduler::profiles::ProfileStore;
use grow_scheduler::sink::{NotificationId, NotificationRequest, NotificationSink};
use grow_scheduler::store::{JsonStore, NotificationPage, NotificationStore, ReadFilter};
use grow_scheduler::{Collaborators, Engine};
use tempfile::TempDir;
use uuid::Uuid;

pub fn at(s: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(s).unwrap()
}

// Wednesday morning
pub fn start() -> DateTime<FixedOffset> {
    at("2024-05-01T09:00:00+00:00")
}

pub fn plant(genetics: StrainGenetics, stage: GrowthStage) -> Plant {
    Plant {
        id: Uuid::new_v4(),
        name: "test plant".into(),
        genetics,
        stage,
        days_in_stage: 10,
    }
}

pub fn note(user: &str, minutes: i64, is_read: bool) -> NotificationRecord {
    NotificationRecord {
        id: Uuid::new_v4(),
        user_id: user.into(),
        title: format!("note {minutes}"),
        body: String::new(),
        payload: serde_json::json!({ "minutes": minutes }),
        is_read,
        created_at: start() + Duration::minutes(minutes),
    }
}

// Sink that records every call and can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    pub notified: Mutex<Vec<NotificationRequest>>,
    pub canceled: Mutex<Vec<NotificationId>>,
    pub fail: AtomicBool,
}

impl RecordingSink {
    pub fn notified_ids(&self) -> Vec<NotificationId> {
        self.notified.lock().unwrap().iter().map(|r| r.id.clone()).collect()
    }

    pub fn canceled_ids(&self) -> Vec<NotificationId> {
        self.canceled.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, request: &NotificationRequest) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::NotificationSink {
                operation: "notify",
                id: request.id.to_string(),
                message: "simulated rejection".into(),
            });
        }
        self.notified.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn cancel(&self, id: &NotificationId) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::NotificationSink {
                operation: "cancel",
                id: id.to_string(),
                message: "simulated rejection".into(),
            });
        }
        self.canceled.lock().unwrap().push(id.clone());
        Ok(())
    }
}

// JSON store whose mutations can be made to fail.
pub struct FlakyNotifications {
    pub inner: Arc<JsonStore>,
    pub fail: AtomicBool,
}

impl FlakyNotifications {
    pub fn new(inner: Arc<JsonStore>) -> Self {
        Self {
            inner,
            fail: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(EngineError::store("simulated outage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NotificationStore for FlakyNotifications {
    async fn fetch_notifications(
        &self,
        user_id: &str,
        cursor: Option<usize>,
        page_size: usize,
        read: ReadFilter,
    ) -> Result<NotificationPage> {
        self.inner.fetch_notifications(user_id, cursor, page_size, read).await
    }

    async fn set_read(&self, id: Uuid, is_read: bool) -> Result<()> {
        self.check()?;
        self.inner.set_read(id, is_read).await
    }

    async fn set_all_read(&self, user_id: &str) -> Result<()> {
        self.check()?;
        self.inner.set_all_read(user_id).await
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<JsonStore>,
    pub notifications: Arc<FlakyNotifications>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<ManualClock>,
    pub engine: Arc<Engine>,
}

pub fn harness(config: EngineConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonStore::new(dir.path().join("db.json")));
    let notifications = Arc::new(FlakyNotifications::new(store.clone()));
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::new(start()));

    let engine = Arc::new(Engine::new(
        EngineConfig {
            db_path: store.path().to_path_buf(),
            ..config
        },
        ProfileStore::builtin().clone(),
        Collaborators {
            tasks: store.clone(),
            notifications: notifications.clone(),
            preferences: store.clone(),
            sink: sink.clone(),
            clock: clock.clone(),
        },
    ));

    Harness {
        dir,
        store,
        notifications,
        sink,
        clock,
        engine,
    }
}
