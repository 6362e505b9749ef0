// --------------------------------------------------
// Persistent store seam.
//
// The engine talks to the store only through the traits below.
// `JsonStore` is the local implementation: one JSON document on disk,
// rewritten atomically (temp file + rename) on every mutation.
// --------------------------------------------------

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{Db, NotificationRecord, Plant, Task};
use crate::preferences::StoredPreferences;

pub const DB_PATH: &str = "data/db.json";

// Inclusive calendar-day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn day(date: NaiveDate) -> Self {
        Self {
            start: date,
            end: date,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlantFilter {
    All,
    Plant(Uuid),
}

impl PlantFilter {
    pub fn matches(&self, plant_id: Uuid) -> bool {
        match self {
            PlantFilter::All => true,
            PlantFilter::Plant(id) => *id == plant_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionFilter {
    All,
    Pending,
    Completed,
}

impl CompletionFilter {
    pub fn matches(&self, completed: bool) -> bool {
        match self {
            CompletionFilter::All => true,
            CompletionFilter::Pending => !completed,
            CompletionFilter::Completed => completed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadFilter {
    All,
    Unread,
    Read,
}

impl ReadFilter {
    pub fn matches(&self, is_read: bool) -> bool {
        match self {
            ReadFilter::All => true,
            ReadFilter::Unread => !is_read,
            ReadFilter::Read => is_read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPage {
    pub items: Vec<NotificationRecord>,
    pub next_cursor: Option<usize>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    // Live (not deleted) tasks due inside `range`.
    async fn fetch_tasks(
        &self,
        range: DateRange,
        plant: PlantFilter,
        completion: CompletionFilter,
    ) -> Result<Vec<Task>>;

    async fn fetch_plant(&self, id: Uuid) -> Result<Option<Plant>>;

    // Insert or replace by task id.
    async fn upsert_tasks(&self, tasks: &[Task]) -> Result<()>;

    async fn complete_task(&self, id: Uuid) -> Result<Option<Task>>;

    // Logical delete. The row stays.
    async fn delete_task(&self, id: Uuid) -> Result<Option<Task>>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    // Newest first. `cursor` is the offset returned by the previous page.
    async fn fetch_notifications(
        &self,
        user_id: &str,
        cursor: Option<usize>,
        page_size: usize,
        read: ReadFilter,
    ) -> Result<NotificationPage>;

    async fn set_read(&self, id: Uuid, is_read: bool) -> Result<()>;

    async fn set_all_read(&self, user_id: &str) -> Result<()>;
}

#[async_trait]
pub trait PreferenceSource: Send + Sync {
    async fn current_preferences(&self) -> Result<StoredPreferences>;
}

#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Snapshot of the whole document. A missing file is an empty db.
    pub async fn load(&self) -> Result<Db> {
        let _guard = self.lock.lock().await;
        self.read_db().await
    }

    // Read-modify-write under the store lock.
    pub async fn update<T: Send>(&self, f: impl FnOnce(&mut Db) -> T + Send) -> Result<T> {
        let _guard = self.lock.lock().await;
        let mut db = self.read_db().await?;
        let out = f(&mut db);
        self.write_db(&db).await?;
        Ok(out)
    }

    pub async fn insert_plant(&self, plant: Plant) -> Result<()> {
        self.update(|db| {
            db.plants.retain(|p| p.id != plant.id);
            db.plants.push(plant);
        })
        .await
    }

    pub async fn insert_notification(&self, record: NotificationRecord) -> Result<()> {
        self.update(|db| {
            db.notifications.retain(|n| n.id != record.id);
            db.notifications.push(record);
        })
        .await
    }

    pub async fn put_preferences(&self, prefs: StoredPreferences) -> Result<()> {
        self.update(|db| db.preferences = prefs).await
    }

    async fn read_db(&self) -> Result<Db> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Db::default()),
            Err(e) => return Err(e.into()),
        };
        let db: Db = serde_json::from_str(&text)?;
        Ok(db)
    }

    async fn write_db(&self, db: &Db) -> Result<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(db)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tokio::fs::write(&tmp_path, text).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for JsonStore {
    async fn fetch_tasks(
        &self,
        range: DateRange,
        plant: PlantFilter,
        completion: CompletionFilter,
    ) -> Result<Vec<Task>> {
        let db = self.load().await?;
        Ok(db
            .tasks
            .into_iter()
            .filter(|t| !t.deleted)
            .filter(|t| range.contains(t.due_at.date_naive()))
            .filter(|t| plant.matches(t.plant_id))
            .filter(|t| completion.matches(t.completed))
            .collect())
    }

    async fn fetch_plant(&self, id: Uuid) -> Result<Option<Plant>> {
        let db = self.load().await?;
        Ok(db.plants.into_iter().find(|p| p.id == id))
    }

    async fn upsert_tasks(&self, tasks: &[Task]) -> Result<()> {
        let tasks = tasks.to_vec();
        self.update(move |db| {
            for task in tasks {
                match db.tasks.iter_mut().find(|t| t.id == task.id) {
                    Some(existing) => *existing = task,
                    None => db.tasks.push(task),
                }
            }
        })
        .await
    }

    async fn complete_task(&self, id: Uuid) -> Result<Option<Task>> {
        self.update(|db| {
            let t = db.tasks.iter_mut().find(|t| t.id == id && !t.deleted)?;
            t.completed = true;
            Some(t.clone())
        })
        .await
    }

    async fn delete_task(&self, id: Uuid) -> Result<Option<Task>> {
        self.update(|db| {
            let t = db.tasks.iter_mut().find(|t| t.id == id && !t.deleted)?;
            t.deleted = true;
            Some(t.clone())
        })
        .await
    }
}

#[async_trait]
impl NotificationStore for JsonStore {
    async fn fetch_notifications(
        &self,
        user_id: &str,
        cursor: Option<usize>,
        page_size: usize,
        read: ReadFilter,
    ) -> Result<NotificationPage> {
        let db = self.load().await?;
        let mut matching: Vec<NotificationRecord> = db
            .notifications
            .into_iter()
            .filter(|n| n.user_id == user_id)
            .filter(|n| read.matches(n.is_read))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let offset = cursor.unwrap_or(0);
        let total = matching.len();
        let items: Vec<NotificationRecord> =
            matching.into_iter().skip(offset).take(page_size).collect();
        let consumed = offset + items.len();
        let next_cursor = (page_size > 0 && consumed < total).then_some(consumed);
        Ok(NotificationPage { items, next_cursor })
    }

    async fn set_read(&self, id: Uuid, is_read: bool) -> Result<()> {
        let found = self
            .update(|db| match db.notifications.iter_mut().find(|n| n.id == id) {
                Some(n) => {
                    n.is_read = is_read;
                    true
                }
                None => false,
            })
            .await?;
        if found {
            Ok(())
        } else {
            Err(EngineError::not_found("notification", id))
        }
    }

    async fn set_all_read(&self, user_id: &str) -> Result<()> {
        self.update(|db| {
            for n in db.notifications.iter_mut().filter(|n| n.user_id == user_id) {
                n.is_read = true;
            }
        })
        .await
    }
}

#[async_trait]
impl PreferenceSource for JsonStore {
    async fn current_preferences(&self) -> Result<StoredPreferences> {
        Ok(self.load().await?.preferences)
    }
}
