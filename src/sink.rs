use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::models::Task;

// Stable dedup key for one logical notification.
//
// Built from plant id, task id and the full due timestamp, so recurrence
// instances never collide and a rewritten due time yields a new key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    pub fn for_task(task: &Task) -> Self {
        Self(format!("{}:{}:{}", task.plant_id, task.id, task.due_at.to_rfc3339()))
    }

    pub fn overdue(task: &Task) -> Self {
        Self(format!("{}:overdue", Self::for_task(task).0))
    }

    // Start of the batch plus a digest of its exact membership, so a
    // regrouped batch never reuses the key of a canceled one.
    pub fn digest(start: DateTime<FixedOffset>, members: &[&Task]) -> Self {
        let mut keys: Vec<String> = members.iter().map(|t| Self::for_task(t).0).collect();
        keys.sort();
        let membership = Uuid::new_v5(&Uuid::NAMESPACE_OID, keys.join(",").as_bytes());
        Self(format!("digest:{}:{}", start.to_rfc3339(), membership.simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationRequest {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub payload: serde_json::Value,
    pub deliver_at: DateTime<FixedOffset>,
}

// OS notification capability. Both calls must be idempotent by id.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, request: &NotificationRequest) -> Result<()>;
    async fn cancel(&self, id: &NotificationId) -> Result<()>;
}

// Sink that only logs and remembers what is pending. Used when no OS
// capability is attached (server mode). Requests are forgotten once their
// delivery time has passed.
pub struct LogSink {
    clock: Arc<dyn Clock>,
    pending: Mutex<BTreeMap<NotificationId, NotificationRequest>>,
}

impl LogSink {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn pending(&self) -> Vec<NotificationRequest> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.drop_passed(&mut pending);
        pending.values().cloned().collect()
    }

    fn drop_passed(&self, pending: &mut BTreeMap<NotificationId, NotificationRequest>) {
        let now = self.clock.now();
        let before = pending.len();
        pending.retain(|_, r| r.deliver_at > now);
        if pending.len() < before {
            debug!(fired = before - pending.len(), "passed notifications dropped");
        }
    }
}

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, request: &NotificationRequest) -> Result<()> {
        info!(
            id = %request.id,
            deliver_at = %request.deliver_at.to_rfc3339(),
            title = %request.title,
            "notification scheduled"
        );
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        self.drop_passed(&mut pending);
        pending.insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn cancel(&self, id: &NotificationId) -> Result<()> {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        info!(%id, removed, "notification canceled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn request(id: &str, deliver_at: DateTime<FixedOffset>) -> NotificationRequest {
        NotificationRequest {
            id: NotificationId(id.into()),
            title: "Watering due".into(),
            body: String::new(),
            payload: serde_json::Value::Null,
            deliver_at,
        }
    }

    #[tokio::test]
    async fn log_sink_forgets_fired_requests() {
        let start = DateTime::parse_from_rfc3339("2024-05-01T09:00:00+00:00").unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let sink = LogSink::new(clock.clone());

        sink.notify(&request("soon", start + Duration::hours(1))).await.unwrap();
        sink.notify(&request("later", start + Duration::hours(5))).await.unwrap();
        assert_eq!(sink.pending().len(), 2);

        clock.advance(Duration::hours(2));
        let left: Vec<String> = sink.pending().into_iter().map(|r| r.id.0).collect();
        assert_eq!(left, vec!["later".to_string()]);

        sink.cancel(&NotificationId("later".into())).await.unwrap();
        assert!(sink.pending().is_empty());
    }

    #[test]
    fn digest_key_follows_membership() {
        let t = |h: i64| Task {
            id: Uuid::new_v4(),
            plant_id: Uuid::nil(),
            kind: crate::models::TaskKind::Inspection,
            due_at: DateTime::parse_from_rfc3339("2024-05-01T09:00:00+00:00").unwrap()
                + Duration::hours(h),
            priority: crate::models::Priority::Medium,
            completed: false,
            deleted: false,
            recurrence_seq: None,
        };
        let (a, b, c) = (t(0), t(0), t(1));
        let start = a.due_at;
        assert_eq!(
            NotificationId::digest(start, &[&a, &b]),
            NotificationId::digest(start, &[&b, &a])
        );
        assert_ne!(
            NotificationId::digest(start, &[&a, &b]),
            NotificationId::digest(start, &[&a, &b, &c])
        );
    }
}
