/*
Notification delivery preferences.

The store keeps whatever the user last saved (`StoredPreferences`, loosely
typed strings). The engine only ever reads the validated snapshot
(`NotificationPreferences`); anything malformed is replaced by its default
and logged, never propagated.
*/

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;
use crate::models::{Priority, TaskKind};

pub const DEFAULT_BATCHING_WINDOW_MIN: i64 = 15;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 3;

// Shape persisted by the store and edited by the user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoredPreferences {
    pub enabled: Option<bool>,
    #[serde(default)]
    pub categories: BTreeMap<String, bool>, // "watering" -> false
    pub quiet_hours_enabled: Option<bool>,
    pub quiet_start: Option<String>, // "HH:MM"
    pub quiet_end: Option<String>,   // "HH:MM"
    #[serde(default)]
    pub dnd_days: Vec<String>, // "sat", "sunday", ...
    pub batching_window_min: Option<i64>,
    pub max_batch_size: Option<usize>,
    pub critical_override: Option<bool>,
    pub priority_only: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    // start > end means the window spans midnight (22:00-08:00).
    pub fn contains(&self, t: NaiveTime) -> bool {
        let start = minutes_of_day(self.start);
        let end = minutes_of_day(self.end);
        let now = minutes_of_day(t);
        if start == end {
            return false;
        }
        if start < end {
            now >= start && now < end
        } else {
            now >= start || now < end
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPreferences {
    pub enabled: bool,
    pub categories: BTreeMap<TaskKind, bool>,
    pub quiet_hours: Option<QuietHours>,
    pub dnd_days: HashSet<Weekday>,
    pub batching_window_min: i64,
    pub max_batch_size: usize,
    pub critical_override: bool,
    pub priority_only: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            enabled: true,
            categories: BTreeMap::new(),
            quiet_hours: None,
            dnd_days: HashSet::new(),
            batching_window_min: DEFAULT_BATCHING_WINDOW_MIN,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            critical_override: true,
            priority_only: false,
        }
    }
}

impl NotificationPreferences {
    // Build the validated snapshot. Each malformed field falls back to
    // its default on its own; the rest of the record is still honoured.
    pub fn from_stored(stored: &StoredPreferences) -> Self {
        let defaults = Self::default();

        let mut categories = BTreeMap::new();
        for (name, enabled) in &stored.categories {
            match parse_category(name) {
                Ok(kind) => {
                    categories.insert(kind, *enabled);
                }
                Err(e) => warn!(error = %e, "ignoring unknown notification category"),
            }
        }

        let quiet_hours = if stored.quiet_hours_enabled.unwrap_or(false) {
            match parse_quiet_hours(stored.quiet_start.as_deref(), stored.quiet_end.as_deref()) {
                Ok(q) => Some(q),
                Err(e) => {
                    warn!(error = %e, "quiet hours unparsable, disabling");
                    None
                }
            }
        } else {
            None
        };

        let mut dnd_days = HashSet::new();
        for day in &stored.dnd_days {
            match day.trim().parse::<Weekday>() {
                Ok(d) => {
                    dnd_days.insert(d);
                }
                Err(_) => warn!(day = %day, "ignoring unparsable do-not-disturb day"),
            }
        }

        let batching_window_min = match stored.batching_window_min {
            Some(m) if m >= 0 => m,
            Some(m) => {
                warn!(value = m, "negative batching window, using default");
                defaults.batching_window_min
            }
            None => defaults.batching_window_min,
        };

        let max_batch_size = match stored.max_batch_size {
            Some(0) => {
                warn!("max batch size of zero, using default");
                defaults.max_batch_size
            }
            Some(n) => n,
            None => defaults.max_batch_size,
        };

        Self {
            enabled: stored.enabled.unwrap_or(defaults.enabled),
            categories,
            quiet_hours,
            dnd_days,
            batching_window_min,
            max_batch_size,
            critical_override: stored.critical_override.unwrap_or(defaults.critical_override),
            priority_only: stored.priority_only.unwrap_or(defaults.priority_only),
        }
    }

    pub fn category_enabled(&self, category: TaskKind) -> bool {
        self.categories.get(&category).copied().unwrap_or(true)
    }

    pub fn is_in_quiet_hours(&self, t: NaiveTime) -> bool {
        self.quiet_hours.is_some_and(|q| q.contains(t))
    }

    pub fn is_dnd_day(&self, day: Weekday) -> bool {
        self.dnd_days.contains(&day)
    }

    // Delivery gate evaluated at the moment the notification would fire.
    //
    // Order matters: the critical override wins over every suppression
    // except the master toggle.
    pub fn should_deliver(
        &self,
        category: TaskKind,
        priority: Priority,
        at: DateTime<FixedOffset>,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        if priority == Priority::Critical && self.critical_override {
            return true;
        }
        if !self.category_enabled(category) {
            return false;
        }
        if self.priority_only && priority == Priority::Low {
            return false;
        }
        if self.is_dnd_day(at.weekday()) {
            return false;
        }
        if self.is_in_quiet_hours(at.time()) {
            return false;
        }
        true
    }
}

fn minutes_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

fn parse_category(name: &str) -> Result<TaskKind, EngineError> {
    serde_json::from_value(serde_json::Value::String(name.trim().to_lowercase()))
        .map_err(|_| EngineError::validation("categories", format!("unknown category {name:?}")))
}

// Parse a "HH:MM" string into a time of day.
pub fn parse_hhmm(field: &str, hhmm: &str) -> Result<NaiveTime, EngineError> {
    let parts: Vec<&str> = hhmm.trim().split(':').collect();
    if parts.len() != 2 {
        return Err(EngineError::validation(field, format!("expected HH:MM, got {hhmm:?}")));
    }
    let h: u32 = parts[0]
        .parse()
        .map_err(|_| EngineError::validation(field, format!("bad hour in {hhmm:?}")))?;
    let m: u32 = parts[1]
        .parse()
        .map_err(|_| EngineError::validation(field, format!("bad minute in {hhmm:?}")))?;
    NaiveTime::from_hms_opt(h, m, 0)
        .ok_or_else(|| EngineError::validation(field, format!("out of range: {hhmm:?}")))
}

fn parse_quiet_hours(start: Option<&str>, end: Option<&str>) -> Result<QuietHours, EngineError> {
    let start = start.ok_or_else(|| EngineError::validation("quiet_start", "missing"))?;
    let end = end.ok_or_else(|| EngineError::validation("quiet_end", "missing"))?;
    Ok(QuietHours {
        start: parse_hhmm("quiet_start", start)?,
        end: parse_hhmm("quiet_end", end)?,
    })
}
