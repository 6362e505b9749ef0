/*
Environmental adjustment of care tasks.

Pure rule table: readings in, offset/priority out. Rules fire
independently and their offsets add up. Offsets are in hours relative to
the original due time; negative means earlier.
*/

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::models::{EnvironmentalReading, Priority, Task, TaskKind};

// Thresholds and offsets are tuning constants, not physical requirements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdjustmentRules {
    pub high_humidity_pct: f64,
    pub high_humidity_offset_hours: i64,
    pub low_humidity_pct: f64,
    pub low_humidity_offset_hours: i64,
    pub high_temperature_c: f64,
    pub high_temperature_offset_hours: i64,
    pub ph_min: f64,
    pub ph_max: f64,
}

impl Default for AdjustmentRules {
    fn default() -> Self {
        Self {
            high_humidity_pct: 70.0,
            high_humidity_offset_hours: -12,
            low_humidity_pct: 40.0,
            low_humidity_offset_hours: -6,
            high_temperature_c: 30.0,
            high_temperature_offset_hours: -4,
            ph_min: 5.5,
            ph_max: 7.5,
        }
    }
}

impl AdjustmentRules {
    // Widest move any combination of rules can make, in whole days.
    pub fn max_shift_days(&self) -> u64 {
        let hours = self.high_humidity_offset_hours.unsigned_abs()
            + self.low_humidity_offset_hours.unsigned_abs()
            + self.high_temperature_offset_hours.unsigned_abs();
        hours.div_ceil(24)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdjustedTask {
    pub reschedule_offset_hours: i64,
    pub new_priority: Option<Priority>, // only set when it actually changes
}

impl AdjustedTask {
    pub fn is_noop(&self) -> bool {
        self.reschedule_offset_hours == 0 && self.new_priority.is_none()
    }

    pub fn apply(&self, task: &Task) -> Task {
        let mut out = task.clone();
        out.due_at = task.due_at + Duration::hours(self.reschedule_offset_hours);
        if let Some(p) = self.new_priority {
            out.priority = p;
        }
        out
    }
}

pub fn adjust(
    task: &Task,
    reading: &EnvironmentalReading,
    rules: &AdjustmentRules,
) -> AdjustedTask {
    let mut offset = 0;
    let mut priority = task.priority;

    // mold risk
    if reading.humidity_pct > rules.high_humidity_pct
        && matches!(task.kind, TaskKind::Watering | TaskKind::Feeding)
    {
        offset += rules.high_humidity_offset_hours;
        priority = priority.max(task.priority.raised());
    }

    // desiccation
    if reading.humidity_pct < rules.low_humidity_pct && task.kind == TaskKind::Watering {
        offset += rules.low_humidity_offset_hours;
    }

    if reading.temperature_c > rules.high_temperature_c && task.kind == TaskKind::Watering {
        offset += rules.high_temperature_offset_hours;
    }

    // Out-of-band pH forces critical. Never lowers anything.
    if let Some(ph) = reading.ph {
        if ph < rules.ph_min || ph > rules.ph_max {
            priority = Priority::Critical;
        }
    }

    AdjustedTask {
        reschedule_offset_hours: offset,
        new_priority: (priority > task.priority).then_some(priority),
    }
}

// Apply the rule table to a whole list, returning rewritten copies.
pub fn adjust_all(
    tasks: &[Task],
    reading: &EnvironmentalReading,
    rules: &AdjustmentRules,
) -> Vec<Task> {
    tasks
        .iter()
        .map(|t| {
            let adjusted = adjust(t, reading, rules);
            if adjusted.is_noop() { t.clone() } else { adjusted.apply(t) }
        })
        .collect()
}
