use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::preferences::StoredPreferences;

// Growth stages in the order a plant moves through them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GrowthStage {
    Seedling,
    Vegetative,
    Flowering,
    Harvest,
}

impl GrowthStage {
    pub const ALL: [GrowthStage; 4] = [
        GrowthStage::Seedling,
        GrowthStage::Vegetative,
        GrowthStage::Flowering,
        GrowthStage::Harvest,
    ];

    pub fn index(self) -> usize {
        match self {
            GrowthStage::Seedling => 0,
            GrowthStage::Vegetative => 1,
            GrowthStage::Flowering => 2,
            GrowthStage::Harvest => 3,
        }
    }

    pub fn next(self) -> Option<GrowthStage> {
        match self {
            GrowthStage::Seedling => Some(GrowthStage::Vegetative),
            GrowthStage::Vegetative => Some(GrowthStage::Flowering),
            GrowthStage::Flowering => Some(GrowthStage::Harvest),
            GrowthStage::Harvest => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StrainGenetics {
    Indica,
    Sativa,
    Hybrid,
    Cbd,
    Unknown,
}

impl StrainGenetics {
    pub const ALL: [StrainGenetics; 5] = [
        StrainGenetics::Indica,
        StrainGenetics::Sativa,
        StrainGenetics::Hybrid,
        StrainGenetics::Cbd,
        StrainGenetics::Unknown,
    ];

    pub fn index(self) -> usize {
        match self {
            StrainGenetics::Indica => 0,
            StrainGenetics::Sativa => 1,
            StrainGenetics::Hybrid => 2,
            StrainGenetics::Cbd => 3,
            StrainGenetics::Unknown => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Watering,
    Feeding,
    Inspection,
    Pruning,
    Harvest,
    Transplant,
    Training,
    Defoliation,
    Flushing,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Watering => "watering",
            TaskKind::Feeding => "feeding",
            TaskKind::Inspection => "inspection",
            TaskKind::Pruning => "pruning",
            TaskKind::Harvest => "harvest",
            TaskKind::Transplant => "transplant",
            TaskKind::Training => "training",
            TaskKind::Defoliation => "defoliation",
            TaskKind::Flushing => "flushing",
        }
    }

    // Human-facing label used in notification titles
    pub fn label(self) -> &'static str {
        match self {
            TaskKind::Watering => "Watering",
            TaskKind::Feeding => "Feeding",
            TaskKind::Inspection => "Inspection",
            TaskKind::Pruning => "Pruning",
            TaskKind::Harvest => "Harvest",
            TaskKind::Transplant => "Transplant",
            TaskKind::Training => "Training",
            TaskKind::Defoliation => "Defoliation",
            TaskKind::Flushing => "Flushing",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Declaration order is the priority order: Low < Medium < High < Critical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    // One step up, saturating at Critical
    pub fn raised(self) -> Priority {
        match self {
            Priority::Low => Priority::Medium,
            Priority::Medium => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plant {
    pub id: Uuid,
    pub name: String,
    pub genetics: StrainGenetics,
    pub stage: GrowthStage,
    pub days_in_stage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub plant_id: Uuid,
    pub kind: TaskKind,
    pub due_at: DateTime<FixedOffset>,
    pub priority: Priority,
    pub completed: bool,
    #[serde(default)]
    pub deleted: bool, // logical delete, rows are never removed
    pub recurrence_seq: Option<u32>, // 1.. within a recurrence sequence
}

impl Task {
    pub fn is_open(&self) -> bool {
        !self.completed && !self.deleted
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    Clear,
    Cloudy,
    Rain,
    Storm,
    Snow,
    Unknown,
}

// Sensor / weather snapshot supplied per adjustment call, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentalReading {
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub precipitation_mm: Option<f64>,
    pub wind_kph: Option<f64>,
    pub uv_index: Option<f64>,
    pub ph: Option<f64>,
    pub condition: WeatherCondition,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub payload: serde_json::Value,
    pub is_read: bool,
    pub created_at: DateTime<FixedOffset>,
}

// Whole persisted document, see store.rs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Db {
    #[serde(default)]
    pub plants: Vec<Plant>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub notifications: Vec<NotificationRecord>,
    #[serde(default)]
    pub preferences: StoredPreferences,
}
