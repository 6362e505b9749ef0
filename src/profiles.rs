/*
Growth profile store.

Static scheduling configuration keyed by the closed growth-stage and
genetics enums. Lookups are total: every enum value resolves to a profile.
A JSON override file may replace the built-in table, but it has to cover
every stage and every genetics classification or loading fails with a
configuration gap.
*/

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{GrowthStage, Priority, StrainGenetics, TaskKind};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrowthStageProfile {
    pub stage: GrowthStage,
    pub recommended: Vec<TaskKind>, // in display order
    pub priorities: BTreeMap<TaskKind, Priority>,
    pub base_interval_days: BTreeMap<TaskKind, u32>,
}

impl GrowthStageProfile {
    pub fn priority_of(&self, kind: TaskKind) -> Priority {
        self.priorities.get(&kind).copied().unwrap_or(Priority::Medium)
    }

    pub fn base_interval(&self, kind: TaskKind) -> Option<u32> {
        self.base_interval_days.get(&kind).copied()
    }

    pub fn recommends(&self, kind: TaskKind) -> bool {
        self.recommended.contains(&kind)
    }

    fn check(&self) -> Result<()> {
        for kind in &self.recommended {
            if !self.priorities.contains_key(kind) || !self.base_interval_days.contains_key(kind) {
                return Err(EngineError::ConfigurationGap {
                    what: format!("{kind} in stage {:?}", self.stage),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct StrainSchedulingProfile {
    pub genetics: StrainGenetics,
    pub watering_multiplier: f64,
    pub feeding_multiplier: f64,
}

impl StrainSchedulingProfile {
    pub fn multiplier_for(&self, kind: TaskKind) -> f64 {
        match kind {
            TaskKind::Watering => self.watering_multiplier,
            TaskKind::Feeding => self.feeding_multiplier,
            _ => 1.0,
        }
    }
}

// Document shape for profile override files
#[derive(Debug, Deserialize)]
struct ProfileFile {
    stages: Vec<GrowthStageProfile>,
    strains: Vec<StrainSchedulingProfile>,
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    stages: [GrowthStageProfile; 4],
    strains: [StrainSchedulingProfile; 5],
}

impl ProfileStore {
    // Built-in table, created on first use and kept for the process lifetime.
    pub fn builtin() -> &'static ProfileStore {
        static BUILTIN: OnceLock<ProfileStore> = OnceLock::new();
        BUILTIN.get_or_init(|| ProfileStore {
            stages: GrowthStage::ALL.map(builtin_stage),
            strains: StrainGenetics::ALL.map(builtin_strain),
        })
    }

    pub fn from_json(text: &str) -> Result<ProfileStore> {
        let file: ProfileFile =
            serde_json::from_str(text).map_err(|e| EngineError::ConfigurationGap {
                what: format!("profile file: {e}"),
            })?;

        let mut stages = Vec::with_capacity(GrowthStage::ALL.len());
        for stage in GrowthStage::ALL {
            let profile = file
                .stages
                .iter()
                .find(|p| p.stage == stage)
                .cloned()
                .ok_or_else(|| EngineError::ConfigurationGap {
                    what: format!("stage {stage:?}"),
                })?;
            profile.check()?;
            stages.push(profile);
        }

        let mut strains = Vec::with_capacity(StrainGenetics::ALL.len());
        for genetics in StrainGenetics::ALL {
            let profile = file
                .strains
                .iter()
                .find(|p| p.genetics == genetics)
                .copied()
                .ok_or_else(|| EngineError::ConfigurationGap {
                    what: format!("genetics {genetics:?}"),
                })?;
            strains.push(profile);
        }

        Ok(ProfileStore {
            stages: stages.try_into().map_err(|_| EngineError::ConfigurationGap {
                what: "stage table size".to_string(),
            })?,
            strains: strains.try_into().map_err(|_| EngineError::ConfigurationGap {
                what: "genetics table size".to_string(),
            })?,
        })
    }

    pub fn stage_profile(&self, stage: GrowthStage) -> &GrowthStageProfile {
        &self.stages[stage.index()]
    }

    pub fn strain_profile(&self, genetics: StrainGenetics) -> &StrainSchedulingProfile {
        &self.strains[genetics.index()]
    }

    // Base interval scaled by the strain multiplier, never below one day.
    pub fn effective_interval_days(
        &self,
        stage: GrowthStage,
        genetics: StrainGenetics,
        kind: TaskKind,
    ) -> Option<u32> {
        let base = self.stage_profile(stage).base_interval(kind)?;
        let scaled = (f64::from(base) * self.strain_profile(genetics).multiplier_for(kind)).round();
        Some((scaled as u32).max(1))
    }
}

fn stage_profile(
    stage: GrowthStage,
    rows: &[(TaskKind, Priority, u32)],
) -> GrowthStageProfile {
    GrowthStageProfile {
        stage,
        recommended: rows.iter().map(|(k, _, _)| *k).collect(),
        priorities: rows.iter().map(|(k, p, _)| (*k, *p)).collect(),
        base_interval_days: rows.iter().map(|(k, _, d)| (*k, *d)).collect(),
    }
}

// (kind, priority, base interval in days)
fn builtin_stage(stage: GrowthStage) -> GrowthStageProfile {
    use Priority::*;
    use TaskKind::*;
    match stage {
        GrowthStage::Seedling => stage_profile(
            stage,
            &[(Watering, High, 2), (Inspection, Medium, 1)],
        ),
        GrowthStage::Vegetative => stage_profile(
            stage,
            &[
                (Watering, High, 3),
                (Feeding, Medium, 7),
                (Training, Medium, 5),
                (Inspection, Medium, 2),
                (Pruning, Low, 10),
                (Transplant, Low, 30),
            ],
        ),
        GrowthStage::Flowering => stage_profile(
            stage,
            &[
                (Watering, High, 2),
                (Feeding, High, 7),
                (Inspection, High, 1),
                (Defoliation, Medium, 14),
                (Flushing, Medium, 30),
            ],
        ),
        GrowthStage::Harvest => stage_profile(
            stage,
            &[(Harvest, Critical, 1), (Flushing, High, 1), (Inspection, High, 1)],
        ),
    }
}

fn builtin_strain(genetics: StrainGenetics) -> StrainSchedulingProfile {
    let (watering_multiplier, feeding_multiplier) = match genetics {
        StrainGenetics::Indica => (0.9, 0.9),
        StrainGenetics::Sativa => (1.1, 1.2),
        StrainGenetics::Hybrid => (1.0, 1.0),
        StrainGenetics::Cbd => (1.0, 0.8),
        StrainGenetics::Unknown => (1.0, 1.0),
    };
    StrainSchedulingProfile {
        genetics,
        watering_multiplier,
        feeding_multiplier,
    }
}
