//! Study configuration.
//!
//! A study definition is a JSON document: phases, trigger configurations
//! and rules. Trigger configurations are a closed tagged enum; an entry
//! whose payload fails to decode is skipped with a warning so one bad
//! trigger does not take the whole study down.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{Result, ScheduleError};
use crate::rules::Rule;
use crate::trigger::{TriggerModality, TriggerPriority, TriggerSource};

/// One trigger configuration entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: i64,
    pub questionnaire_id: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub config: TriggerConfig,
}

fn default_enabled() -> bool {
    true
}

/// Trigger behavior, keyed by the `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Fixed time of day, one occurrence per study day.
    Periodic { hour: u32, minute: u32 },
    /// One randomized occurrence at a time, re-drawn after each delivery.
    RandomEma {
        distance_minutes: i64,
        random_tolerance_minutes: i64,
        delay_minutes: i64,
        time_bucket: String,
        phase_name: String,
    },
    /// Full-day plan: one notification per bucket, minimum distance apart.
    BucketPlan(BucketPlanConfig),
    /// Fires when a named application event is reported.
    Event {
        event_name: String,
        notification_text: String,
    },
}

impl TriggerConfig {
    /// Range checks the decoder cannot express. Rejected configurations
    /// are skipped like any other undecodable trigger entry.
    fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            TriggerConfig::Periodic { hour, minute } => {
                if *hour > 23 || *minute > 59 {
                    return Err(ScheduleError::MissingConfiguration(format!(
                        "{hour:02}:{minute:02} is not a valid time of day"
                    )));
                }
            }
            TriggerConfig::RandomEma {
                distance_minutes,
                random_tolerance_minutes,
                ..
            } => {
                non_negative("distance_minutes", *distance_minutes)?;
                non_negative("random_tolerance_minutes", *random_tolerance_minutes)?;
            }
            TriggerConfig::BucketPlan(cfg) => {
                non_negative("distance_minutes", cfg.distance_minutes)?;
                non_negative("random_tolerance_minutes", cfg.random_tolerance_minutes)?;
            }
            TriggerConfig::Event { .. } => {}
        }
        Ok(())
    }
}

fn non_negative(field: &str, value: i64) -> Result<(), ScheduleError> {
    if value < 0 {
        return Err(ScheduleError::MissingConfiguration(format!(
            "{field} must not be negative, got {value}"
        )));
    }
    Ok(())
}

/// Configuration of a bucketed day plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketPlanConfig {
    pub name: String,
    pub phase_name: String,
    pub time_buckets: Vec<String>,
    pub distance_minutes: i64,
    pub random_tolerance_minutes: i64,
    pub delay_minutes: i64,
    pub modality: TriggerModality,
    pub priority: TriggerPriority,
    pub source: TriggerSource,
    pub notification_text: String,
    /// Trigger used to build escalation slots; `None` disables escalation.
    pub timeout_trigger_id: Option<i64>,
}

/// A named stretch of study days, zero-based from study start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub from_day: u32,
    pub duration_days: u32,
}

impl Phase {
    /// First day index past the phase.
    pub fn end_day(&self) -> u32 {
        self.from_day + self.duration_days
    }
}

/// The whole study: phases, trigger configurations and rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StudyDefinition {
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl StudyDefinition {
    /// Decode a study definition, skipping trigger entries that fail to
    /// decode instead of rejecting the whole document.
    pub fn from_json(raw: &str) -> Result<StudyDefinition> {
        #[derive(Deserialize)]
        struct RawStudy {
            #[serde(default)]
            phases: Vec<Phase>,
            #[serde(default)]
            triggers: Vec<Value>,
            #[serde(default)]
            rules: Vec<Rule>,
        }

        let raw: RawStudy = serde_json::from_str(raw)?;
        let mut triggers = Vec::with_capacity(raw.triggers.len());
        for entry in raw.triggers {
            match serde_json::from_value::<Trigger>(entry.clone()) {
                Ok(trigger) => match trigger.config.validate() {
                    Ok(()) => triggers.push(trigger),
                    Err(err) => warn!(%err, id = trigger.id, "skipping unusable trigger entry"),
                },
                Err(err) => warn!(%err, entry = %entry, "skipping undecodable trigger entry"),
            }
        }
        Ok(StudyDefinition {
            phases: raw.phases,
            triggers,
            rules: raw.rules,
        })
    }

    pub fn trigger_by_id(&self, id: i64) -> Option<&Trigger> {
        self.triggers.iter().find(|t| t.id == id)
    }

    pub fn phase_by_name(&self, name: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.name == name)
    }

    /// Total study length in days, from the phase reaching furthest out.
    pub fn duration_days(&self) -> u32 {
        self.phases.iter().map(Phase::end_day).max().unwrap_or(0)
    }
}
