//! # Promptwave Core Library
//!
//! Core scheduling logic for experience-sampling studies: plan randomized
//! notification slots across time-of-day buckets, drive periodic and
//! randomized countdown schedules through OS alarms, recover everything
//! after a reboot and react to questionnaire answers with rules.
//!
//! ## Architecture
//!
//! - **Calendar**: pure wall-clock arithmetic over an injected "now"
//! - **Planner**: one randomized slot per bucket per day, minimum distance
//!   between consecutive slots
//! - **Engine**: event-driven state machine over the store and an alarm
//!   backend; every alarm goes through a get-or-create keyed row, which
//!   makes boot recovery idempotent
//! - **Store**: SQLite persistence for trigger records, alarms and
//!   scheduling state
//!
//! ## Key Components
//!
//! - [`SchedulingEngine`]: turns study events into alarms and prompts
//! - [`Store`]: trigger and alarm persistence
//! - [`StudyDefinition`]: phases, trigger configurations and rules
//! - [`select_current`]: wave selection for event-contingent delivery

pub mod alarm;
pub mod bucket;
pub mod calendar;
pub mod config;
pub mod engine;
pub mod error;
pub mod planner;
pub mod rules;
pub mod store;
pub mod trigger;
pub mod wave;

pub use alarm::{AlarmBackend, AlarmDenied, MemoryAlarms};
pub use bucket::TimeBucket;
pub use calendar::{
    at_time_of_day, is_before_time_of_day, next_occurrence, next_periodic_before,
    next_with_countdown, NextOccurrence,
};
pub use config::{BucketPlanConfig, Phase, StudyDefinition, Trigger, TriggerConfig};
pub use engine::{EngineEvent, EngineOutcome, SchedulingEngine};
pub use error::{CoreError, Result, ScheduleError, StoreError};
pub use planner::{format_schedule, next_random_occurrence, plan_day, plan_range, with_timeout_slots};
pub use rules::{
    evaluate, AnswerValue, Comparator, Condition, ConditionGroup, ElementValue, LogicalOperator,
    Rule, RuleAction,
};
pub use store::Store;
pub use trigger::{
    NotificationTrigger, ScheduledAlarm, TransitionError, TriggerModality, TriggerPriority,
    TriggerSource, TriggerStatus,
};
pub use wave::select_current;
