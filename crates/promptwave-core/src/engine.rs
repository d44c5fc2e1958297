//! Scheduling engine.
//!
//! Owns the store, an alarm backend and a random source, and turns study
//! events (phase boundaries, alarm fires, answers, boots) into persisted
//! trigger records, OS alarms and delivery outcomes. Store failures abort
//! the event; scheduling failures are logged and the engine moves on to
//! the next trigger.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alarm::AlarmBackend;
use crate::bucket::TimeBucket;
use crate::calendar::{next_with_countdown, next_periodic_before};
use crate::config::{BucketPlanConfig, StudyDefinition, Trigger, TriggerConfig};
use crate::error::{CoreError, Result, ScheduleError};
use crate::planner::{day_at, plan_range, with_timeout_slots};
use crate::rules::{evaluate, ElementValue, RuleAction};
use crate::store::Store;
use crate::trigger::{
    NotificationTrigger, TriggerModality, TriggerPriority, TriggerSource, TriggerStatus,
};
use crate::wave;

/// Alarm receiver routing keys.
pub const TRIGGER_RECEIVER: &str = "notification_trigger";
pub const PERIODIC_RECEIVER: &str = "periodic";
pub const RANDOM_RECEIVER: &str = "random_ema";
pub const PHASE_RECEIVER: &str = "phase";

const STUDY_START_KEY: &str = "study_start";

fn os_identifier(receiver: &str, identifier: &str) -> String {
    format!("{receiver}:{identifier}")
}

fn periodic_total_key(trigger_id: i64) -> String {
    format!("periodic_total:{trigger_id}")
}

fn periodic_remaining_key(trigger_id: i64) -> String {
    format!("periodic_remaining:{trigger_id}")
}

fn random_until_key(trigger_id: i64) -> String {
    format!("random_until:{trigger_id}")
}

/// External event the engine reacts to.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A phase boundary was crossed (usually via a phase alarm).
    PhaseActivated { phase: String, at: DateTime<Utc> },
    /// The OS delivered one of our alarms.
    AlarmFired {
        receiver: String,
        identifier: String,
        at: DateTime<Utc>,
    },
    /// A questionnaire opened from a trigger was completed.
    AnswerSubmitted {
        trigger: Uuid,
        values: HashMap<i64, ElementValue>,
        at: DateTime<Utc>,
    },
    /// A named application event was reported.
    AppEvent { name: String, at: DateTime<Utc> },
    /// The device rebooted; OS alarms are gone and must be restored.
    Boot { at: DateTime<Utc> },
    /// The participant withdrew; tear everything down.
    StudyCancelled { at: DateTime<Utc> },
}

/// What the caller should surface to the participant.
#[derive(Debug, Clone)]
pub enum EngineOutcome {
    /// Open the questionnaire of this trigger configuration immediately.
    OpenQuestionnaire { trigger_id: i64 },
    /// Prompt the questionnaire of a periodic or randomized schedule.
    PromptQuestionnaire {
        trigger_id: i64,
        questionnaire_id: i64,
    },
    /// A notification trigger is due for delivery.
    PromptReady(NotificationTrigger),
}

/// The scheduling engine. Generic over the alarm backend and random
/// source so every path is exercisable without a device.
pub struct SchedulingEngine<A, R> {
    store: Store,
    alarms: A,
    rng: R,
}

impl<A: AlarmBackend, R: Rng> SchedulingEngine<A, R> {
    pub fn new(store: Store, alarms: A, rng: R) -> Self {
        Self { store, alarms, rng }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn alarms(&self) -> &A {
        &self.alarms
    }

    /// Dispatch one event. Only store failures abort; scheduling problems
    /// degrade per trigger.
    pub fn handle_event(
        &mut self,
        study: &StudyDefinition,
        event: EngineEvent,
    ) -> Result<Vec<EngineOutcome>> {
        match event {
            EngineEvent::PhaseActivated { phase, at } => match study.phase_by_name(&phase) {
                Some(phase) => {
                    self.activate_phase(study, phase.name.clone(), at)?;
                    Ok(Vec::new())
                }
                None => {
                    warn!(phase = %phase, "activation for unknown phase");
                    Ok(Vec::new())
                }
            },
            EngineEvent::AlarmFired {
                receiver,
                identifier,
                at,
            } => self.on_alarm_fired(study, &receiver, &identifier, at),
            EngineEvent::AnswerSubmitted {
                trigger,
                values,
                at,
            } => self.on_answer_submitted(study, trigger, &values, at),
            EngineEvent::AppEvent { name, at } => self.on_app_event(study, &name, at),
            EngineEvent::Boot { at } => {
                self.on_boot(study, at)?;
                Ok(Vec::new())
            }
            EngineEvent::StudyCancelled { at } => {
                self.cancel_study(study, at)?;
                Ok(Vec::new())
            }
        }
    }

    /// Start the study at `at`: remember the start instant, activate the
    /// day-zero phases and arm alarms for every later phase boundary.
    pub fn begin_study(&mut self, study: &StudyDefinition, at: DateTime<Utc>) -> Result<()> {
        self.store
            .kv_set(STUDY_START_KEY, &at.timestamp_millis().to_string())?;
        info!(phases = study.phases.len(), "study started");
        for phase in &study.phases {
            if phase.from_day == 0 {
                self.activate_phase(study, phase.name.clone(), at)?;
            } else {
                let boundary = day_at(at, phase.from_day);
                let alarm = self
                    .store
                    .get_or_create_alarm(PHASE_RECEIVER, &phase.name, boundary)?;
                self.schedule_best_effort(&os_identifier(PHASE_RECEIVER, &phase.name), alarm.at);
            }
        }
        Ok(())
    }

    /// The trigger the sampling surface should show right now, if any.
    pub fn current_prompt(&self, now: DateTime<Utc>) -> Result<Option<NotificationTrigger>> {
        let day_start = day_at(now, 0);
        let day_end = day_start + Duration::days(1);
        let todays = self.store.triggers_in_interval(day_start, day_end)?;
        Ok(wave::select_current(&todays, now).cloned())
    }

    /// Record that a prompt was shown to the participant.
    pub fn mark_displayed(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        let Some(mut record) = self.store.trigger_by_id(id)? else {
            warn!(%id, "displayed an unknown trigger");
            return Ok(());
        };
        if let Err(err) = record.advance(TriggerStatus::Displayed, now) {
            warn!(%err, "ignoring backward display transition");
            return Ok(());
        }
        self.store.update_trigger(&record)?;
        Ok(())
    }

    fn study_start(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.kv_get(STUDY_START_KEY)? else {
            return Ok(None);
        };
        let ms: i64 = raw
            .parse()
            .map_err(|_| CoreError::Custom(format!("corrupt study start '{raw}'")))?;
        Ok(DateTime::from_timestamp_millis(ms))
    }

    fn activate_phase(
        &mut self,
        study: &StudyDefinition,
        phase_name: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(phase) = study.phase_by_name(&phase_name) else {
            warn!(phase = %phase_name, "activation for unknown phase");
            return Ok(());
        };
        let study_start = self.study_start()?.unwrap_or(now);
        let phase_end = day_at(study_start, phase.end_day());
        info!(phase = %phase.name, %phase_end, "activating phase");

        for trigger in study.triggers.iter().filter(|t| t.enabled) {
            match &trigger.config {
                TriggerConfig::BucketPlan(cfg) if cfg.phase_name == phase.name => {
                    self.activate_bucket_plan(study, trigger, cfg, now, phase_end)?;
                }
                TriggerConfig::Periodic { hour, minute } => {
                    self.activate_periodic(study, trigger, *hour, *minute, now)?;
                }
                TriggerConfig::RandomEma {
                    distance_minutes,
                    random_tolerance_minutes,
                    delay_minutes,
                    time_bucket,
                    phase_name: trigger_phase,
                } if *trigger_phase == phase.name => {
                    self.activate_random(
                        trigger,
                        *distance_minutes,
                        *random_tolerance_minutes,
                        *delay_minutes,
                        time_bucket,
                        now,
                        phase_end,
                    )?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn activate_bucket_plan(
        &mut self,
        study: &StudyDefinition,
        trigger: &Trigger,
        cfg: &BucketPlanConfig,
        now: DateTime<Utc>,
        phase_end: DateTime<Utc>,
    ) -> Result<()> {
        let start_day = day_at(now, 0);
        // a redelivered activation must not plan a second schedule
        if self.store.has_slots_after(trigger.id, start_day)? {
            debug!(trigger = trigger.id, "bucket schedule already present");
            return Ok(());
        }
        let slots = plan_range(
            trigger.id,
            trigger.questionnaire_id,
            cfg,
            start_day,
            phase_end,
            now,
            &mut self.rng,
        );
        let secondaries = self.timeout_slots_for(study, cfg, &slots, now);
        debug!(
            trigger = trigger.id,
            primaries = slots.len(),
            escalations = secondaries.len(),
            "planned bucket schedule"
        );
        for record in slots.iter().chain(&secondaries) {
            self.store.insert_trigger(record)?;
            if record.modality == TriggerModality::Push && record.valid_from > now {
                self.ensure_trigger_alarm(record)?;
            }
        }
        Ok(())
    }

    fn timeout_slots_for(
        &mut self,
        study: &StudyDefinition,
        cfg: &BucketPlanConfig,
        primaries: &[NotificationTrigger],
        now: DateTime<Utc>,
    ) -> Vec<NotificationTrigger> {
        let Some(timeout_id) = cfg.timeout_trigger_id else {
            return Vec::new();
        };
        let Some(timeout) = study.trigger_by_id(timeout_id) else {
            let err = ScheduleError::MissingConfiguration(format!(
                "timeout trigger {timeout_id} not in the study definition"
            ));
            warn!(%err, "no escalations planned");
            return Vec::new();
        };
        let TriggerConfig::BucketPlan(timeout_cfg) = &timeout.config else {
            warn!(timeout_id, "timeout trigger is not a bucket plan");
            return Vec::new();
        };
        with_timeout_slots(
            primaries,
            timeout.id,
            timeout.questionnaire_id,
            timeout_cfg,
            now,
        )
    }

    fn activate_periodic(
        &mut self,
        study: &StudyDefinition,
        trigger: &Trigger,
        hour: u32,
        minute: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // already counting down, leave the schedule alone
        if self
            .store
            .kv_get(&periodic_remaining_key(trigger.id))?
            .is_some()
        {
            return Ok(());
        }
        let total = study.duration_days();
        if total == 0 {
            warn!(trigger = trigger.id, "periodic trigger in a zero-day study");
            return Ok(());
        }
        let occurrence = next_with_countdown(now, hour, minute, total, total);
        self.store
            .kv_set(&periodic_total_key(trigger.id), &total.to_string())?;
        self.store.kv_set(
            &periodic_remaining_key(trigger.id),
            &occurrence.remaining.to_string(),
        )?;
        let identifier = trigger.id.to_string();
        let alarm = self
            .store
            .get_or_create_alarm(PERIODIC_RECEIVER, &identifier, occurrence.at)?;
        self.schedule_best_effort(&os_identifier(PERIODIC_RECEIVER, &identifier), alarm.at);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn activate_random(
        &mut self,
        trigger: &Trigger,
        distance_minutes: i64,
        tolerance_minutes: i64,
        delay_minutes: i64,
        bucket_spec: &str,
        now: DateTime<Utc>,
        phase_end: DateTime<Utc>,
    ) -> Result<()> {
        let bucket: TimeBucket = match bucket_spec.parse() {
            Ok(bucket) => bucket,
            Err(err) => {
                warn!(%err, trigger = trigger.id, "randomized trigger has a malformed bucket");
                return Ok(());
            }
        };
        self.store.kv_set(
            &random_until_key(trigger.id),
            &phase_end.timestamp_millis().to_string(),
        )?;
        let from = now + Duration::minutes(delay_minutes);
        let next = match crate::planner::next_random_occurrence(
            from,
            distance_minutes,
            tolerance_minutes,
            &bucket,
            &mut self.rng,
        ) {
            Ok(next) => next,
            Err(err) => {
                warn!(%err, trigger = trigger.id, "cannot draw a randomized occurrence");
                return Ok(());
            }
        };
        if next > phase_end {
            return Ok(());
        }
        let identifier = trigger.id.to_string();
        let alarm = self
            .store
            .get_or_create_alarm(RANDOM_RECEIVER, &identifier, next)?;
        self.schedule_best_effort(&os_identifier(RANDOM_RECEIVER, &identifier), alarm.at);
        Ok(())
    }

    /// Ask for an exact wake-up, falling back to an inexact one when the
    /// platform refuses.
    fn schedule_best_effort(&mut self, identifier: &str, at: DateTime<Utc>) {
        if self.alarms.schedule(identifier, at, true).is_ok() {
            return;
        }
        let denied = ScheduleError::SchedulingDenied {
            identifier: identifier.to_string(),
        };
        warn!(%denied, "degrading to an inexact alarm");
        if self.alarms.schedule(identifier, at, false).is_err() {
            warn!(identifier, "inexact alarm denied as well, giving up");
        }
    }

    fn ensure_trigger_alarm(&mut self, record: &NotificationTrigger) -> Result<()> {
        let identifier = record.id.to_string();
        let alarm =
            self.store
                .get_or_create_alarm(TRIGGER_RECEIVER, &identifier, record.valid_from)?;
        self.schedule_best_effort(&os_identifier(TRIGGER_RECEIVER, &identifier), alarm.at);
        Ok(())
    }

    fn on_alarm_fired(
        &mut self,
        study: &StudyDefinition,
        receiver: &str,
        identifier: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<EngineOutcome>> {
        match receiver {
            PHASE_RECEIVER => {
                self.store.delete_alarm_by_identifier(receiver, identifier)?;
                self.activate_phase(study, identifier.to_string(), at)?;
                Ok(Vec::new())
            }
            PERIODIC_RECEIVER => self.on_periodic_fired(study, identifier, at),
            RANDOM_RECEIVER => self.on_random_fired(study, identifier, at),
            TRIGGER_RECEIVER => self.on_trigger_fired(identifier, at),
            _ => {
                warn!(receiver, identifier, "alarm for unknown receiver");
                Ok(Vec::new())
            }
        }
    }

    fn on_periodic_fired(
        &mut self,
        study: &StudyDefinition,
        identifier: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<EngineOutcome>> {
        let Ok(trigger_id) = identifier.parse::<i64>() else {
            warn!(identifier, "periodic alarm with a non-numeric identifier");
            return Ok(Vec::new());
        };
        let Some(trigger) = study.trigger_by_id(trigger_id) else {
            warn!(trigger_id, "periodic alarm for unknown trigger");
            return Ok(Vec::new());
        };
        let TriggerConfig::Periodic { hour, minute } = trigger.config else {
            warn!(trigger_id, "periodic alarm for non-periodic trigger");
            return Ok(Vec::new());
        };

        let outcomes = vec![EngineOutcome::PromptQuestionnaire {
            trigger_id,
            questionnaire_id: trigger.questionnaire_id,
        }];

        let remaining: u32 = self
            .store
            .kv_get(&periodic_remaining_key(trigger_id))?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        if remaining == 0 {
            self.retire_schedule(PERIODIC_RECEIVER, identifier)?;
            self.store.kv_delete(&periodic_total_key(trigger_id))?;
            self.store.kv_delete(&periodic_remaining_key(trigger_id))?;
            info!(trigger_id, "periodic schedule finished");
            return Ok(outcomes);
        }
        let total: u32 = self
            .store
            .kv_get(&periodic_total_key(trigger_id))?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(remaining);
        let occurrence = next_with_countdown(at, hour, minute, total, remaining);
        self.store.kv_set(
            &periodic_remaining_key(trigger_id),
            &occurrence.remaining.to_string(),
        )?;
        self.move_alarm(PERIODIC_RECEIVER, identifier, occurrence.at)?;
        Ok(outcomes)
    }

    fn on_random_fired(
        &mut self,
        study: &StudyDefinition,
        identifier: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<EngineOutcome>> {
        let Ok(trigger_id) = identifier.parse::<i64>() else {
            warn!(identifier, "randomized alarm with a non-numeric identifier");
            return Ok(Vec::new());
        };
        let Some(trigger) = study.trigger_by_id(trigger_id) else {
            warn!(trigger_id, "randomized alarm for unknown trigger");
            return Ok(Vec::new());
        };
        let TriggerConfig::RandomEma {
            distance_minutes,
            random_tolerance_minutes,
            time_bucket,
            ..
        } = &trigger.config
        else {
            warn!(trigger_id, "randomized alarm for non-randomized trigger");
            return Ok(Vec::new());
        };

        let outcomes = vec![EngineOutcome::PromptQuestionnaire {
            trigger_id,
            questionnaire_id: trigger.questionnaire_id,
        }];

        let until = self
            .store
            .kv_get(&random_until_key(trigger_id))?
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis);
        let Some(until) = until else {
            self.retire_schedule(RANDOM_RECEIVER, identifier)?;
            return Ok(outcomes);
        };

        let bucket: TimeBucket = match time_bucket.parse() {
            Ok(bucket) => bucket,
            Err(err) => {
                warn!(%err, trigger_id, "randomized trigger has a malformed bucket");
                return Ok(outcomes);
            }
        };
        match crate::planner::next_random_occurrence(
            at,
            *distance_minutes,
            *random_tolerance_minutes,
            &bucket,
            &mut self.rng,
        ) {
            Ok(next) if next <= until => self.move_alarm(RANDOM_RECEIVER, identifier, next)?,
            Ok(_) | Err(_) => {
                self.retire_schedule(RANDOM_RECEIVER, identifier)?;
                self.store.kv_delete(&random_until_key(trigger_id))?;
                info!(trigger_id, "randomized schedule finished");
            }
        }
        Ok(outcomes)
    }

    fn on_trigger_fired(
        &mut self,
        identifier: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<EngineOutcome>> {
        let Ok(id) = Uuid::parse_str(identifier) else {
            warn!(identifier, "trigger alarm with a malformed identifier");
            return Ok(Vec::new());
        };
        let Some(mut record) = self.store.trigger_by_id(id)? else {
            warn!(%id, "trigger alarm for a missing record");
            self.store
                .delete_alarm_by_identifier(TRIGGER_RECEIVER, identifier)?;
            return Ok(Vec::new());
        };
        self.store
            .delete_alarm_by_identifier(TRIGGER_RECEIVER, identifier)?;
        if let Err(err) = record.advance(TriggerStatus::Pushed, at) {
            // answered before its alarm fired (e.g. via the widget)
            debug!(%err, "stale trigger alarm");
            return Ok(Vec::new());
        }
        self.store.update_trigger(&record)?;
        Ok(vec![EngineOutcome::PromptReady(record)])
    }

    fn on_answer_submitted(
        &mut self,
        study: &StudyDefinition,
        id: Uuid,
        values: &HashMap<i64, ElementValue>,
        at: DateTime<Utc>,
    ) -> Result<Vec<EngineOutcome>> {
        let Some(mut record) = self.store.trigger_by_id(id)? else {
            warn!(%id, "answer for an unknown trigger");
            return Ok(Vec::new());
        };
        // a redelivered answer must not run the rule actions again
        if record.is_answered() {
            debug!(%id, "answer already recorded");
            return Ok(Vec::new());
        }
        if let Err(err) = record.advance(TriggerStatus::Answered, at) {
            warn!(%err, "ignoring backward answer transition");
            return Ok(Vec::new());
        }
        self.store.update_trigger(&record)?;
        self.cancel_escalations_of(id)?;

        let mut outcomes = Vec::new();
        for (rule, actions) in evaluate(&study.rules, values) {
            info!(rule, "rule matched");
            for action in actions {
                match action {
                    RuleAction::OpenQuestionnaire { trigger_id } => {
                        outcomes.push(EngineOutcome::OpenQuestionnaire {
                            trigger_id: *trigger_id,
                        });
                    }
                    RuleAction::PutNotificationTrigger { trigger_id } => {
                        self.materialize_rule_trigger(study, *trigger_id, &record, at)?;
                    }
                }
            }
        }
        Ok(outcomes)
    }

    /// An answered primary makes its reminders moot.
    fn cancel_escalations_of(&mut self, id: Uuid) -> Result<()> {
        for escalation in self.store.escalations_of(id)? {
            let identifier = escalation.id.to_string();
            self.alarms
                .cancel(&os_identifier(TRIGGER_RECEIVER, &identifier));
            self.store
                .delete_alarm_by_identifier(TRIGGER_RECEIVER, &identifier)?;
            if escalation.status == TriggerStatus::Planned {
                self.store.delete_trigger(escalation.id)?;
            }
        }
        Ok(())
    }

    fn materialize_rule_trigger(
        &mut self,
        study: &StudyDefinition,
        trigger_id: i64,
        answered: &NotificationTrigger,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let Some(trigger) = study.trigger_by_id(trigger_id) else {
            warn!(trigger_id, "rule references an unknown trigger");
            return Ok(());
        };
        let TriggerConfig::BucketPlan(cfg) = &trigger.config else {
            warn!(trigger_id, "rule references a non-plannable trigger");
            return Ok(());
        };
        let record = NotificationTrigger {
            id: Uuid::new_v4(),
            added_at: at,
            name: cfg.name.clone(),
            status: TriggerStatus::Planned,
            valid_from: at + Duration::minutes(cfg.delay_minutes),
            priority: cfg.priority,
            time_bucket: answered.time_bucket.clone(),
            modality: cfg.modality,
            source: TriggerSource::RuleBased,
            questionnaire_id: trigger.questionnaire_id,
            trigger_id,
            escalated_from: None,
            planned_at: Some(at),
            pushed_at: None,
            displayed_at: None,
            answered_at: None,
            updated_at: at,
        };
        self.store.insert_trigger(&record)?;
        if record.modality == TriggerModality::Push {
            self.ensure_trigger_alarm(&record)?;
        }
        Ok(())
    }

    fn on_app_event(
        &mut self,
        study: &StudyDefinition,
        name: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<EngineOutcome>> {
        let mut outcomes = Vec::new();
        for trigger in study.triggers.iter().filter(|t| t.enabled) {
            let TriggerConfig::Event {
                event_name,
                notification_text,
            } = &trigger.config
            else {
                continue;
            };
            if event_name != name {
                continue;
            }
            let record = NotificationTrigger {
                id: Uuid::new_v4(),
                added_at: at,
                name: notification_text.clone(),
                status: TriggerStatus::Pushed,
                valid_from: at,
                priority: TriggerPriority::Default,
                time_bucket: "00:00-23:59".to_string(),
                modality: TriggerModality::EventContingent,
                source: TriggerSource::Scheduled,
                questionnaire_id: trigger.questionnaire_id,
                trigger_id: trigger.id,
                escalated_from: None,
                planned_at: Some(at),
                pushed_at: Some(at),
                displayed_at: None,
                answered_at: None,
                updated_at: at,
            };
            self.store.insert_trigger(&record)?;
            outcomes.push(EngineOutcome::PromptReady(record));
        }
        Ok(outcomes)
    }

    /// Restore OS alarms after a reboot. Every scheduling call goes through
    /// `get_or_create`, so running this twice changes nothing.
    fn on_boot(&mut self, study: &StudyDefinition, at: DateTime<Utc>) -> Result<()> {
        let Some(study_start) = self.study_start()? else {
            warn!("boot before study start, nothing to restore");
            return Ok(());
        };
        info!(%study_start, "restoring alarms after boot");

        for phase in &study.phases {
            let boundary = day_at(study_start, phase.from_day);
            let phase_end = day_at(study_start, phase.end_day());
            if boundary > at {
                let alarm = self
                    .store
                    .get_or_create_alarm(PHASE_RECEIVER, &phase.name, boundary)?;
                self.schedule_best_effort(&os_identifier(PHASE_RECEIVER, &phase.name), alarm.at);
            } else if at < phase_end {
                self.replan_missing(study, phase.name.as_str(), at, phase_end)?;
            }
        }

        // re-arm push deliveries still ahead of us
        for record in self
            .store
            .next_triggers_for_modality(TriggerModality::Push, at)?
        {
            self.ensure_trigger_alarm(&record)?;
        }

        self.restore_countdown_alarms(study, at)?;
        Ok(())
    }

    /// Replan bucket schedules that have no future slots left for an
    /// active phase (e.g. the plan horizon was lost with the database).
    fn replan_missing(
        &mut self,
        study: &StudyDefinition,
        phase_name: &str,
        at: DateTime<Utc>,
        phase_end: DateTime<Utc>,
    ) -> Result<()> {
        let plans: Vec<(Trigger, BucketPlanConfig)> = study
            .triggers
            .iter()
            .filter(|t| t.enabled)
            .filter_map(|t| match &t.config {
                TriggerConfig::BucketPlan(cfg) if cfg.phase_name == phase_name => {
                    Some((t.clone(), cfg.clone()))
                }
                _ => None,
            })
            .collect();
        for (trigger, cfg) in plans {
            if self.store.has_slots_after(trigger.id, at)? {
                continue;
            }
            info!(trigger = trigger.id, "replanning bucket schedule");
            let start_day = day_at(at, 1);
            let slots = plan_range(
                trigger.id,
                trigger.questionnaire_id,
                &cfg,
                start_day,
                phase_end,
                at,
                &mut self.rng,
            );
            let secondaries = self.timeout_slots_for(study, &cfg, &slots, at);
            for record in slots.iter().chain(&secondaries) {
                self.store.insert_trigger(record)?;
                if record.modality == TriggerModality::Push {
                    self.ensure_trigger_alarm(record)?;
                }
            }
        }
        Ok(())
    }

    fn restore_countdown_alarms(&mut self, study: &StudyDefinition, at: DateTime<Utc>) -> Result<()> {
        for trigger in study.triggers.iter().filter(|t| t.enabled) {
            match &trigger.config {
                TriggerConfig::Periodic { hour, minute } => {
                    if self
                        .store
                        .kv_get(&periodic_remaining_key(trigger.id))?
                        .is_none()
                    {
                        continue;
                    }
                    let identifier = trigger.id.to_string();
                    let Some(alarm) = self.store.alarm_by_identifier(PERIODIC_RECEIVER, &identifier)?
                    else {
                        continue;
                    };
                    let next = if alarm.at > at {
                        alarm.at
                    } else {
                        // fire was missed while powered off, slide to the
                        // next occurrence without consuming the countdown
                        let slid = next_periodic_before(at, DateTime::<Utc>::MAX_UTC, *hour, *minute)
                            .unwrap_or(alarm.at);
                        self.store.set_alarm_time(alarm.id, slid)?;
                        slid
                    };
                    self.schedule_best_effort(
                        &os_identifier(PERIODIC_RECEIVER, &identifier),
                        next,
                    );
                }
                TriggerConfig::RandomEma {
                    distance_minutes,
                    random_tolerance_minutes,
                    time_bucket,
                    ..
                } => {
                    let until = self
                        .store
                        .kv_get(&random_until_key(trigger.id))?
                        .and_then(|raw| raw.parse::<i64>().ok())
                        .and_then(DateTime::from_timestamp_millis);
                    let Some(until) = until else { continue };
                    let identifier = trigger.id.to_string();
                    let Some(alarm) = self.store.alarm_by_identifier(RANDOM_RECEIVER, &identifier)?
                    else {
                        continue;
                    };
                    let next = if alarm.at > at {
                        Some(alarm.at)
                    } else {
                        let bucket: TimeBucket = match time_bucket.parse() {
                            Ok(bucket) => bucket,
                            Err(_) => continue,
                        };
                        crate::planner::next_random_occurrence(
                            at,
                            *distance_minutes,
                            *random_tolerance_minutes,
                            &bucket,
                            &mut self.rng,
                        )
                        .ok()
                        .filter(|next| *next <= until)
                    };
                    match next {
                        Some(next) => {
                            if next != alarm.at {
                                self.store.set_alarm_time(alarm.id, next)?;
                            }
                            self.schedule_best_effort(
                                &os_identifier(RANDOM_RECEIVER, &identifier),
                                next,
                            );
                        }
                        None => {
                            self.retire_schedule(RANDOM_RECEIVER, &identifier)?;
                            self.store.kv_delete(&random_until_key(trigger.id))?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Tear everything down. Each alarm is cancelled and deleted on its
    /// own, so an interrupted sweep can simply run again.
    fn cancel_study(&mut self, study: &StudyDefinition, _at: DateTime<Utc>) -> Result<()> {
        for alarm in self.store.all_alarms()? {
            self.alarms
                .cancel(&os_identifier(&alarm.receiver, &alarm.identifier));
            self.store.delete_alarm(alarm.id)?;
        }
        let removed = self.store.delete_planned_before(DateTime::<Utc>::MAX_UTC)?;
        for trigger in &study.triggers {
            self.store.kv_delete(&periodic_total_key(trigger.id))?;
            self.store.kv_delete(&periodic_remaining_key(trigger.id))?;
            self.store.kv_delete(&random_until_key(trigger.id))?;
        }
        self.store.kv_delete(STUDY_START_KEY)?;
        info!(removed, "study cancelled");
        Ok(())
    }

    /// Drop never-delivered records older than `horizon`.
    pub fn sweep_expired(&mut self, horizon: DateTime<Utc>) -> Result<usize> {
        Ok(self.store.delete_planned_before(horizon)?)
    }

    fn move_alarm(&mut self, receiver: &str, identifier: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(alarm) = self.store.alarm_by_identifier(receiver, identifier)? {
            self.store.set_alarm_time(alarm.id, at)?;
        } else {
            self.store.get_or_create_alarm(receiver, identifier, at)?;
        }
        self.schedule_best_effort(&os_identifier(receiver, identifier), at);
        Ok(())
    }

    fn retire_schedule(&mut self, receiver: &str, identifier: &str) -> Result<()> {
        self.alarms.cancel(&os_identifier(receiver, identifier));
        self.store.delete_alarm_by_identifier(receiver, identifier)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::MemoryAlarms;
    use crate::config::Phase;
    use crate::rules::{AnswerValue, Comparator, Condition, ConditionGroup, LogicalOperator, Rule};
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    fn instant(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
    }

    fn engine() -> SchedulingEngine<MemoryAlarms, Pcg64> {
        SchedulingEngine::new(
            Store::open_memory().unwrap(),
            MemoryAlarms::new(),
            Pcg64::seed_from_u64(7),
        )
    }

    fn bucket_plan(id: i64, timeout_trigger_id: Option<i64>, priority: TriggerPriority) -> Trigger {
        Trigger {
            id,
            questionnaire_id: id + 100,
            enabled: true,
            config: TriggerConfig::BucketPlan(BucketPlanConfig {
                name: format!("plan_{id}"),
                phase_name: "baseline".to_string(),
                time_buckets: vec!["09:00-11:29".to_string(), "14:00-16:29".to_string()],
                distance_minutes: 60,
                random_tolerance_minutes: 0,
                delay_minutes: 15,
                modality: TriggerModality::Push,
                priority,
                source: TriggerSource::Scheduled,
                notification_text: "check in".to_string(),
                timeout_trigger_id,
            }),
        }
    }

    fn study_with_plan() -> StudyDefinition {
        StudyDefinition {
            phases: vec![Phase {
                name: "baseline".to_string(),
                from_day: 0,
                duration_days: 2,
            }],
            triggers: vec![
                bucket_plan(1, Some(2), TriggerPriority::Default),
                bucket_plan(2, None, TriggerPriority::WaveBreaking),
            ],
            rules: Vec::new(),
        }
    }

    fn periodic_study(days: u32) -> StudyDefinition {
        StudyDefinition {
            phases: vec![Phase {
                name: "baseline".to_string(),
                from_day: 0,
                duration_days: days,
            }],
            triggers: vec![Trigger {
                id: 7,
                questionnaire_id: 70,
                enabled: true,
                config: TriggerConfig::Periodic { hour: 19, minute: 0 },
            }],
            rules: Vec::new(),
        }
    }

    #[test]
    fn begin_study_plans_and_arms_alarms() {
        let mut engine = engine();
        let study = study_with_plan();
        engine.begin_study(&study, instant(2, 8, 0)).unwrap();

        // 2 days x 2 buckets, primaries from trigger 1 and escalations
        // from trigger 2 (trigger 2 also plans its own slots)
        let records = engine.store().all_triggers().unwrap();
        let primaries = records.iter().filter(|r| r.trigger_id == 1).count();
        let escalations = records.iter().filter(|r| r.escalated_from.is_some()).count();
        assert_eq!(primaries, 4);
        assert_eq!(escalations, 4);
        assert!(engine.alarms().pending_count() > 0);
    }

    #[test]
    fn boot_is_idempotent() {
        let mut engine = engine();
        let study = study_with_plan();
        let start = instant(2, 8, 0);
        engine.begin_study(&study, start).unwrap();

        let records_before = engine.store().all_triggers().unwrap().len();
        let alarms_before = engine.store().all_alarms().unwrap().len();

        let boot = EngineEvent::Boot { at: instant(2, 12, 0) };
        engine.handle_event(&study, boot.clone()).unwrap();
        engine.handle_event(&study, boot).unwrap();

        assert_eq!(engine.store().all_triggers().unwrap().len(), records_before);
        assert_eq!(engine.store().all_alarms().unwrap().len(), alarms_before);
    }

    #[test]
    fn phase_redelivery_does_not_duplicate_plans() {
        let mut engine = engine();
        let study = study_with_plan();
        engine.begin_study(&study, instant(2, 8, 0)).unwrap();

        let records_before = engine.store().all_triggers().unwrap().len();
        let alarms_before = engine.store().all_alarms().unwrap().len();

        let activation = EngineEvent::PhaseActivated {
            phase: "baseline".to_string(),
            at: instant(2, 8, 5),
        };
        engine.handle_event(&study, activation.clone()).unwrap();
        engine.handle_event(&study, activation).unwrap();

        assert_eq!(engine.store().all_triggers().unwrap().len(), records_before);
        assert_eq!(engine.store().all_alarms().unwrap().len(), alarms_before);
    }

    #[test]
    fn answer_redelivery_does_not_rerun_rule_actions() {
        let mut engine = engine();
        let mut study = study_with_plan();
        study.rules.push(Rule {
            name: "follow_up".to_string(),
            conditions: vec![ConditionGroup {
                operator: LogicalOperator::And,
                conditions: vec![Condition {
                    field_name: "mood".to_string(),
                    comparator: Comparator::Equals,
                    expected_value: serde_json::json!("bad"),
                }],
            }],
            actions: vec![RuleAction::PutNotificationTrigger { trigger_id: 2 }],
        });
        engine.begin_study(&study, instant(2, 8, 0)).unwrap();

        let primary = engine
            .store()
            .all_triggers()
            .unwrap()
            .into_iter()
            .find(|r| r.trigger_id == 1 && r.escalated_from.is_none())
            .unwrap();
        let mut values = HashMap::new();
        values.insert(
            1,
            ElementValue {
                element_name: "mood".to_string(),
                value: AnswerValue::Text("bad".to_string()),
            },
        );
        let answer = EngineEvent::AnswerSubmitted {
            trigger: primary.id,
            values,
            at: primary.valid_from,
        };
        engine.handle_event(&study, answer.clone()).unwrap();
        let records_after_first = engine.store().all_triggers().unwrap().len();

        engine.handle_event(&study, answer).unwrap();
        assert_eq!(
            engine.store().all_triggers().unwrap().len(),
            records_after_first
        );
    }

    #[test]
    fn denied_exact_alarms_fall_back_to_inexact() {
        let mut engine = SchedulingEngine::new(
            Store::open_memory().unwrap(),
            MemoryAlarms::denying_exact(),
            Pcg64::seed_from_u64(7),
        );
        let study = periodic_study(3);
        engine.begin_study(&study, instant(2, 8, 0)).unwrap();

        let pending: Vec<_> = engine.alarms().pending().collect();
        assert!(!pending.is_empty());
        assert!(pending.iter().all(|(_, _, exact)| !exact));
    }

    #[test]
    fn periodic_chain_prompts_once_per_day() {
        let mut engine = engine();
        let study = periodic_study(3);
        engine.begin_study(&study, instant(2, 8, 0)).unwrap();

        let mut prompts = 0;
        for _ in 0..4 {
            let Some(alarm) = engine
                .store()
                .alarm_by_identifier(PERIODIC_RECEIVER, "7")
                .unwrap()
            else {
                break;
            };
            let outcomes = engine
                .handle_event(
                    &study,
                    EngineEvent::AlarmFired {
                        receiver: PERIODIC_RECEIVER.to_string(),
                        identifier: "7".to_string(),
                        at: alarm.at,
                    },
                )
                .unwrap();
            prompts += outcomes
                .iter()
                .filter(|o| matches!(o, EngineOutcome::PromptQuestionnaire { .. }))
                .count();
        }
        assert_eq!(prompts, 3);
        assert!(engine
            .store()
            .alarm_by_identifier(PERIODIC_RECEIVER, "7")
            .unwrap()
            .is_none());
    }

    #[test]
    fn answer_cancels_pending_escalation() {
        let mut engine = engine();
        let study = study_with_plan();
        engine.begin_study(&study, instant(2, 8, 0)).unwrap();

        let records = engine.store().all_triggers().unwrap();
        let primary = records
            .iter()
            .find(|r| r.trigger_id == 1 && r.escalated_from.is_none())
            .unwrap()
            .clone();
        let escalation = records
            .iter()
            .find(|r| r.escalated_from == Some(primary.id))
            .unwrap()
            .clone();

        engine
            .handle_event(
                &study,
                EngineEvent::AlarmFired {
                    receiver: TRIGGER_RECEIVER.to_string(),
                    identifier: primary.id.to_string(),
                    at: primary.valid_from,
                },
            )
            .unwrap();
        engine
            .handle_event(
                &study,
                EngineEvent::AnswerSubmitted {
                    trigger: primary.id,
                    values: HashMap::new(),
                    at: primary.valid_from + Duration::minutes(2),
                },
            )
            .unwrap();

        assert!(engine
            .store()
            .trigger_by_id(escalation.id)
            .unwrap()
            .is_none());
        assert!(engine
            .store()
            .alarm_by_identifier(TRIGGER_RECEIVER, &escalation.id.to_string())
            .unwrap()
            .is_none());
        let answered = engine.store().trigger_by_id(primary.id).unwrap().unwrap();
        assert_eq!(answered.status, TriggerStatus::Answered);
    }

    #[test]
    fn matched_rule_opens_questionnaire() {
        let mut engine = engine();
        let mut study = study_with_plan();
        study.rules.push(Rule {
            name: "stressed".to_string(),
            conditions: vec![ConditionGroup {
                operator: LogicalOperator::And,
                conditions: vec![Condition {
                    field_name: "mood".to_string(),
                    comparator: Comparator::Equals,
                    expected_value: serde_json::json!("bad"),
                }],
            }],
            actions: vec![RuleAction::OpenQuestionnaire { trigger_id: 2 }],
        });
        engine.begin_study(&study, instant(2, 8, 0)).unwrap();

        let primary = engine
            .store()
            .all_triggers()
            .unwrap()
            .into_iter()
            .find(|r| r.trigger_id == 1 && r.escalated_from.is_none())
            .unwrap();
        let mut values = HashMap::new();
        values.insert(
            1,
            ElementValue {
                element_name: "mood".to_string(),
                value: AnswerValue::Text("bad".to_string()),
            },
        );
        let outcomes = engine
            .handle_event(
                &study,
                EngineEvent::AnswerSubmitted {
                    trigger: primary.id,
                    values,
                    at: primary.valid_from,
                },
            )
            .unwrap();
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, EngineOutcome::OpenQuestionnaire { trigger_id: 2 })));
    }

    #[test]
    fn app_event_prompts_matching_trigger() {
        let mut engine = engine();
        let study = StudyDefinition {
            phases: Vec::new(),
            triggers: vec![Trigger {
                id: 3,
                questionnaire_id: 30,
                enabled: true,
                config: TriggerConfig::Event {
                    event_name: "widget_opened".to_string(),
                    notification_text: "How are you?".to_string(),
                },
            }],
            rules: Vec::new(),
        };
        let outcomes = engine
            .handle_event(
                &study,
                EngineEvent::AppEvent {
                    name: "widget_opened".to_string(),
                    at: instant(2, 10, 0),
                },
            )
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], EngineOutcome::PromptReady(_)));
    }

    #[test]
    fn cancel_study_clears_everything_and_is_rerunnable() {
        let mut engine = engine();
        let study = study_with_plan();
        engine.begin_study(&study, instant(2, 8, 0)).unwrap();
        assert!(engine.store().all_alarms().unwrap().len() > 0);

        let cancel = EngineEvent::StudyCancelled { at: instant(2, 12, 0) };
        engine.handle_event(&study, cancel.clone()).unwrap();
        engine.handle_event(&study, cancel).unwrap();

        assert_eq!(engine.store().all_alarms().unwrap().len(), 0);
        assert_eq!(engine.alarms().pending_count(), 0);
        assert!(engine.store().all_triggers().unwrap().is_empty());
        assert!(engine.store().kv_get(STUDY_START_KEY).unwrap().is_none());
    }

    #[test]
    fn current_prompt_follows_the_wave() {
        let mut engine = engine();
        let study = StudyDefinition {
            phases: vec![Phase {
                name: "baseline".to_string(),
                from_day: 0,
                duration_days: 1,
            }],
            triggers: vec![bucket_plan(1, None, TriggerPriority::Default)],
            rules: Vec::new(),
        };
        engine.begin_study(&study, instant(2, 8, 0)).unwrap();

        // zero tolerance: the morning slot lands at 10:00
        let prompt = engine.current_prompt(instant(2, 10, 0)).unwrap().unwrap();
        assert_eq!(prompt.valid_from, instant(2, 10, 0));

        engine
            .handle_event(
                &study,
                EngineEvent::AnswerSubmitted {
                    trigger: prompt.id,
                    values: HashMap::new(),
                    at: instant(2, 10, 5),
                },
            )
            .unwrap();
        // the answered wave stays closed
        assert!(engine.current_prompt(instant(2, 10, 10)).unwrap().is_none());
    }
}
