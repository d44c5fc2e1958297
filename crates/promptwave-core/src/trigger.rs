//! Persisted notification-trigger records.
//!
//! A `NotificationTrigger` is one concrete, scheduled instance of a
//! questionnaire offer with its own lifecycle. Records are created by the
//! scheduling engine (scheduled source) or by rule actions (rule-based
//! source) and only ever move forward through their status progression.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle status. Strictly forward: Planned → Pushed → Displayed → Answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TriggerStatus {
    Planned,
    Pushed,
    Displayed,
    Answered,
}

/// Whether a trigger may supersede the normal delivery ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerPriority {
    Default,
    /// While unanswered, keeps its wave open across later buckets and
    /// supersedes queued default-priority triggers.
    WaveBreaking,
}

/// How the trigger reaches the participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerModality {
    /// Shown only when the participant interacts with the sampling widget.
    EventContingent,
    /// Delivered through an OS alarm and a push notification.
    Push,
}

/// What created the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerSource {
    Scheduled,
    RuleBased,
}

/// Attempted backward status transition.
#[derive(Debug, Error)]
#[error("cannot move trigger {id} from {from:?} back to {to:?}")]
pub struct TransitionError {
    pub id: Uuid,
    pub from: TriggerStatus,
    pub to: TriggerStatus,
}

/// One scheduled/fired/answered notification, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTrigger {
    pub id: Uuid,
    pub added_at: DateTime<Utc>,
    pub name: String,
    pub status: TriggerStatus,
    /// Earliest moment the trigger may fire.
    pub valid_from: DateTime<Utc>,
    pub priority: TriggerPriority,
    /// Canonical form of the bucket the trigger was planned into.
    pub time_bucket: String,
    pub modality: TriggerModality,
    pub source: TriggerSource,
    pub questionnaire_id: i64,
    /// Id of the trigger configuration that produced this record.
    pub trigger_id: i64,
    /// Set when this record is the escalation of another trigger.
    pub escalated_from: Option<Uuid>,
    pub planned_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub displayed_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl NotificationTrigger {
    /// Move the record forward to `to`, stamping the status timestamp
    /// exactly once. Forward jumps are allowed (a trigger delivered while
    /// the app is foregrounded records Pushed and Displayed together);
    /// regressions are refused. Advancing to the current status is a no-op.
    pub fn advance(&mut self, to: TriggerStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if to < self.status {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to,
            });
        }
        if to == self.status {
            return Ok(());
        }
        self.status = to;
        let slot = match to {
            TriggerStatus::Planned => &mut self.planned_at,
            TriggerStatus::Pushed => &mut self.pushed_at,
            TriggerStatus::Displayed => &mut self.displayed_at,
            TriggerStatus::Answered => &mut self.answered_at,
        };
        if slot.is_none() {
            *slot = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn is_answered(&self) -> bool {
        self.status == TriggerStatus::Answered
    }
}

/// One OS-level alarm we asked for, keyed by `(receiver, identifier)`.
///
/// At most one row exists per key; [`request_code_for`] derives a stable
/// request code so repeated boots address the same OS alarm slot.
///
/// [`request_code_for`]: ScheduledAlarm::request_code_for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledAlarm {
    pub id: i64,
    pub added_at: DateTime<Utc>,
    pub receiver: String,
    pub identifier: String,
    pub at: DateTime<Utc>,
    pub request_code: i32,
}

impl ScheduledAlarm {
    /// Stable request code derived from the composite key.
    ///
    /// FNV-1a over `receiver:identifier`. The algorithm must never change:
    /// codes persisted by older builds have to keep addressing the same OS
    /// alarm slot after an upgrade.
    pub fn request_code_for(receiver: &str, identifier: &str) -> i32 {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in receiver.bytes().chain([b':']).chain(identifier.bytes()) {
            hash ^= u32::from(byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash as i32
    }
}
