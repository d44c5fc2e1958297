//! Wave selection for event-contingent delivery.
//!
//! Triggers planned into the same bucket form a wave: the primary slot plus
//! its escalations. When the participant opens the sampling surface, at
//! most one trigger is offered. The latest already-valid trigger of the
//! current bucket wins, an answered wave stays closed, and an unanswered
//! wave-breaking trigger from an earlier bucket outlives its bucket.

use chrono::{DateTime, Utc};

use crate::bucket::TimeBucket;
use crate::trigger::{NotificationTrigger, TriggerPriority};

fn bucket_of(trigger: &NotificationTrigger) -> Option<TimeBucket> {
    trigger.time_bucket.parse().ok()
}

fn latest_by_valid_from<'a, I>(triggers: I) -> Option<&'a NotificationTrigger>
where
    I: Iterator<Item = &'a NotificationTrigger>,
{
    triggers.max_by_key(|trigger| trigger.valid_from)
}

/// Pick the trigger to offer at `now`, if any.
///
/// Precedence:
/// 1. The latest unanswered wave-breaking trigger whose bucket has already
///    ended. Its wave stays open until answered.
/// 2. Otherwise the latest already-valid trigger of the bucket containing
///    `now`; `None` when that trigger is answered (the wave is closed) or
///    when nothing is valid yet.
///
/// Triggers with an unparseable bucket are never offered.
pub fn select_current<'a>(
    triggers: &'a [NotificationTrigger],
    now: DateTime<Utc>,
) -> Option<&'a NotificationTrigger> {
    let carried_over = latest_by_valid_from(triggers.iter().filter(|trigger| {
        trigger.priority == TriggerPriority::WaveBreaking
            && !trigger.is_answered()
            && trigger.valid_from <= now
            && bucket_of(trigger).is_some_and(|bucket| {
                let (_, end) = bucket.bounds_on(now);
                end < now
            })
    }));
    if carried_over.is_some() {
        return carried_over;
    }

    let latest = latest_by_valid_from(triggers.iter().filter(|trigger| {
        trigger.valid_from <= now && bucket_of(trigger).is_some_and(|bucket| bucket.contains(now))
    }))?;
    (!latest.is_answered()).then_some(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::{TriggerModality, TriggerSource, TriggerStatus};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn instant(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn trigger(
        name: &str,
        bucket: &str,
        valid_from: DateTime<Utc>,
        status: TriggerStatus,
        priority: TriggerPriority,
    ) -> NotificationTrigger {
        NotificationTrigger {
            id: Uuid::new_v4(),
            added_at: valid_from,
            name: name.to_string(),
            status,
            valid_from,
            priority,
            time_bucket: bucket.to_string(),
            modality: TriggerModality::EventContingent,
            source: TriggerSource::Scheduled,
            questionnaire_id: 1,
            trigger_id: 1,
            escalated_from: None,
            planned_at: Some(valid_from),
            pushed_at: None,
            displayed_at: None,
            answered_at: None,
            updated_at: valid_from,
        }
    }

    #[test]
    fn offers_latest_valid_trigger_of_current_bucket() {
        let triggers = vec![
            trigger(
                "primary",
                "09:00-11:29",
                instant(9, 30),
                TriggerStatus::Pushed,
                TriggerPriority::Default,
            ),
            trigger(
                "reminder",
                "09:00-11:29",
                instant(9, 45),
                TriggerStatus::Planned,
                TriggerPriority::Default,
            ),
        ];
        let current = select_current(&triggers, instant(10, 0)).unwrap();
        assert_eq!(current.name, "reminder");
    }

    #[test]
    fn not_yet_valid_trigger_is_skipped() {
        let triggers = vec![
            trigger(
                "primary",
                "09:00-11:29",
                instant(9, 30),
                TriggerStatus::Pushed,
                TriggerPriority::Default,
            ),
            trigger(
                "reminder",
                "09:00-11:29",
                instant(10, 45),
                TriggerStatus::Planned,
                TriggerPriority::Default,
            ),
        ];
        let current = select_current(&triggers, instant(10, 0)).unwrap();
        assert_eq!(current.name, "primary");
    }

    #[test]
    fn answered_wave_stays_closed() {
        let triggers = vec![
            trigger(
                "primary",
                "09:00-11:29",
                instant(9, 30),
                TriggerStatus::Pushed,
                TriggerPriority::Default,
            ),
            trigger(
                "reminder",
                "09:00-11:29",
                instant(9, 45),
                TriggerStatus::Answered,
                TriggerPriority::Default,
            ),
        ];
        assert!(select_current(&triggers, instant(10, 0)).is_none());
    }

    #[test]
    fn nothing_outside_any_bucket() {
        let triggers = vec![trigger(
            "primary",
            "09:00-11:29",
            instant(9, 30),
            TriggerStatus::Pushed,
            TriggerPriority::Default,
        )];
        assert!(select_current(&triggers, instant(12, 0)).is_none());
    }

    #[test]
    fn wave_breaking_outlives_its_bucket() {
        let triggers = vec![
            trigger(
                "urgent",
                "09:00-11:29",
                instant(9, 45),
                TriggerStatus::Pushed,
                TriggerPriority::WaveBreaking,
            ),
            trigger(
                "afternoon",
                "11:30-13:59",
                instant(12, 0),
                TriggerStatus::Planned,
                TriggerPriority::Default,
            ),
        ];
        let current = select_current(&triggers, instant(12, 30)).unwrap();
        assert_eq!(current.name, "urgent");
    }

    #[test]
    fn answered_wave_breaking_releases_later_buckets() {
        let triggers = vec![
            trigger(
                "urgent",
                "09:00-11:29",
                instant(9, 45),
                TriggerStatus::Answered,
                TriggerPriority::WaveBreaking,
            ),
            trigger(
                "afternoon",
                "11:30-13:59",
                instant(12, 0),
                TriggerStatus::Planned,
                TriggerPriority::Default,
            ),
        ];
        let current = select_current(&triggers, instant(12, 30)).unwrap();
        assert_eq!(current.name, "afternoon");
    }

    #[test]
    fn latest_carried_over_wave_breaker_wins() {
        let triggers = vec![
            trigger(
                "urgent_morning",
                "09:00-11:29",
                instant(9, 45),
                TriggerStatus::Pushed,
                TriggerPriority::WaveBreaking,
            ),
            trigger(
                "urgent_noon",
                "11:30-13:59",
                instant(12, 0),
                TriggerStatus::Pushed,
                TriggerPriority::WaveBreaking,
            ),
        ];
        let current = select_current(&triggers, instant(15, 0)).unwrap();
        assert_eq!(current.name, "urgent_noon");
    }

    #[test]
    fn unparseable_bucket_is_never_offered() {
        let triggers = vec![trigger(
            "broken",
            "whenever",
            instant(9, 30),
            TriggerStatus::Planned,
            TriggerPriority::Default,
        )];
        assert!(select_current(&triggers, instant(10, 0)).is_none());
    }
}
