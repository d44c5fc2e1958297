//! Day planner.
//!
//! Builds the day's notification slots from a bucketed plan: exactly one
//! randomized slot per bucket, with a global minimum distance between
//! consecutive slots. Buckets whose constraints cannot be met are dropped
//! with a warning rather than failing the whole day.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use crate::bucket::TimeBucket;
use crate::calendar::at_time_of_day;
use crate::config::BucketPlanConfig;
use crate::error::ScheduleError;
use crate::trigger::{NotificationTrigger, TriggerStatus};

/// Draw an offset in minutes around `distance`, within the tolerance
/// window. Tolerances at or below zero degenerate to the distance itself.
fn draw_offset_minutes(distance: i64, tolerance: i64, rng: &mut impl Rng) -> i64 {
    let half = (tolerance / 2).max(0);
    rng.gen_range(distance - half..=distance + half)
}

fn slot_record(
    trigger_id: i64,
    questionnaire_id: i64,
    cfg: &BucketPlanConfig,
    bucket: TimeBucket,
    valid_from: DateTime<Utc>,
    now: DateTime<Utc>,
) -> NotificationTrigger {
    NotificationTrigger {
        id: Uuid::new_v4(),
        added_at: now,
        name: cfg.name.clone(),
        status: TriggerStatus::Planned,
        valid_from,
        priority: cfg.priority,
        time_bucket: bucket.to_string(),
        modality: cfg.modality,
        source: cfg.source,
        questionnaire_id,
        trigger_id,
        escalated_from: None,
        planned_at: Some(now),
        pushed_at: None,
        displayed_at: None,
        answered_at: None,
        updated_at: now,
    }
}

/// Plan one notification per bucket on the calendar day of `day`.
///
/// Buckets are processed in start order. Each slot lands at the bucket
/// start plus a randomized offset, clamped into the bucket and pushed
/// forward to keep at least `distance_minutes` after the previous slot.
/// A slot pushed past its bucket end is dropped.
pub fn plan_day(
    trigger_id: i64,
    questionnaire_id: i64,
    cfg: &BucketPlanConfig,
    day: DateTime<Utc>,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> Vec<NotificationTrigger> {
    let mut buckets: Vec<TimeBucket> = Vec::with_capacity(cfg.time_buckets.len());
    for spec in &cfg.time_buckets {
        match spec.parse::<TimeBucket>() {
            Ok(bucket) => buckets.push(bucket),
            Err(err) => warn!(%err, "skipping malformed bucket"),
        }
    }
    buckets.sort_by_key(|bucket| bucket.bounds_on(day).0);

    let distance = Duration::minutes(cfg.distance_minutes);
    let mut slots = Vec::with_capacity(buckets.len());
    let mut previous: Option<DateTime<Utc>> = None;

    for bucket in buckets {
        let (start, end) = bucket.bounds_on(day);
        let offset = draw_offset_minutes(cfg.distance_minutes, cfg.random_tolerance_minutes, rng);
        let mut candidate = (start + Duration::minutes(offset)).clamp(start, end);
        if let Some(previous) = previous {
            if candidate < previous + distance {
                candidate = previous + distance;
            }
        }
        if candidate > end {
            let err = ScheduleError::UnsatisfiableConstraint {
                bucket: bucket.to_string(),
                message: "minimum distance pushes the slot past the bucket end".to_string(),
            };
            warn!(%err, "dropping bucket slot");
            continue;
        }
        previous = Some(candidate);
        slots.push(slot_record(
            trigger_id,
            questionnaire_id,
            cfg,
            bucket,
            candidate,
            now,
        ));
    }
    slots
}

/// Plan every day in `[start_day, end_day)`.
pub fn plan_range(
    trigger_id: i64,
    questionnaire_id: i64,
    cfg: &BucketPlanConfig,
    start_day: DateTime<Utc>,
    end_day: DateTime<Utc>,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> Vec<NotificationTrigger> {
    let mut slots = Vec::new();
    let mut day = start_day;
    while day < end_day {
        slots.extend(plan_day(trigger_id, questionnaire_id, cfg, day, now, rng));
        day += Duration::days(1);
    }
    slots
}

/// Escalation slot for every primary: same bucket, delayed by the timeout
/// configuration, linked back through `escalated_from`.
pub fn with_timeout_slots(
    primaries: &[NotificationTrigger],
    timeout_trigger_id: i64,
    timeout_questionnaire_id: i64,
    timeout_cfg: &BucketPlanConfig,
    now: DateTime<Utc>,
) -> Vec<NotificationTrigger> {
    primaries
        .iter()
        .map(|primary| NotificationTrigger {
            id: Uuid::new_v4(),
            added_at: now,
            name: timeout_cfg.name.clone(),
            status: TriggerStatus::Planned,
            valid_from: primary.valid_from + Duration::minutes(timeout_cfg.delay_minutes),
            priority: timeout_cfg.priority,
            time_bucket: primary.time_bucket.clone(),
            modality: timeout_cfg.modality,
            source: timeout_cfg.source,
            questionnaire_id: timeout_questionnaire_id,
            trigger_id: timeout_trigger_id,
            escalated_from: Some(primary.id),
            planned_at: Some(now),
            pushed_at: None,
            displayed_at: None,
            answered_at: None,
            updated_at: now,
        })
        .collect()
}

/// Next randomized occurrence at `distance ± tolerance/2` after `from`.
///
/// A draw outside the bucket restarts at the bucket start on the next day.
/// Bails out after a year of failed draws, which only happens when the
/// distance itself cannot fit the bucket.
pub fn next_random_occurrence(
    from: DateTime<Utc>,
    distance_minutes: i64,
    tolerance_minutes: i64,
    bucket: &TimeBucket,
    rng: &mut impl Rng,
) -> Result<DateTime<Utc>, ScheduleError> {
    let mut cursor = from;
    for _ in 0..366 {
        let offset = draw_offset_minutes(distance_minutes, tolerance_minutes, rng);
        let candidate = cursor + Duration::minutes(offset);
        if bucket.contains(candidate) {
            return Ok(candidate);
        }
        let (next_start, _) = bucket.bounds_on(cursor + Duration::days(1));
        cursor = next_start;
    }
    Err(ScheduleError::UnsatisfiableConstraint {
        bucket: bucket.to_string(),
        message: "randomized distance never lands inside the bucket".to_string(),
    })
}

/// Human-readable one-line-per-slot rendering of a plan.
pub fn format_schedule(slots: &[NotificationTrigger]) -> String {
    slots
        .iter()
        .map(|slot| {
            format!(
                "{} | {} | {}",
                slot.time_bucket,
                slot.name,
                slot.valid_from.format("%Y-%m-%d | %H:%M"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Midnight of the calendar day `days` after `start`.
pub fn day_at(start: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    at_time_of_day(start + Duration::days(i64::from(days)), 0, 0)
}
