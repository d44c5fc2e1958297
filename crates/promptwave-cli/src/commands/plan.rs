//! Schedule planning CLI commands.

use std::path::PathBuf;

use chrono::{NaiveDate, TimeZone, Utc};
use clap::Subcommand;
use rand::SeedableRng;
use rand_pcg::Pcg64;

use promptwave_core::planner::{plan_day, plan_range};
use promptwave_core::{format_schedule, StudyDefinition, TriggerConfig};

#[derive(Subcommand)]
pub enum PlanAction {
    /// Plan one day of a bucketed trigger
    Day {
        /// Study definition JSON file
        study: PathBuf,
        /// Trigger id to plan
        trigger: i64,
        /// Day to plan (defaults to today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Seed for reproducible plans
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Plan a range of days of a bucketed trigger
    Range {
        /// Study definition JSON file
        study: PathBuf,
        /// Trigger id to plan
        trigger: i64,
        /// Number of days to plan
        #[arg(long, default_value_t = 7)]
        days: u32,
        /// First day of the range (defaults to today, UTC)
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Seed for reproducible plans
        #[arg(long)]
        seed: Option<u64>,
    },
}

pub fn run(action: PlanAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        PlanAction::Day {
            study,
            trigger,
            date,
            seed,
        } => plan(study, trigger, date, 1, seed),
        PlanAction::Range {
            study,
            trigger,
            days,
            date,
            seed,
        } => plan(study, trigger, date, days, seed),
    }
}

fn plan(
    study_path: PathBuf,
    trigger_id: i64,
    date: Option<NaiveDate>,
    days: u32,
    seed: Option<u64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(study_path)?;
    let study = StudyDefinition::from_json(&raw)?;
    let trigger = study
        .trigger_by_id(trigger_id)
        .ok_or_else(|| format!("no trigger with id {trigger_id}"))?;
    let TriggerConfig::BucketPlan(cfg) = &trigger.config else {
        return Err(format!("trigger {trigger_id} is not a bucketed plan").into());
    };

    let now = Utc::now();
    let start = match date {
        Some(date) => Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap()),
        None => now,
    };
    let mut rng = match seed {
        Some(seed) => Pcg64::seed_from_u64(seed),
        None => Pcg64::from_entropy(),
    };

    let slots = if days == 1 {
        plan_day(trigger_id, trigger.questionnaire_id, cfg, start, now, &mut rng)
    } else {
        let end = start + chrono::Duration::days(i64::from(days));
        plan_range(
            trigger_id,
            trigger.questionnaire_id,
            cfg,
            start,
            end,
            now,
            &mut rng,
        )
    };

    if slots.is_empty() {
        println!("No slots planned.");
        return Ok(());
    }
    println!("{}", format_schedule(&slots));
    Ok(())
}
