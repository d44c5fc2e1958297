//! Trigger store CLI commands.

use std::path::PathBuf;

use chrono::Utc;
use clap::Subcommand;
use uuid::Uuid;

use promptwave_core::Store;

#[derive(Subcommand)]
pub enum TriggersAction {
    /// List all notification trigger records
    List {
        /// Path to the scheduling database
        #[arg(long, default_value = "promptwave.db")]
        db: PathBuf,
        /// Emit JSON instead of the table view
        #[arg(long)]
        json: bool,
    },

    /// Show one record by id
    Show {
        id: Uuid,
        #[arg(long, default_value = "promptwave.db")]
        db: PathBuf,
    },

    /// List pending OS alarm rows
    Alarms {
        #[arg(long, default_value = "promptwave.db")]
        db: PathBuf,
    },

    /// Delete never-delivered records that are already in the past
    Sweep {
        #[arg(long, default_value = "promptwave.db")]
        db: PathBuf,
    },
}

pub fn run(action: TriggersAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        TriggersAction::List { db, json } => list(db, json),
        TriggersAction::Show { id, db } => show(db, id),
        TriggersAction::Alarms { db } => alarms(db),
        TriggersAction::Sweep { db } => sweep(db),
    }
}

fn list(db: PathBuf, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(db)?;
    let triggers = store.all_triggers()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&triggers)?);
        return Ok(());
    }
    if triggers.is_empty() {
        println!("No trigger records.");
        return Ok(());
    }
    println!("Triggers ({}):", triggers.len());
    for trigger in triggers {
        println!(
            "  {} {:?} {} | {} | {}",
            trigger.valid_from.format("%Y-%m-%d %H:%M"),
            trigger.status,
            trigger.time_bucket,
            trigger.name,
            trigger.id,
        );
    }
    Ok(())
}

fn show(db: PathBuf, id: Uuid) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(db)?;
    match store.trigger_by_id(id)? {
        Some(trigger) => println!("{}", serde_json::to_string_pretty(&trigger)?),
        None => println!("No record with id {id}."),
    }
    Ok(())
}

fn alarms(db: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(db)?;
    let alarms = store.all_alarms()?;
    if alarms.is_empty() {
        println!("No pending alarms.");
        return Ok(());
    }
    println!("Alarms ({}):", alarms.len());
    for alarm in alarms {
        println!(
            "  {} {}:{} (request code {})",
            alarm.at.format("%Y-%m-%d %H:%M"),
            alarm.receiver,
            alarm.identifier,
            alarm.request_code,
        );
    }
    Ok(())
}

fn sweep(db: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(db)?;
    let removed = store.delete_planned_before(Utc::now())?;
    println!("Removed {removed} stale planned record(s).");
    Ok(())
}
