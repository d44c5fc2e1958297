//! Rule inspection CLI commands.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Subcommand;

use promptwave_core::{evaluate, ElementValue, StudyDefinition};

#[derive(Subcommand)]
pub enum RulesAction {
    /// List the rules of a study definition
    List {
        /// Study definition JSON file
        study: PathBuf,
    },

    /// Evaluate the rules against a set of answers
    ///
    /// The answers file is a JSON object keyed by element id:
    ///
    /// ```text
    /// {
    ///   "1": { "element_name": "mood", "value": { "text": "bad" } },
    ///   "2": { "element_name": "slept", "value": { "choice": 0 } }
    /// }
    /// ```
    Eval {
        /// Study definition JSON file
        study: PathBuf,
        /// Answers JSON file
        answers: PathBuf,
    },
}

pub fn run(action: RulesAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        RulesAction::List { study } => list(study),
        RulesAction::Eval { study, answers } => eval(study, answers),
    }
}

fn load_study(path: PathBuf) -> Result<StudyDefinition, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(StudyDefinition::from_json(&raw)?)
}

fn list(study: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let study = load_study(study)?;
    if study.rules.is_empty() {
        println!("No rules defined.");
        return Ok(());
    }
    println!("Rules ({}):", study.rules.len());
    for rule in &study.rules {
        println!("  {}", rule.name);
        println!(
            "    {} condition group(s), {} action(s)",
            rule.conditions.len(),
            rule.actions.len()
        );
    }
    Ok(())
}

fn eval(study: PathBuf, answers: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let study = load_study(study)?;
    let raw = std::fs::read_to_string(answers)?;
    let values: HashMap<i64, ElementValue> = serde_json::from_str(&raw)?;

    let matched = evaluate(&study.rules, &values);
    if matched.is_empty() {
        println!("No rules matched.");
        return Ok(());
    }
    for (name, actions) in matched {
        println!("{name}:");
        for action in actions {
            println!("  {}", serde_json::to_string(action)?);
        }
    }
    Ok(())
}
