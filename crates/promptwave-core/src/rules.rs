//! Answer-driven rules.
//!
//! After a questionnaire is answered its element values are matched against
//! the study's rules. A rule is a list of condition groups (all groups must
//! hold) plus the actions to take when they do. Conditions compare by the
//! textual form of the answer; a referenced element with no answer makes
//! its condition false, never an error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison applied between an answer and the expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Equals,
    NotEquals,
}

/// How conditions inside one group combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// One comparison against a questionnaire element's answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field_name: String,
    pub comparator: Comparator,
    pub expected_value: Value,
}

/// Conditions joined by a logical operator. Defaults to AND.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub operator: LogicalOperator,
    pub conditions: Vec<Condition>,
}

/// A named rule: all groups must hold for the actions to fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub conditions: Vec<ConditionGroup>,
    pub actions: Vec<RuleAction>,
}

/// What a matched rule does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Open the questionnaire of the referenced trigger immediately.
    OpenQuestionnaire { trigger_id: i64 },
    /// Materialize a new notification trigger from the referenced
    /// configuration.
    PutNotificationTrigger { trigger_id: i64 },
}

/// A typed answer to one questionnaire element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerValue {
    Choice(i64),
    Choices(Vec<String>),
    Scale(f64),
    Text(String),
    Quantity(String),
    Time(String),
}

impl AnswerValue {
    /// Textual form used for rule comparison. Multi-choice answers join
    /// with commas; all other kinds render their single value.
    pub fn answer_text(&self) -> Option<String> {
        match self {
            AnswerValue::Choice(value) => Some(value.to_string()),
            AnswerValue::Choices(values) => Some(values.join(",")),
            AnswerValue::Scale(value) => Some(value.to_string()),
            AnswerValue::Text(value)
            | AnswerValue::Quantity(value)
            | AnswerValue::Time(value) => Some(value.clone()),
        }
    }
}

/// One element's answer, keyed in the answer map by element id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementValue {
    pub element_name: String,
    pub value: AnswerValue,
}

fn expected_text(expected: &Value) -> String {
    match expected {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn condition_holds(condition: &Condition, element_values: &HashMap<i64, ElementValue>) -> bool {
    let answer = element_values
        .values()
        .find(|value| value.element_name == condition.field_name)
        .and_then(|value| value.value.answer_text());
    let Some(answer) = answer else {
        // no answer for the referenced element: the condition cannot hold
        return false;
    };
    match condition.comparator {
        Comparator::Equals => answer == expected_text(&condition.expected_value),
        Comparator::NotEquals => answer != expected_text(&condition.expected_value),
    }
}

fn group_holds(group: &ConditionGroup, element_values: &HashMap<i64, ElementValue>) -> bool {
    match group.operator {
        LogicalOperator::And => group
            .conditions
            .iter()
            .all(|c| condition_holds(c, element_values)),
        LogicalOperator::Or => group
            .conditions
            .iter()
            .any(|c| condition_holds(c, element_values)),
    }
}

/// Evaluate every rule against one questionnaire's answers.
///
/// Returns the matched rules in definition order, each with its full
/// action list.
pub fn evaluate<'a>(
    rules: &'a [Rule],
    element_values: &HashMap<i64, ElementValue>,
) -> Vec<(&'a str, &'a [RuleAction])> {
    rules
        .iter()
        .filter(|rule| {
            rule.conditions
                .iter()
                .all(|group| group_holds(group, element_values))
        })
        .map(|rule| (rule.name.as_str(), rule.actions.as_slice()))
        .collect()
}
