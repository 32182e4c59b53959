//! Rule-set editing operations
//!
//! Validation, duplicate detection, in-place edits and JSON import/export.
//! These are pure functions over a rule list; persisting the result is the
//! caller's job (see [`crate::storage`]).

use crate::graphql::deep_equal;
use crate::models::{Rule, Variables};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("operation name is required")]
    MissingOperationName,
    #[error("endpoint is required")]
    MissingEndpoint,
    #[error("status code {0} is outside 100-599")]
    InvalidStatus(u16),
    #[error("response is not valid JSON: {0}")]
    InvalidResponse(String),
    #[error("variables must be a JSON object")]
    InvalidVariables,
    #[error("a rule for this operation, endpoint and variables already exists")]
    Duplicate { existing_id: String },
    #[error("import must be a JSON array of rules")]
    ImportNotArray,
    #[error("import file is not valid JSON: {0}")]
    ImportParse(String),
    #[error("no valid rules found in import")]
    ImportEmpty,
}

/// Form state of a rule being authored. Text fields hold raw user input.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDraft {
    /// `Some` when editing an existing rule
    pub id: Option<String>,
    pub operation_name: String,
    pub endpoint: String,
    pub status_code: u16,
    pub response_text: String,
    pub variables_text: String,
}

impl Default for RuleDraft {
    fn default() -> Self {
        Self {
            id: None,
            operation_name: String::new(),
            endpoint: String::new(),
            status_code: 200,
            response_text: String::new(),
            variables_text: String::new(),
        }
    }
}

impl RuleDraft {
    /// Validate the draft and turn it into a rule. New rules get a fresh id.
    pub fn build(&self) -> Result<Rule, RuleError> {
        let operation_name = self.operation_name.trim();
        if operation_name.is_empty() {
            return Err(RuleError::MissingOperationName);
        }
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(RuleError::MissingEndpoint);
        }
        if !(100..=599).contains(&self.status_code) {
            return Err(RuleError::InvalidStatus(self.status_code));
        }

        let response = if self.response_text.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(&self.response_text)
                .map_err(|e| RuleError::InvalidResponse(e.to_string()))?
        };

        let variables = if self.variables_text.trim().is_empty() {
            None
        } else {
            match serde_json::from_str::<Value>(&self.variables_text) {
                Ok(Value::Object(map)) if map.is_empty() => None,
                Ok(Value::Object(map)) => Some(map),
                _ => return Err(RuleError::InvalidVariables),
            }
        };

        Ok(Rule {
            id: self.id.clone().unwrap_or_else(new_rule_id),
            operation_name: operation_name.to_string(),
            endpoint: endpoint.to_string(),
            status_code: self.status_code,
            response,
            variables,
        })
    }
}

pub fn new_rule_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A draft pre-filled from `rule`, saved as a new rule.
pub fn duplicate_draft(rule: &Rule) -> RuleDraft {
    RuleDraft {
        id: None,
        operation_name: rule.operation_name.clone(),
        endpoint: rule.endpoint.clone(),
        status_code: rule.status_code,
        response_text: serde_json::to_string_pretty(&rule.response).unwrap_or_default(),
        variables_text: rule
            .variable_constraint()
            .and_then(|vars| serde_json::to_string_pretty(vars).ok())
            .unwrap_or_default(),
    }
}

/// Another rule (not `candidate` itself) with the same operation, endpoint
/// and variables. Absent variables compare equal to `{}`.
pub fn find_duplicate<'a>(rules: &'a [Rule], candidate: &Rule) -> Option<&'a Rule> {
    let empty = Variables::new();
    let wanted = Value::Object(candidate.variables.clone().unwrap_or_default());
    rules.iter().find(|rule| {
        rule.id != candidate.id
            && rule.operation_name == candidate.operation_name
            && rule.endpoint == candidate.endpoint
            && deep_equal(
                &Value::Object(rule.variables.as_ref().unwrap_or(&empty).clone()),
                &wanted,
            )
    })
}

/// Validate a draft against the current list and apply it. Edits keep their
/// position; new rules are appended.
pub fn save_draft(rules: &mut Vec<Rule>, draft: &RuleDraft) -> Result<Rule, RuleError> {
    let rule = draft.build()?;
    if let Some(existing) = find_duplicate(rules, &rule) {
        return Err(RuleError::Duplicate {
            existing_id: existing.id.clone(),
        });
    }
    upsert(rules, rule.clone());
    Ok(rule)
}

pub fn upsert(rules: &mut Vec<Rule>, rule: Rule) {
    match rules.iter_mut().find(|existing| existing.id == rule.id) {
        Some(slot) => *slot = rule,
        None => rules.push(rule),
    }
}

/// Delete rules by id, returning how many were removed.
pub fn remove(rules: &mut Vec<Rule>, ids: &[String]) -> usize {
    let before = rules.len();
    rules.retain(|rule| !ids.contains(&rule.id));
    before - rules.len()
}

/// Pretty JSON array of the rules without their ids.
pub fn export_rules(rules: &[Rule]) -> serde_json::Result<String> {
    let stripped: Vec<Value> = rules
        .iter()
        .map(|rule| -> serde_json::Result<Value> {
            let mut value = serde_json::to_value(rule)?;
            if let Value::Object(map) = &mut value {
                map.remove("id");
            }
            Ok(value)
        })
        .collect::<serde_json::Result<_>>()?;
    serde_json::to_string_pretty(&stripped)
}

/// Sanitize an exported rule file. Every kept entry gets a fresh id.
pub fn parse_import(text: &str) -> Result<Vec<Rule>, RuleError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| RuleError::ImportParse(e.to_string()))?;
    let Value::Array(entries) = value else {
        return Err(RuleError::ImportNotArray);
    };

    let imported: Vec<Rule> = entries.iter().filter_map(sanitize_entry).collect();
    if imported.is_empty() {
        return Err(RuleError::ImportEmpty);
    }
    Ok(imported)
}

/// Append the rules found in `text` to `rules`. Returns the number added.
pub fn import_rules(rules: &mut Vec<Rule>, text: &str) -> Result<usize, RuleError> {
    let imported = parse_import(text)?;
    let count = imported.len();
    rules.extend(imported);
    tracing::info!(count, "imported rules");
    Ok(count)
}

fn sanitize_entry(entry: &Value) -> Option<Rule> {
    let obj = entry.as_object()?;
    let endpoint = obj
        .get("endpoint")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())?;

    let status_code = obj
        .get("statusCode")
        .and_then(Value::as_u64)
        .filter(|code| (100..=599).contains(code))
        .map(|code| code as u16)
        .unwrap_or(200);

    let variables = obj
        .get("variables")
        .and_then(Value::as_object)
        .filter(|vars| !vars.is_empty())
        .cloned();

    Some(Rule {
        id: new_rule_id(),
        operation_name: obj
            .get("operationName")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        endpoint: endpoint.to_string(),
        status_code,
        response: obj
            .get("response")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
        variables,
    })
}
