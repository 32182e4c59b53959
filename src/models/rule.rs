//! Mock rules and rule-set snapshots.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Variables of a GraphQL operation, keyed by variable name.
pub type Variables = Map<String, Value>;

/// A user-authored mock: requests to `endpoint` running `operation_name`
/// (optionally with exactly `variables`) are answered with `response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    /// Empty string matches any operation
    #[serde(default)]
    pub operation_name: String,
    pub endpoint: String,
    pub status_code: u16,
    #[serde(default)]
    pub response: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Variables>,
}

impl Rule {
    /// The variables constraint, if this rule declares a non-empty one.
    /// An empty mapping constrains nothing.
    pub fn variable_constraint(&self) -> Option<&Variables> {
        self.variables.as_ref().filter(|vars| !vars.is_empty())
    }

    pub fn is_wildcard(&self) -> bool {
        self.variable_constraint().is_none()
    }
}

/// Rule set plus the global mocking switch, as stored and as sent over the
/// page bridge.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RulesPayload {
    #[serde(default)]
    pub gql_rules: Vec<Rule>,
    #[serde(default)]
    pub gql_enabled: bool,
}

impl RulesPayload {
    pub fn new(enabled: bool, rules: Vec<Rule>) -> Self {
        Self {
            gql_rules: rules,
            gql_enabled: enabled,
        }
    }

    /// Mocking off, no rules. Used whenever the real snapshot is unavailable.
    pub fn disabled() -> Self {
        Self::default()
    }
}
