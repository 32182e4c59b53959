//! Request body parsing
//!
//! Extracts an operation name and variables from a raw GraphQL request body.
//! Clients disagree on transport encoding, so three encodings are tried in
//! order and the first that yields something wins:
//!
//! 1. JSON object (`{"operationName": .., "variables": ..}`); a JSON array is a
//!    batch and is reported as such instead of being parsed further
//! 2. URL-encoded form data (`operationName=..&variables=..`)
//! 3. Raw GraphQL text (`query GetUser { .. }`)
//!
//! Parsing never fails. Anything unrecognised becomes [`ParseMode::Unknown`]
//! with an empty operation name and no variables.

use crate::models::Variables;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static RAW_OPERATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:query|mutation|subscription)\s+([A-Za-z0-9_]+)")
        .expect("raw operation pattern is valid")
});

/// Which strategy produced a [`ParsedRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParseMode {
    Json,
    #[serde(rename = "urlencoded")]
    UrlEncoded,
    GraphqlRaw,
    Unknown,
}

impl ParseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseMode::Json => "json",
            ParseMode::UrlEncoded => "urlencoded",
            ParseMode::GraphqlRaw => "graphql-raw",
            ParseMode::Unknown => "unknown",
        }
    }
}

/// Operation name and variables of one intercepted call.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    /// Possibly empty
    pub operation_name: String,
    pub variables: Variables,
    pub mode: ParseMode,
}

impl ParsedRequest {
    pub fn unknown() -> Self {
        Self {
            operation_name: String::new(),
            variables: Variables::new(),
            mode: ParseMode::Unknown,
        }
    }

    fn with_mode(operation_name: String, variables: Variables, mode: ParseMode) -> Self {
        Self {
            operation_name,
            variables,
            mode,
        }
    }
}

/// Result of parsing a request body.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Operation(ParsedRequest),
    /// A JSON array of operations. Batches are never mocked.
    Batched { operations: usize },
}

impl ParseOutcome {
    pub fn is_batched(&self) -> bool {
        matches!(self, ParseOutcome::Batched { .. })
    }

    pub fn into_operation(self) -> Option<ParsedRequest> {
        match self {
            ParseOutcome::Operation(parsed) => Some(parsed),
            ParseOutcome::Batched { .. } => None,
        }
    }
}

pub fn parse(raw_body: &str) -> ParseOutcome {
    let trimmed = raw_body.trim();

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Array(items)) => {
                return ParseOutcome::Batched {
                    operations: items.len(),
                }
            }
            Ok(Value::Object(map)) => {
                let operation_name = map
                    .get("operationName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let variables = map
                    .get("variables")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                return ParseOutcome::Operation(ParsedRequest::with_mode(
                    operation_name,
                    variables,
                    ParseMode::Json,
                ));
            }
            Ok(_) | Err(_) => {}
        }
    }

    if let Some(parsed) = parse_form_encoded(trimmed) {
        return ParseOutcome::Operation(parsed);
    }

    if let Some(caps) = RAW_OPERATION.captures(trimmed) {
        return ParseOutcome::Operation(ParsedRequest::with_mode(
            caps[1].to_string(),
            Variables::new(),
            ParseMode::GraphqlRaw,
        ));
    }

    ParseOutcome::Operation(ParsedRequest::unknown())
}

fn parse_form_encoded(body: &str) -> Option<ParsedRequest> {
    if !body.contains('=') || !(body.contains("operationName=") || body.contains("query=")) {
        return None;
    }

    let mut operation_name = None;
    let mut variables_raw = None;
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        match key.as_ref() {
            "operationName" if operation_name.is_none() => operation_name = Some(value.into_owned()),
            "variables" if variables_raw.is_none() => variables_raw = Some(value.into_owned()),
            _ => {}
        }
    }

    let variables = variables_raw
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();

    Some(ParsedRequest::with_mode(
        operation_name.unwrap_or_default(),
        variables,
        ParseMode::UrlEncoded,
    ))
}
