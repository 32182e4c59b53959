//! Rule matching
//!
//! Decides which stored rule, if any, answers a parsed request. Matching is
//! pure: the same request, URL and rule list always select the same rule.

use crate::graphql::equality::deep_equal;
use crate::graphql::parser::ParsedRequest;
use crate::models::{Rule, Variables};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::cmp::Reverse;
use url::Url;

/// Base used to resolve path-only endpoints. Only the resulting path is ever
/// compared, so the origin is irrelevant.
static ENDPOINT_BASE: Lazy<Option<Url>> = Lazy::new(|| Url::parse("http://localhost/").ok());

/// How specific a candidate rule is. Constrained rules outrank wildcards, and
/// among constrained rules more variable keys outrank fewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Specificity {
    constrained: bool,
    keys: usize,
}

impl Specificity {
    pub fn of(rule: &Rule) -> Self {
        match rule.variable_constraint() {
            Some(vars) => Self {
                constrained: true,
                keys: vars.len(),
            },
            None => Self {
                constrained: false,
                keys: 0,
            },
        }
    }
}

/// Select the winning rule for a request, or `None` to pass the call through.
///
/// Ties in specificity keep the order of `rules`.
pub fn select_rule<'a>(request: &ParsedRequest, url: &str, rules: &'a [Rule]) -> Option<&'a Rule> {
    let mut candidates: Vec<&Rule> = rules
        .iter()
        .filter(|rule| is_candidate(rule, request, url))
        .collect();
    candidates.sort_by_key(|rule| Reverse(Specificity::of(rule)));
    candidates.first().copied()
}

/// All rules that would answer this request, most specific first.
pub fn candidates<'a>(request: &ParsedRequest, url: &str, rules: &'a [Rule]) -> Vec<&'a Rule> {
    let mut out: Vec<&Rule> = rules
        .iter()
        .filter(|rule| is_candidate(rule, request, url))
        .collect();
    out.sort_by_key(|rule| Reverse(Specificity::of(rule)));
    out
}

fn is_candidate(rule: &Rule, request: &ParsedRequest, url: &str) -> bool {
    if !endpoint_matches(&rule.endpoint, url) || !operation_matches(rule, request) {
        return false;
    }
    match rule.variable_constraint() {
        Some(expected) => {
            let matched = variables_match(expected, &request.variables);
            tracing::debug!(
                operation = %rule.operation_name,
                endpoint = %rule.endpoint,
                matched,
                "rule variable comparison"
            );
            matched
        }
        None => true,
    }
}

/// Endpoint test, deliberately permissive so rules may be written either as
/// a full URL or as a path: the URL contains the endpoint, the endpoint
/// contains the URL, or the endpoint's path equals the URL.
pub fn endpoint_matches(endpoint: &str, url: &str) -> bool {
    url.contains(endpoint) || endpoint.contains(url) || endpoint_path(endpoint).as_deref() == Some(url)
}

fn endpoint_path(endpoint: &str) -> Option<String> {
    let base = ENDPOINT_BASE.as_ref()?;
    base.join(endpoint).ok().map(|resolved| resolved.path().to_string())
}

fn operation_matches(rule: &Rule, request: &ParsedRequest) -> bool {
    rule.operation_name.is_empty() || rule.operation_name == request.operation_name
}

fn variables_match(expected: &Variables, actual: &Variables) -> bool {
    if actual.is_empty() {
        return false;
    }
    deep_equal(
        &Value::Object(actual.clone()),
        &Value::Object(expected.clone()),
    )
}
