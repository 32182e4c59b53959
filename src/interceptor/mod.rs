//! Fetch interception
//!
//! [`FetchInterceptor`] wraps the page's network primitive. Every POST that
//! looks like GraphQL is checked against the current rules; a winning rule
//! produces a fabricated response and the real call is never made. Anything
//! that goes wrong while deciding falls back to the real call.

use crate::bridge::PageBridge;
use crate::graphql::{parse, select_rule, ParseOutcome};
use crate::models::{FetchRequest, FetchResponse, HttpMethod, MockedRequest, Rule};
use futures::future::BoxFuture;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// The network primitive being wrapped.
pub trait Fetch: Send + Sync {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, anyhow::Result<FetchResponse>>;
}

pub struct FetchInterceptor {
    inner: Arc<dyn Fetch>,
    bridge: PageBridge,
}

impl FetchInterceptor {
    pub fn new(inner: Arc<dyn Fetch>, bridge: PageBridge) -> Self {
        Self { inner, bridge }
    }

    pub async fn handle(&self, request: FetchRequest) -> anyhow::Result<FetchResponse> {
        if request.method != HttpMethod::Post {
            return self.inner.fetch(request).await;
        }

        let snapshot = self.bridge.request_rules().await;
        if !snapshot.gql_enabled {
            return self.inner.fetch(request).await;
        }

        let body = request.body_text();
        if !looks_like_graphql(&request.url, &body) {
            return self.inner.fetch(request).await;
        }

        let decision = panic::catch_unwind(AssertUnwindSafe(|| {
            evaluate(&request.url, &body, &snapshot.gql_rules)
        }));
        let rule = match decision {
            Ok(Some(rule)) => rule,
            Ok(None) => return self.inner.fetch(request).await,
            Err(_) => {
                tracing::error!(url = %request.url, "rule evaluation panicked, passing through");
                return self.inner.fetch(request).await;
            }
        };

        match mock_response(&rule) {
            Ok(response) => {
                tracing::info!(
                    url = %request.url,
                    operation = %rule.operation_name,
                    status = rule.status_code,
                    "mocked GraphQL call"
                );
                self.bridge.notify_mocked(MockedRequest {
                    url: request.url,
                    body,
                    response: rule.response,
                    status_code: rule.status_code,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                });
                Ok(response)
            }
            Err(err) => {
                tracing::error!("failed to build mock response, passing through: {err}");
                self.inner.fetch(request).await
            }
        }
    }
}

impl Fetch for FetchInterceptor {
    fn fetch(&self, request: FetchRequest) -> BoxFuture<'_, anyhow::Result<FetchResponse>> {
        Box::pin(self.handle(request))
    }
}

/// Cheap pre-check so unrelated POSTs are never parsed.
pub fn looks_like_graphql(url: &str, body: &str) -> bool {
    url.to_ascii_lowercase().contains("graphql")
        || body.contains("\"query\"")
        || body.contains("persistedQuery")
}

fn evaluate(url: &str, body: &str, rules: &[Rule]) -> Option<Rule> {
    let parsed = match parse(body) {
        ParseOutcome::Operation(parsed) => parsed,
        ParseOutcome::Batched { operations } => {
            tracing::debug!(operations, "batched request, not mocking");
            return None;
        }
    };
    tracing::debug!(
        operation = %parsed.operation_name,
        mode = parsed.mode.as_str(),
        "parsed GraphQL request"
    );
    select_rule(&parsed, url, rules).cloned()
}

fn mock_response(rule: &Rule) -> anyhow::Result<FetchResponse> {
    // Stored rules can bypass the editor, so the status is checked again here.
    if !(100..=599).contains(&rule.status_code) {
        anyhow::bail!("rule {} has unusable status {}", rule.id, rule.status_code);
    }
    let mut response = FetchResponse::json(rule.status_code, &rule.response)?;
    response.mocked = true;
    Ok(response)
}
