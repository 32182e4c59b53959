//! Rule persistence
//!
//! The engine reads and writes its state through [`RuleStore`], a small
//! asynchronous key/value contract. Values are JSON; the two well-known keys
//! hold the rule array and the global mocking switch.

mod cached;
mod memory;
mod sqlite;

pub use cached::CachedRuleStore;
pub use memory::MemoryRuleStore;
pub use sqlite::SqliteRuleStore;

use crate::models::{Rule, RulesPayload};
use futures::future::BoxFuture;
use serde_json::{Map, Value};

pub const RULES_KEY: &str = "gql_rules";
pub const ENABLED_KEY: &str = "gql_enabled";

/// Key/value mapping read from or written to a store.
pub type StoreMap = Map<String, Value>;

/// Asynchronous key/value storage for engine state.
pub trait RuleStore: Send + Sync {
    /// Values for the requested keys. Absent keys are simply missing from
    /// the result.
    fn get(&self, keys: Vec<String>) -> BoxFuture<'_, anyhow::Result<StoreMap>>;

    /// Write every entry of `values`, replacing existing ones.
    fn set(&self, values: StoreMap) -> BoxFuture<'_, anyhow::Result<()>>;
}

fn payload_keys() -> Vec<String> {
    vec![RULES_KEY.to_string(), ENABLED_KEY.to_string()]
}

/// Typed snapshot of the stored rules and switch.
///
/// Never fails: read errors and malformed values are logged and replaced by
/// defaults (no rules, mocking off).
pub async fn load_payload(store: &dyn RuleStore) -> RulesPayload {
    let values = match store.get(payload_keys()).await {
        Ok(values) => values,
        Err(err) => {
            tracing::warn!("failed to read rules from store: {err:#}");
            return RulesPayload::disabled();
        }
    };

    let rules = match values.get(RULES_KEY) {
        Some(raw) => serde_json::from_value::<Vec<Rule>>(raw.clone()).unwrap_or_else(|err| {
            tracing::warn!("stored rules are malformed, ignoring: {err}");
            Vec::new()
        }),
        None => Vec::new(),
    };
    let enabled = values
        .get(ENABLED_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false);

    RulesPayload::new(enabled, rules)
}

pub async fn save_rules(store: &dyn RuleStore, rules: &[Rule]) -> anyhow::Result<()> {
    let mut values = StoreMap::new();
    values.insert(RULES_KEY.to_string(), serde_json::to_value(rules)?);
    store.set(values).await
}

pub async fn save_enabled(store: &dyn RuleStore, enabled: bool) -> anyhow::Result<()> {
    let mut values = StoreMap::new();
    values.insert(ENABLED_KEY.to_string(), Value::Bool(enabled));
    store.set(values).await
}

/// First-run initialisation: write defaults for whichever keys are absent.
/// Existing values are left alone.
pub async fn install_defaults(store: &dyn RuleStore) -> anyhow::Result<()> {
    let existing = store.get(payload_keys()).await?;
    let mut missing = StoreMap::new();
    if !existing.contains_key(RULES_KEY) {
        missing.insert(RULES_KEY.to_string(), Value::Array(Vec::new()));
    }
    if !existing.contains_key(ENABLED_KEY) {
        missing.insert(ENABLED_KEY.to_string(), Value::Bool(false));
    }
    if missing.is_empty() {
        return Ok(());
    }
    tracing::info!(keys = ?missing.keys().collect::<Vec<_>>(), "installing default settings");
    store.set(missing).await
}
