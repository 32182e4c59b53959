use super::{RuleStore, StoreMap};
use futures::future::{self, BoxFuture};
use std::sync::Mutex;

/// In-process store. Contents are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryRuleStore {
    values: Mutex<StoreMap>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: StoreMap) -> Self {
        Self {
            values: Mutex::new(values),
        }
    }
}

impl RuleStore for MemoryRuleStore {
    fn get(&self, keys: Vec<String>) -> BoxFuture<'_, anyhow::Result<StoreMap>> {
        let result = self
            .values
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {}", e))
            .map(|values| {
                keys.into_iter()
                    .filter_map(|key| values.get(&key).cloned().map(|v| (key, v)))
                    .collect()
            });
        Box::pin(future::ready(result))
    }

    fn set(&self, values: StoreMap) -> BoxFuture<'_, anyhow::Result<()>> {
        let result = self
            .values
            .lock()
            .map_err(|e| anyhow::anyhow!("lock poisoned: {}", e))
            .map(|mut stored| stored.extend(values));
        Box::pin(future::ready(result))
    }
}
