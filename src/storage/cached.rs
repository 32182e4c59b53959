use super::{RuleStore, StoreMap};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Read-through cache in front of another store.
///
/// Reads are served from memory once a key has been loaded. All writes go
/// through [`RuleStore::set`], which updates the inner store first and the
/// cache only after that succeeded, so the cache never holds a value the
/// inner store rejected. A read that misses only fills keys nobody wrote
/// while it was loading.
pub struct CachedRuleStore {
    inner: Arc<dyn RuleStore>,
    cache: DashMap<String, Value>,
    write_gate: Mutex<()>,
}

impl CachedRuleStore {
    pub fn new(inner: Arc<dyn RuleStore>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
            write_gate: Mutex::new(()),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

impl RuleStore for CachedRuleStore {
    fn get(&self, keys: Vec<String>) -> BoxFuture<'_, anyhow::Result<StoreMap>> {
        Box::pin(async move {
            let mut out = StoreMap::new();
            let mut missing = Vec::new();
            for key in keys {
                match self.cache.get(&key) {
                    Some(hit) => {
                        out.insert(key, hit.value().clone());
                    }
                    None => missing.push(key),
                }
            }
            if missing.is_empty() {
                return Ok(out);
            }

            let loaded = self.inner.get(missing).await?;
            for (key, value) in loaded {
                // A set that finished during the load already cached a newer value.
                let current = self.cache.entry(key.clone()).or_insert(value).value().clone();
                out.insert(key, current);
            }
            Ok(out)
        })
    }

    fn set(&self, values: StoreMap) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            let _guard = self.write_gate.lock().await;
            self.inner.set(values.clone()).await?;
            for (key, value) in values {
                self.cache.insert(key, value);
            }
            Ok(())
        })
    }
}
