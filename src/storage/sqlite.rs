use super::{RuleStore, StoreMap};
use anyhow::Context;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const DB_FILE: &str = "graphqlens.sqlite";

/// Durable key/value store backed by a single SQLite table.
pub struct SqliteRuleStore {
    db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteRuleStore {
    pub fn new(base_path: &str) -> anyhow::Result<Self> {
        let dir = Path::new(base_path);
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating storage directory {:?}", dir))?;
        }
        let db_path = dir.join(DB_FILE);
        let conn = Connection::open(&db_path)
            .with_context(|| format!("opening database at {:?}", db_path))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;
        tracing::debug!(path = ?db_path, "opened rule store");

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl RuleStore for SqliteRuleStore {
    fn get(&self, keys: Vec<String>) -> BoxFuture<'_, anyhow::Result<StoreMap>> {
        let db = Arc::clone(&self.db);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || -> anyhow::Result<StoreMap> {
                let conn = db.lock().expect("db mutex poisoned");
                let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
                let mut out = StoreMap::new();
                for key in keys {
                    let raw: Option<String> = stmt
                        .query_row(params![key], |row| row.get(0))
                        .optional()?;
                    if let Some(raw) = raw {
                        let value = serde_json::from_str(&raw)
                            .with_context(|| format!("decoding stored value for {key}"))?;
                        out.insert(key, value);
                    }
                }
                Ok(out)
            })
            .await?
        })
    }

    fn set(&self, values: StoreMap) -> BoxFuture<'_, anyhow::Result<()>> {
        let db = Arc::clone(&self.db);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
                let mut conn = db.lock().expect("db mutex poisoned");
                let tx = conn.transaction()?;
                for (key, value) in &values {
                    tx.execute(
                        "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
                        params![key, serde_json::to_string(value)?],
                    )
                    .with_context(|| format!("writing setting {key}"))?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?
        })
    }
}
