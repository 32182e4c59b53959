//! Rule administration API
//!
//! What the panel's rule editor does, exposed over a storage directory so a
//! front end without a panel (the CLI) can manage rules too. Each call opens
//! the store, applies one operation from [`crate::rules`] and writes back.

use crate::models::{Rule, RulesPayload};
use crate::rules::{self, RuleDraft};
use crate::storage::{self, RuleStore, SqliteRuleStore};

fn open_store(storage_path: &str) -> Result<SqliteRuleStore, String> {
    SqliteRuleStore::new(storage_path).map_err(|e| format!("{e:#}"))
}

/// Current rules and mocking switch.
pub async fn get_rules(storage_path: String) -> Result<RulesPayload, String> {
    let store = open_store(&storage_path)?;
    Ok(storage::load_payload(&store).await)
}

pub async fn set_mocking_enabled(storage_path: String, enabled: bool) -> Result<bool, String> {
    let store = open_store(&storage_path)?;
    storage::save_enabled(&store, enabled)
        .await
        .map_err(|e| format!("{e:#}"))?;
    tracing::info!(enabled, "mocking switch updated");
    Ok(enabled)
}

/// Validate and store a draft. Returns the saved rule.
pub async fn save_rule(storage_path: String, draft: RuleDraft) -> Result<Rule, String> {
    let store = open_store(&storage_path)?;
    save_rule_in(&store, &draft).await
}

pub async fn delete_rules(storage_path: String, ids: Vec<String>) -> Result<usize, String> {
    let store = open_store(&storage_path)?;
    delete_rules_in(&store, &ids).await
}

/// Append the rules in the JSON file at `file_path`. Returns how many were
/// imported.
pub async fn import_rules_file(storage_path: String, file_path: String) -> Result<usize, String> {
    let text = tokio::fs::read_to_string(&file_path)
        .await
        .map_err(|e| format!("Failed to read {file_path}: {e}"))?;
    let store = open_store(&storage_path)?;
    import_rules_in(&store, &text).await
}

/// Write every rule, without ids, to `file_path`.
pub async fn export_rules_file(storage_path: String, file_path: String) -> Result<usize, String> {
    let store = open_store(&storage_path)?;
    let payload = storage::load_payload(&store).await;
    let text = rules::export_rules(&payload.gql_rules).map_err(|e| e.to_string())?;
    tokio::fs::write(&file_path, text)
        .await
        .map_err(|e| format!("Failed to write {file_path}: {e}"))?;
    Ok(payload.gql_rules.len())
}

async fn save_rule_in(store: &dyn RuleStore, draft: &RuleDraft) -> Result<Rule, String> {
    let mut current = storage::load_payload(store).await.gql_rules;
    let saved = rules::save_draft(&mut current, draft).map_err(|e| e.to_string())?;
    storage::save_rules(store, &current)
        .await
        .map_err(|e| format!("{e:#}"))?;
    Ok(saved)
}

async fn delete_rules_in(store: &dyn RuleStore, ids: &[String]) -> Result<usize, String> {
    let mut current = storage::load_payload(store).await.gql_rules;
    let removed = rules::remove(&mut current, ids);
    if removed > 0 {
        storage::save_rules(store, &current)
            .await
            .map_err(|e| format!("{e:#}"))?;
    }
    Ok(removed)
}

async fn import_rules_in(store: &dyn RuleStore, text: &str) -> Result<usize, String> {
    let mut current = storage::load_payload(store).await.gql_rules;
    let count = rules::import_rules(&mut current, text).map_err(|e| e.to_string())?;
    storage::save_rules(store, &current)
        .await
        .map_err(|e| format!("{e:#}"))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRuleStore;

    fn draft(op: &str) -> RuleDraft {
        RuleDraft {
            operation_name: op.into(),
            endpoint: "/graphql".into(),
            response_text: r#"{"data":{}}"#.into(),
            ..RuleDraft::default()
        }
    }

    #[tokio::test]
    async fn drafts_are_saved_and_duplicates_refused() {
        let store = MemoryRuleStore::new();
        let saved = save_rule_in(&store, &draft("GetUser")).await.unwrap();
        assert!(!saved.id.is_empty());

        let err = save_rule_in(&store, &draft("GetUser")).await.unwrap_err();
        assert!(err.contains("already exists"));

        let rules = storage::load_payload(&store).await.gql_rules;
        assert_eq!(rules, vec![saved]);
    }

    #[tokio::test]
    async fn import_appends_and_delete_removes() {
        let store = MemoryRuleStore::new();
        let existing = save_rule_in(&store, &draft("Viewer")).await.unwrap();

        let count = import_rules_in(
            &store,
            r#"[{"operationName":"GetUser","endpoint":"/graphql"},{"operationName":"NoEndpoint"}]"#,
        )
        .await
        .unwrap();
        assert_eq!(count, 1);

        let rules = storage::load_payload(&store).await.gql_rules;
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id, existing.id);
        assert_eq!(rules[1].operation_name, "GetUser");

        assert_eq!(delete_rules_in(&store, &[existing.id.clone()]).await.unwrap(), 1);
        assert_eq!(delete_rules_in(&store, &[existing.id]).await.unwrap(), 0);
        assert_eq!(storage::load_payload(&store).await.gql_rules.len(), 1);
    }

    #[tokio::test]
    async fn bad_import_leaves_rules_alone() {
        let store = MemoryRuleStore::new();
        save_rule_in(&store, &draft("Viewer")).await.unwrap();
        let err = import_rules_in(&store, r#"{"not":"an array"}"#).await.unwrap_err();
        assert_eq!(err, "import must be a JSON array of rules");
        assert_eq!(storage::load_payload(&store).await.gql_rules.len(), 1);
    }

    #[tokio::test]
    async fn file_round_trip_through_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let storage_path = dir.path().to_string_lossy().to_string();
        let export_path = dir.path().join("rules.json").to_string_lossy().to_string();

        save_rule(storage_path.clone(), draft("GetUser")).await.unwrap();
        set_mocking_enabled(storage_path.clone(), true).await.unwrap();
        assert_eq!(
            export_rules_file(storage_path.clone(), export_path.clone())
                .await
                .unwrap(),
            1
        );

        let other = tempfile::tempdir().unwrap();
        let other_path = other.path().to_string_lossy().to_string();
        assert_eq!(import_rules_file(other_path.clone(), export_path).await.unwrap(), 1);

        let payload = get_rules(other_path).await.unwrap();
        assert!(!payload.gql_enabled);
        assert_eq!(payload.gql_rules[0].operation_name, "GetUser");
        assert!(get_rules(storage_path).await.unwrap().gql_enabled);
    }
}
