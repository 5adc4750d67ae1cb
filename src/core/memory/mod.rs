use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::error::{AgentError, AgentResult};
use crate::core::store::NOW_SQL;

/// Per-agent persistent state blob.
///
/// Writes replace the whole blob (last write wins). Callers are responsible for
/// keeping a single writer per agent; the manager writes through
/// [`ExecutionLedger::complete_with_memory`](crate::core::ledger::ExecutionLedger::complete_with_memory)
/// while it holds the agent's execution claim.
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<Mutex<Connection>>,
}

impl MemoryStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub async fn get(&self, agent_id: &str) -> AgentResult<Value> {
        let db = self.db.lock().await;
        let raw: Option<String> = db
            .query_row(
                "SELECT memory FROM agents WHERE id = ?1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| AgentError::agent_not_found(agent_id))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub async fn set(&self, agent_id: &str, blob: &Value) -> AgentResult<()> {
        let encoded = serde_json::to_string(blob)?;
        let db = self.db.lock().await;
        write_blob(&db, agent_id, &encoded)
    }
}

/// Replace the stored blob on `conn`, which may be an open transaction.
pub(crate) fn write_blob(conn: &Connection, agent_id: &str, encoded: &str) -> AgentResult<()> {
    let rows = conn.execute(
        &format!(
            "UPDATE agents SET memory = ?1, updated_at = {} WHERE id = ?2",
            NOW_SQL
        ),
        params![encoded, agent_id],
    )?;
    if rows == 0 {
        return Err(AgentError::agent_not_found(agent_id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::types::{AgentConfiguration, AgentType};
    use crate::core::store::{NewAgent, test_store};
    use serde_json::json;

    async fn store_with_agent() -> (MemoryStore, String) {
        let store = test_store().await;
        let agent = store
            .insert_agent(&NewAgent {
                owner_id: "u1".into(),
                name: "counter".into(),
                description: "counts runs".into(),
                category: None,
                agent_type: AgentType::Autonomous,
                capabilities: vec![],
                generated_code: "(module)".into(),
                configuration: AgentConfiguration::default(),
            })
            .await
            .unwrap();
        (MemoryStore::new(store.get_db()), agent.id)
    }

    #[tokio::test]
    async fn fresh_agent_has_empty_object() {
        let (memory, id) = store_with_agent().await;
        assert_eq!(memory.get(&id).await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn set_overwrites_whole_blob() {
        let (memory, id) = store_with_agent().await;
        memory.set(&id, &json!({"a": 1, "b": 2})).await.unwrap();
        memory.set(&id, &json!({"c": 3})).await.unwrap();
        // No merge: keys from the first write are gone.
        assert_eq!(memory.get(&id).await.unwrap(), json!({"c": 3}));

        memory.set(&id, &json!([1, 2, 3])).await.unwrap();
        assert_eq!(memory.get(&id).await.unwrap(), json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn unknown_agent_is_not_found() {
        let (memory, _) = store_with_agent().await;
        assert!(matches!(
            memory.get("ghost").await,
            Err(AgentError::NotFound { kind: "agent", .. })
        ));
        assert!(matches!(
            memory.set("ghost", &json!({})).await,
            Err(AgentError::NotFound { .. })
        ));
    }
}
