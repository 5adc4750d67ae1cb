use rusqlite::params;

use super::ExecutionLedger;
use crate::core::error::AgentResult;
use crate::core::sandbox::AgentLogEntry;
use crate::core::store::optional_json_column;
use crate::core::store::types::AgentLogRecord;

impl ExecutionLedger {
    /// Persist the lines an invocation emitted through its `log` capability.
    pub async fn append_logs(
        &self,
        agent_id: &str,
        execution_id: &str,
        entries: &[AgentLogEntry],
    ) -> AgentResult<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO agent_logs (agent_id, execution_id, message, data)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for entry in entries {
                let data = entry.data.as_ref().map(serde_json::to_string).transpose()?;
                stmt.execute(params![agent_id, execution_id, entry.message, data])?;
            }
        }
        tx.commit()?;
        Ok(entries.len())
    }

    pub async fn list_logs(&self, agent_id: &str, limit: usize) -> AgentResult<Vec<AgentLogRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, agent_id, execution_id, message, data, created_at
             FROM agent_logs WHERE agent_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_id, limit as i64], |row| {
            Ok(AgentLogRecord {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                execution_id: row.get(2)?,
                message: row.get(3)?,
                data: optional_json_column(row, 4)?,
                created_at: row.get(5)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use serde_json::json;

    #[tokio::test]
    async fn logs_are_stored_and_listed_newest_first() {
        let ledger = ExecutionLedger::new(test_store().await.get_db());
        let entries = vec![
            AgentLogEntry {
                message: "fetched inbox".into(),
                data: Some(json!({"count": 3})),
            },
            AgentLogEntry {
                message: "done".into(),
                data: None,
            },
        ];
        assert_eq!(ledger.append_logs("a1", "e1", &entries).await.unwrap(), 2);
        assert_eq!(ledger.append_logs("a1", "e2", &[]).await.unwrap(), 0);

        let logs = ledger.list_logs("a1", 10).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "done");
        assert_eq!(logs[1].data, Some(json!({"count": 3})));
        assert!(ledger.list_logs("a2", 10).await.unwrap().is_empty());
    }
}
