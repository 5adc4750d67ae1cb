mod logs;

use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::error::{AgentError, AgentResult};
use crate::core::memory;
use crate::core::store::types::{ExecutionRecord, ExecutionStatus, TriggerType};
use crate::core::store::{NOW_SQL, enum_column, json_column, optional_json_column};

/// Durable log of execution attempts.
///
/// Every attempt is one row: created `running` by [`begin`](Self::begin) and moved to
/// `success`/`error` exactly once by [`complete`](Self::complete).
#[derive(Clone)]
pub struct ExecutionLedger {
    db: Arc<Mutex<Connection>>,
}

const EXECUTION_COLUMNS: &str = "id, agent_id, trigger_type, status, input_data, output_data, \
     error_message, execution_time_ms, started_at, finished_at";

fn execution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        trigger_type: enum_column(row, 2)?,
        status: enum_column(row, 3)?,
        input: json_column(row, 4)?,
        output: optional_json_column(row, 5)?,
        error_message: row.get(6)?,
        execution_time_ms: row.get::<_, Option<i64>>(7)?.map(|ms| ms.max(0) as u64),
        started_at: row.get(8)?,
        finished_at: row.get(9)?,
    })
}

impl ExecutionLedger {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Record the start of an attempt. Fails with `Busy` when the agent already has a
    /// `running` row; the unique partial index makes that check atomic.
    pub async fn begin(
        &self,
        agent_id: &str,
        trigger: TriggerType,
        input: &Value,
    ) -> AgentResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let input_json = serde_json::to_string(input)?;

        let db = self.db.lock().await;
        let inserted = db.execute(
            "INSERT INTO agent_executions (id, agent_id, trigger_type, status, input_data)
             VALUES (?1, ?2, ?3, 'running', ?4)",
            params![id, agent_id, trigger.as_str(), input_json],
        );

        match inserted {
            Ok(_) => Ok(id),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(AgentError::Busy(agent_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Move a running attempt to its final status.
    ///
    /// Returns `Ok(false)` without touching the row when the attempt was already
    /// completed: the first outcome always wins.
    pub async fn complete(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        output: Option<&Value>,
        error_message: Option<&str>,
        execution_time_ms: Option<u64>,
    ) -> AgentResult<bool> {
        self.complete_with_memory(
            execution_id,
            status,
            output,
            error_message,
            execution_time_ms,
            None,
        )
        .await
    }

    /// [`complete`](Self::complete), and replace the agent's memory with `memory`
    /// in the same transaction. Memory is only written when the row is.
    pub async fn complete_with_memory(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        output: Option<&Value>,
        error_message: Option<&str>,
        execution_time_ms: Option<u64>,
        memory: Option<&Value>,
    ) -> AgentResult<bool> {
        if status == ExecutionStatus::Running {
            return Err(AgentError::Validation(
                "an execution cannot be completed as running".to_string(),
            ));
        }
        let output_json = output.map(serde_json::to_string).transpose()?;
        let memory_json = memory.map(serde_json::to_string).transpose()?;

        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let rows = tx.execute(
            &format!(
                "UPDATE agent_executions
                 SET status = ?1, output_data = ?2, error_message = ?3,
                     execution_time_ms = ?4, finished_at = {}
                 WHERE id = ?5 AND status = 'running'",
                NOW_SQL
            ),
            params![
                status.as_str(),
                output_json,
                error_message,
                execution_time_ms.map(|ms| ms as i64),
                execution_id
            ],
        )?;

        if rows == 0 {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT status FROM agent_executions WHERE id = ?1",
                    params![execution_id],
                    |row| row.get(0),
                )
                .optional()?;
            return match exists {
                Some(current) => {
                    warn!(
                        "Execution {} already completed as {}, ignoring {} outcome",
                        execution_id, current, status
                    );
                    Ok(false)
                }
                None => Err(AgentError::execution_not_found(execution_id)),
            };
        }

        if let Some(encoded) = memory_json {
            let agent_id: String = tx.query_row(
                "SELECT agent_id FROM agent_executions WHERE id = ?1",
                params![execution_id],
                |row| row.get(0),
            )?;
            // On error the dropped transaction rolls the status change back.
            memory::write_blob(&tx, &agent_id, &encoded)?;
        }

        tx.commit()?;
        Ok(true)
    }

    pub async fn get(&self, execution_id: &str) -> AgentResult<Option<ExecutionRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                &format!(
                    "SELECT {} FROM agent_executions WHERE id = ?1",
                    EXECUTION_COLUMNS
                ),
                params![execution_id],
                execution_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Most recent attempts first.
    pub async fn list(&self, agent_id: &str, limit: usize) -> AgentResult<Vec<ExecutionRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM agent_executions WHERE agent_id = ?1
             ORDER BY started_at DESC, rowid DESC LIMIT ?2",
            EXECUTION_COLUMNS
        ))?;
        let rows = stmt.query_map(params![agent_id, limit as i64], execution_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    #[cfg(test)]
    pub async fn count_running(&self, agent_id: &str) -> AgentResult<usize> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM agent_executions WHERE agent_id = ?1 AND status = 'running'",
            params![agent_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Close out attempts a previous process left `running`.
    pub async fn recover_interrupted(&self) -> AgentResult<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE agent_executions
                 SET status = 'error', error_message = 'interrupted by process restart',
                     finished_at = {}
                 WHERE status = 'running'",
                NOW_SQL
            ),
            [],
        )?;
        if rows > 0 {
            info!("Marked {} interrupted execution(s) as failed", rows);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::MemoryStore;
    use crate::core::store::types::{AgentConfiguration, AgentType};
    use crate::core::store::{NewAgent, test_store};
    use serde_json::json;

    async fn ledger() -> ExecutionLedger {
        ExecutionLedger::new(test_store().await.get_db())
    }

    #[tokio::test]
    async fn begin_creates_running_row() {
        let ledger = ledger().await;
        let id = ledger
            .begin("a1", TriggerType::Manual, &json!({"x": 1}))
            .await
            .unwrap();
        let row = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Running);
        assert_eq!(row.trigger_type, TriggerType::Manual);
        assert_eq!(row.input, json!({"x": 1}));
        assert!(row.finished_at.is_none());
    }

    #[tokio::test]
    async fn second_running_row_for_same_agent_is_busy() {
        let ledger = ledger().await;
        ledger
            .begin("a1", TriggerType::Scheduled, &json!({}))
            .await
            .unwrap();
        let err = ledger
            .begin("a1", TriggerType::Manual, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Busy(ref id) if id == "a1"));

        // Other agents are unaffected.
        ledger
            .begin("a2", TriggerType::Manual, &json!({}))
            .await
            .unwrap();
        assert_eq!(ledger.count_running("a1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn complete_sets_finished_at_and_is_monotonic() {
        let ledger = ledger().await;
        let id = ledger
            .begin("a1", TriggerType::Manual, &json!({}))
            .await
            .unwrap();

        assert!(
            ledger
                .complete(&id, ExecutionStatus::Success, Some(&json!({"ok": true})), None, Some(12))
                .await
                .unwrap()
        );
        // A late failure must not overwrite the recorded success.
        assert!(
            !ledger
                .complete(&id, ExecutionStatus::Error, None, Some("late"), None)
                .await
                .unwrap()
        );

        let row = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Success);
        assert_eq!(row.output, Some(json!({"ok": true})));
        assert_eq!(row.error_message, None);
        assert_eq!(row.execution_time_ms, Some(12));
        assert!(row.finished_at.is_some());

        // The slot is free again once the row is terminal.
        ledger
            .begin("a1", TriggerType::Manual, &json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn complete_rejects_running_and_unknown_ids() {
        let ledger = ledger().await;
        let id = ledger
            .begin("a1", TriggerType::Manual, &json!({}))
            .await
            .unwrap();
        assert!(matches!(
            ledger
                .complete(&id, ExecutionStatus::Running, None, None, None)
                .await,
            Err(AgentError::Validation(_))
        ));
        assert!(matches!(
            ledger
                .complete("nope", ExecutionStatus::Error, None, Some("x"), None)
                .await,
            Err(AgentError::NotFound { kind: "execution", .. })
        ));
    }

    async fn ledger_with_agent() -> (ExecutionLedger, MemoryStore, String) {
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
        let db = store.get_db();
        (ExecutionLedger::new(db.clone()), MemoryStore::new(db), agent.id)
    }

    #[tokio::test]
    async fn memory_is_written_with_the_outcome() {
        let (ledger, memory, agent_id) = ledger_with_agent().await;
        let id = ledger
            .begin(&agent_id, TriggerType::Manual, &json!({}))
            .await
            .unwrap();

        assert!(
            ledger
                .complete_with_memory(
                    &id,
                    ExecutionStatus::Success,
                    Some(&json!({"ok": true})),
                    None,
                    Some(3),
                    Some(&json!({"runs": 1})),
                )
                .await
                .unwrap()
        );
        assert_eq!(memory.get(&agent_id).await.unwrap(), json!({"runs": 1}));
        let row = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Success);

        // A second outcome for the same attempt changes neither row nor memory.
        assert!(
            !ledger
                .complete_with_memory(
                    &id,
                    ExecutionStatus::Success,
                    None,
                    None,
                    None,
                    Some(&json!({"runs": 99})),
                )
                .await
                .unwrap()
        );
        assert_eq!(memory.get(&agent_id).await.unwrap(), json!({"runs": 1}));
    }

    #[tokio::test]
    async fn failed_memory_write_leaves_attempt_running() {
        let ledger = ledger().await;
        // No agent row exists for "ghost", so the memory write cannot land.
        let id = ledger
            .begin("ghost", TriggerType::Manual, &json!({}))
            .await
            .unwrap();
        let err = ledger
            .complete_with_memory(
                &id,
                ExecutionStatus::Success,
                None,
                None,
                Some(1),
                Some(&json!({"runs": 1})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound { kind: "agent", .. }));

        let row = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Running);
        assert!(row.finished_at.is_none());

        // The attempt can still be closed out.
        assert!(
            ledger
                .complete(&id, ExecutionStatus::Error, None, Some("could not record outcome"), None)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn list_is_reverse_chronological_and_bounded() {
        let ledger = ledger().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = ledger
                .begin("a1", TriggerType::Manual, &json!({ "i": i }))
                .await
                .unwrap();
            ledger
                .complete(&id, ExecutionStatus::Success, None, None, None)
                .await
                .unwrap();
            ids.push(id);
        }
        let listed = ledger.list("a1", 3).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].id, ids[4]);
        assert_eq!(listed[2].id, ids[2]);
    }

    #[tokio::test]
    async fn recover_interrupted_fails_leftover_rows() {
        let ledger = ledger().await;
        let id = ledger
            .begin("a1", TriggerType::Scheduled, &json!({}))
            .await
            .unwrap();
        assert_eq!(ledger.recover_interrupted().await.unwrap(), 1);
        let row = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Error);
        assert_eq!(
            row.error_message.as_deref(),
            Some("interrupted by process restart")
        );
        assert_eq!(ledger.recover_interrupted().await.unwrap(), 0);
    }
}
