use rusqlite::{OptionalExtension, params};

use super::types::{AgentConfiguration, AgentRecord, AgentType, DeploymentStatus};
use super::{NOW_SQL, Store, enum_column, json_column};
use crate::core::error::AgentResult;

/// Fields of an agent that has passed validation and is about to be persisted.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub agent_type: AgentType,
    pub capabilities: Vec<String>,
    pub generated_code: String,
    pub configuration: AgentConfiguration,
}

const AGENT_COLUMNS: &str = "id, owner_id, name, description, category, agent_type, capabilities, \
     generated_code, configuration, deployment_status, status_message, memory, created_at, updated_at";

fn agent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        agent_type: enum_column(row, 5)?,
        capabilities: json_column(row, 6)?,
        generated_code: row.get(7)?,
        configuration: json_column(row, 8)?,
        status: enum_column(row, 9)?,
        status_message: row.get(10)?,
        memory: json_column(row, 11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

impl Store {
    pub async fn insert_agent(&self, agent: &NewAgent) -> AgentResult<AgentRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let capabilities = serde_json::to_string(&agent.capabilities)?;
        let configuration = serde_json::to_string(&agent.configuration)?;

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agents (id, owner_id, name, description, category, agent_type,
                                 capabilities, generated_code, configuration, deployment_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending')",
            params![
                id,
                agent.owner_id,
                agent.name,
                agent.description,
                agent.category,
                agent.agent_type.as_str(),
                capabilities,
                agent.generated_code,
                configuration,
            ],
        )?;

        let record = db.query_row(
            &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
            params![id],
            agent_from_row,
        )?;
        Ok(record)
    }

    pub async fn get_agent(&self, id: &str) -> AgentResult<Option<AgentRecord>> {
        let db = self.db.lock().await;
        let record = db
            .query_row(
                &format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS),
                params![id],
                agent_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub async fn list_agents(&self, owner_id: &str) -> AgentResult<Vec<AgentRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM agents WHERE owner_id = ?1 ORDER BY created_at DESC, rowid DESC",
            AGENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![owner_id], agent_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn list_agents_with_status(
        &self,
        status: DeploymentStatus,
    ) -> AgentResult<Vec<AgentRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM agents WHERE deployment_status = ?1 ORDER BY created_at",
            AGENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status.as_str()], agent_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Overwrite the deployment status. Returns false when the agent does not exist.
    pub async fn set_agent_status(
        &self,
        id: &str,
        status: DeploymentStatus,
        message: Option<&str>,
    ) -> AgentResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "UPDATE agents SET deployment_status = ?1, status_message = ?2, updated_at = {}
                 WHERE id = ?3",
                NOW_SQL
            ),
            params![status.as_str(), message, id],
        )?;
        Ok(rows > 0)
    }

    pub async fn delete_agent(&self, id: &str) -> AgentResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM agents WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }
}
