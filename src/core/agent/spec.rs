use serde::Deserialize;

use crate::core::error::{AgentError, AgentResult};
use crate::core::scheduler::interval_period;
use crate::core::store::NewAgent;
use crate::core::store::types::{AgentConfiguration, AgentType};

/// Agent definition as produced by the code-generation collaborator.
///
/// Required fields are optional here so a missing one is reported as a
/// validation error rather than a deserialization failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "agent_type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, alias = "generated_code")]
    pub generated_code: Option<String>,
    #[serde(default)]
    pub configuration: AgentConfiguration,
}

fn required(value: Option<String>, field: &str) -> AgentResult<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AgentError::Validation(format!("missing required field '{}'", field))),
    }
}

impl AgentSpec {
    /// Check field presence and trigger configuration. Code well-formedness is
    /// checked separately by the sandbox.
    pub fn into_new_agent(self, owner_id: &str) -> AgentResult<NewAgent> {
        if owner_id.trim().is_empty() {
            return Err(AgentError::Validation("owner id is empty".to_string()));
        }
        let name = required(self.name, "name")?.trim().to_string();
        let description = required(self.description, "description")?;
        let generated_code = required(self.generated_code, "generatedCode")?;
        let Some(raw_capabilities) = self.capabilities else {
            return Err(AgentError::Validation(
                "missing required field 'capabilities'".to_string(),
            ));
        };

        // Capabilities are a set of names.
        let mut capabilities: Vec<String> = raw_capabilities
            .into_iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
            .collect();
        capabilities.sort();
        capabilities.dedup();

        if let Some(minutes) = self.configuration.interval_minutes {
            interval_period(minutes)?;
        }

        Ok(NewAgent {
            owner_id: owner_id.to_string(),
            name,
            description,
            category: self.category.filter(|c| !c.trim().is_empty()),
            agent_type: self.agent_type,
            capabilities,
            generated_code,
            configuration: self.configuration,
        })
    }
}
