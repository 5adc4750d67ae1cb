use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// How an agent gets triggered once deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Scheduled,
    Monitoring,
    Reactive,
    #[default]
    Autonomous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Deployed,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Reactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
}

macro_rules! sql_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!(
                        "unknown {} '{}'",
                        stringify!($ty),
                        other
                    )),
                }
            }
        }
    };
}

sql_enum!(AgentType {
    Scheduled => "scheduled",
    Monitoring => "monitoring",
    Reactive => "reactive",
    Autonomous => "autonomous",
});

sql_enum!(DeploymentStatus {
    Pending => "pending",
    Deployed => "deployed",
    Stopped => "stopped",
    Error => "error",
});

sql_enum!(TriggerType {
    Manual => "manual",
    Scheduled => "scheduled",
    Reactive => "reactive",
});

sql_enum!(ExecutionStatus {
    Running => "running",
    Success => "success",
    Error => "error",
});

/// Trigger policy and free-form parameters attached to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AgentConfiguration {
    /// Timer period for scheduled agents. Fractions of a minute are allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_minutes: Option<f64>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub agent_type: AgentType,
    pub capabilities: Vec<String>,
    pub generated_code: String,
    pub configuration: AgentConfiguration,
    pub status: DeploymentStatus,
    pub status_message: Option<String>,
    pub memory: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub agent_id: String,
    pub trigger_type: TriggerType,
    pub status: ExecutionStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentLogRecord {
    pub id: i64,
    pub agent_id: String,
    pub execution_id: String,
    pub message: String,
    pub data: Option<Value>,
    pub created_at: String,
}
