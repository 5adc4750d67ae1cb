use std::time::Duration;

use thiserror::Error;

use crate::core::store::types::DeploymentStatus;

/// Errors surfaced by the agent execution subsystem.
///
/// `Execution`, `Timeout` and `Cancelled` form the execution-class family: the
/// attempt ran (or was started) and its ledger row carries the message.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("deployment failed: {0}")]
    Deployment(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("execution timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("execution cancelled: {0}")]
    Cancelled(String),

    #[error("agent {0} already has an execution in progress")]
    Busy(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("agent {id} is {status}, expected {expected}")]
    InvalidState {
        id: String,
        status: DeploymentStatus,
        expected: &'static str,
    },

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl AgentError {
    pub fn agent_not_found(id: &str) -> Self {
        AgentError::NotFound {
            kind: "agent",
            id: id.to_string(),
        }
    }

    pub fn execution_not_found(id: &str) -> Self {
        AgentError::NotFound {
            kind: "execution",
            id: id.to_string(),
        }
    }

    pub fn is_execution_class(&self) -> bool {
        matches!(
            self,
            AgentError::Execution(_) | AgentError::Timeout(_) | AgentError::Cancelled(_)
        )
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Persistence(format!("corrupt JSON column: {}", e))
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Failure of a single capability call made from inside a sandbox unit.
///
/// These are handed back to agent code, which may inspect and recover from them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{service} is not configured for this user")]
    NotConfigured { service: String },

    #[error("{service} credential is missing field '{field}'")]
    MissingField { service: String, field: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{service} request failed: {message}")]
    Request { service: String, message: String },

    #[error("{service} responded with HTTP {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    #[error("{service} rejected the request: {message}")]
    Rejected { service: String, message: String },

    #[error("capability call cancelled")]
    Cancelled,
}

/// A stored credential that could not be turned back into plaintext.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("could not decrypt credential for {service}: {reason}")]
pub struct DecryptionError {
    pub service: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_cancel_are_execution_class() {
        assert!(AgentError::Timeout(Duration::from_secs(300)).is_execution_class());
        assert!(AgentError::Cancelled("agent stopped".into()).is_execution_class());
        assert!(AgentError::Execution("boom".into()).is_execution_class());
        assert!(!AgentError::Busy("a1".into()).is_execution_class());
        assert!(!AgentError::Validation("bad".into()).is_execution_class());
    }

    #[test]
    fn timeout_message_reports_seconds() {
        let msg = AgentError::Timeout(Duration::from_millis(1500)).to_string();
        assert_eq!(msg, "execution timed out after 1.5s");
    }

    #[test]
    fn not_configured_names_the_service() {
        let err = ServiceError::NotConfigured {
            service: "slack".into(),
        };
        assert_eq!(err.to_string(), "slack is not configured for this user");
    }
}
