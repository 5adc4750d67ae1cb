use serde::Serialize;
use serde_json::Value;

/// A line emitted by agent code through the `log` capability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentLogEntry {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub capability_calls: u32,
    /// Peak size of the unit's linear memory.
    pub memory_bytes: u64,
    pub output_bytes: u64,
}

/// Why an invocation did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The code did not compile or did not satisfy the unit ABI.
    Parse,
    /// The code trapped or misused the ABI.
    Runtime,
    /// A capability failed and the code never read the error.
    UncaughtService,
    Timeout,
    Cancelled,
}

/// Structured result posted back by a sandbox unit.
///
/// Failures never carry data: partial output of a failed or killed unit is dropped.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
    #[serde(skip)]
    pub failure: Option<FailureKind>,
    /// Replacement memory blob staged by the unit; persisted only on success.
    #[serde(skip)]
    pub memory: Option<Value>,
    #[serde(skip)]
    pub logs: Vec<AgentLogEntry>,
}

impl SandboxResult {
    pub fn succeeded(
        data: Value,
        execution_time_ms: u64,
        resource_usage: ResourceUsage,
        memory: Option<Value>,
        logs: Vec<AgentLogEntry>,
    ) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms,
            resource_usage: Some(resource_usage),
            failure: None,
            memory,
            logs,
        }
    }

    pub fn failed(kind: FailureKind, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            execution_time_ms,
            resource_usage: None,
            failure: Some(kind),
            memory: None,
            logs: Vec::new(),
        }
    }

    /// Keep the log lines of a failed unit; they help diagnose the failure.
    pub fn with_logs(mut self, logs: Vec<AgentLogEntry>) -> Self {
        self.logs = logs;
        self
    }
}
