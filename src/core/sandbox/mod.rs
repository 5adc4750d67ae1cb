//! Isolated execution of agent code.
//!
//! Every invocation compiles the agent's WebAssembly into a fresh engine and store
//! on a blocking worker thread. The only way out of the unit is the host function
//! table in [`unit`]; there is no filesystem, environment, clock or socket access.

mod capabilities;
mod result;
mod unit;
mod validate;

pub use capabilities::Capabilities;
pub use result::{AgentLogEntry, FailureKind, ResourceUsage, SandboxResult};

use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::config::{SandboxConfig, ServiceEndpoints};
use crate::core::error::{AgentError, AgentResult};
use crate::core::vault::Credentials;

/// Upper bound on how long a terminated unit may take to unwind.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// How often the epoch is bumped while a terminated unit unwinds.
const EPOCH_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub max_memory_bytes: usize,
}

impl SandboxLimits {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.timeout_secs),
            max_memory_bytes: usize::try_from(config.max_memory_mb)
                .unwrap_or(usize::MAX)
                .saturating_mul(1024 * 1024),
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

/// Inputs for one invocation.
pub struct SandboxRequest {
    pub agent_id: String,
    pub code: String,
    pub credentials: Credentials,
    pub configuration: Value,
    pub input: Value,
    pub memory: Value,
}

#[derive(Clone)]
pub struct SandboxRunner {
    limits: SandboxLimits,
    endpoints: ServiceEndpoints,
    client: reqwest::Client,
}

enum Ending {
    Finished(Result<unit::UnitOutcome, tokio::task::JoinError>),
    TimedOut,
    Cancelled,
}

impl SandboxRunner {
    pub fn new(limits: SandboxLimits, endpoints: ServiceEndpoints) -> anyhow::Result<Self> {
        let client = Capabilities::build_client(&endpoints)?;
        Ok(Self {
            limits,
            endpoints,
            client,
        })
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Reject code that would not load as a unit. Nothing is executed.
    pub fn validate(&self, code: &str) -> AgentResult<()> {
        validate::check_code(code).map_err(AgentError::Validation)
    }

    /// Run one invocation to completion, timeout or cancellation.
    ///
    /// Never fails: every outcome is folded into the returned [`SandboxResult`].
    pub async fn run(&self, request: SandboxRequest, cancel: &CancellationToken) -> SandboxResult {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        if cancel.is_cancelled() {
            return SandboxResult::failed(
                FailureKind::Cancelled,
                "execution cancelled",
                elapsed_ms(),
            );
        }

        let engine = match unit::engine() {
            Ok(engine) => engine,
            Err(e) => {
                return SandboxResult::failed(
                    FailureKind::Runtime,
                    format!("could not start sandbox unit: {:#}", e),
                    elapsed_ms(),
                );
            }
        };

        let SandboxRequest {
            agent_id,
            code,
            credentials,
            configuration,
            input,
            memory,
        } = request;

        let unit_cancel = cancel.child_token();
        let capabilities = Arc::new(Capabilities::new(
            self.client.clone(),
            credentials,
            self.endpoints.clone(),
        ));
        let state = unit::UnitState::new(
            agent_id.clone(),
            &input,
            &configuration,
            &memory,
            capabilities,
            unit_cancel.clone(),
            tokio::runtime::Handle::current(),
            self.limits.max_memory_bytes,
        );

        info!(
            "Sandbox unit for agent [{}] starting (timeout: {}s, mem_limit: {}MB)",
            agent_id,
            self.limits.timeout.as_secs_f64(),
            self.limits.max_memory_bytes / (1024 * 1024)
        );

        let unit_engine = engine.clone();
        let mut handle =
            tokio::task::spawn_blocking(move || unit::run_unit(&unit_engine, &code, state));

        let ending = tokio::select! {
            joined = &mut handle => Ending::Finished(joined),
            _ = tokio::time::sleep(self.limits.timeout) => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        let finished = match ending {
            Ending::Finished(Ok(outcome)) => Ok(outcome),
            Ending::Finished(Err(e)) => {
                warn!("Sandbox unit for agent [{}] crashed: {}", agent_id, e);
                return SandboxResult::failed(
                    FailureKind::Runtime,
                    format!("sandbox unit crashed: {}", e),
                    elapsed_ms(),
                );
            }
            Ending::TimedOut => Err((
                FailureKind::Timeout,
                AgentError::Timeout(self.limits.timeout).to_string(),
            )),
            Ending::Cancelled => Err((FailureKind::Cancelled, "execution cancelled".to_string())),
        };

        let outcome = match finished {
            Ok(outcome) => outcome,
            Err((kind, message)) => {
                warn!("Sandbox unit for agent [{}] terminated: {}", agent_id, message);

                // Cancel before bumping the epoch: a unit that has not armed its
                // deadline yet sees the token and never enters guest code.
                unit_cancel.cancel();
                engine.increment_epoch();

                let unwound = tokio::time::timeout(TERMINATION_GRACE, async {
                    let mut ticker = tokio::time::interval(EPOCH_TICK);
                    loop {
                        tokio::select! {
                            joined = &mut handle => break joined,
                            _ = ticker.tick() => engine.increment_epoch(),
                        }
                    }
                })
                .await;
                let logs = match unwound {
                    Ok(Ok(outcome)) => outcome.logs,
                    Ok(Err(_)) => Vec::new(),
                    Err(_) => {
                        warn!(
                            "Sandbox unit for agent [{}] did not unwind within {}s",
                            agent_id,
                            TERMINATION_GRACE.as_secs()
                        );
                        Vec::new()
                    }
                };
                return SandboxResult::failed(kind, message, elapsed_ms()).with_logs(logs);
            }
        };

        let execution_time_ms = elapsed_ms();
        match outcome.result {
            Ok(output) => {
                let data = output.unwrap_or(input);
                let mut usage = outcome.usage;
                usage.output_bytes = data.to_string().len() as u64;
                info!(
                    "Sandbox unit for agent [{}] finished in {}ms ({} capability calls)",
                    agent_id, execution_time_ms, usage.capability_calls
                );
                SandboxResult::succeeded(
                    data,
                    execution_time_ms,
                    usage,
                    outcome.staged_memory,
                    outcome.logs,
                )
            }
            Err((kind, message)) => {
                warn!("Sandbox unit for agent [{}] failed: {}", agent_id, message);
                SandboxResult::failed(kind, message, execution_time_ms).with_logs(outcome.logs)
            }
        }
    }
}
