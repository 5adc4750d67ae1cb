mod events;
mod spec;
mod status;

pub use events::{EventSource, LocalEventSource};
pub use spec::AgentSpec;
pub use status::can_transition;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::Settings;
use crate::core::error::{AgentError, AgentResult};
use crate::core::ledger::ExecutionLedger;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::memory::MemoryStore;
use crate::core::sandbox::{FailureKind, ResourceUsage, SandboxRequest, SandboxRunner};
use crate::core::scheduler::{ScheduledRunner, Scheduler};
use crate::core::store::Store;
use crate::core::store::types::{
    AgentLogRecord, AgentRecord, AgentType, DeploymentStatus, ExecutionRecord, ExecutionStatus,
    TriggerType,
};
use crate::core::vault::CredentialVault;

/// Status message left on agents stopped by [`AgentManager::shutdown`].
pub const SHUTDOWN_MESSAGE: &str = "stopped at process shutdown";

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub default_interval_minutes: f64,
    pub resume_on_start: bool,
    pub default_list_limit: usize,
    pub max_list_limit: usize,
    /// How long `stop_agent` waits for an in-flight unit to wind down.
    pub stop_grace: Duration,
}

impl ManagerSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            default_interval_minutes: settings.scheduler.default_interval_minutes,
            resume_on_start: settings.scheduler.resume_on_start,
            default_list_limit: settings.ledger.default_limit,
            max_list_limit: settings.ledger.max_limit,
            stop_grace: Duration::from_secs(10),
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// A finished, successful execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedExecution {
    pub execution_id: String,
    pub data: Value,
    pub execution_time_ms: u64,
    pub resource_usage: Option<ResourceUsage>,
}

struct InFlight {
    cancel: CancellationToken,
    done: CancellationToken,
}

/// Per-process bookkeeping of what the manager is driving.
#[derive(Default)]
struct Registry {
    running: HashMap<String, InFlight>,
    /// Agents in the middle of `stop_agent`; no new execution may claim them.
    stopping: HashSet<String>,
    /// Agents deployed by this process.
    tracked: HashSet<String>,
}

/// Exclusive right to run one agent. Releasing it signals anyone waiting in `stop_agent`.
struct Claim<'a> {
    registry: &'a Mutex<Registry>,
    agent_id: String,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        lock(self.registry).running.remove(&self.agent_id);
        self.done.cancel();
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns agent lifecycle and every execution path.
///
/// Executions of one agent never overlap: manual, reactive and scheduled runs all
/// go through the same claim, and a second claim is rejected with `Busy` before
/// any ledger row is written.
pub struct AgentManager {
    me: Weak<AgentManager>,
    store: Store,
    ledger: ExecutionLedger,
    memory: MemoryStore,
    vault: CredentialVault,
    runner: SandboxRunner,
    scheduler: Scheduler,
    events: Arc<dyn EventSource>,
    registry: Mutex<Registry>,
    settings: ManagerSettings,
}

impl AgentManager {
    pub fn new(
        store: Store,
        vault: CredentialVault,
        runner: SandboxRunner,
        events: Arc<dyn EventSource>,
        settings: ManagerSettings,
    ) -> Arc<Self> {
        let ledger = ExecutionLedger::new(store.get_db());
        let memory = MemoryStore::new(store.get_db());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            store,
            ledger,
            memory,
            vault,
            runner,
            scheduler: Scheduler::new(),
            events,
            registry: Mutex::new(Registry::default()),
            settings,
        })
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.ledger
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        lock(&self.registry)
    }

    async fn require_agent(&self, agent_id: &str) -> AgentResult<AgentRecord> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| AgentError::agent_not_found(agent_id))
    }

    // ─── Lifecycle of agents ───

    /// Validate, persist as `pending`, then deploy.
    ///
    /// Invalid specs or code leave no row behind. A deployment failure leaves the
    /// row in `error` and is returned to the caller.
    pub async fn create_agent(&self, owner_id: &str, spec: AgentSpec) -> AgentResult<AgentRecord> {
        let new_agent = spec.into_new_agent(owner_id)?;
        self.runner.validate(&new_agent.generated_code)?;

        let record = self.store.insert_agent(&new_agent).await?;
        info!(
            "Agent [{}] \"{}\" created for owner {}",
            record.id, record.name, owner_id
        );
        self.deploy_agent(&record.id).await
    }

    /// Start the agent according to its trigger model and mark it `deployed`.
    pub async fn deploy_agent(&self, agent_id: &str) -> AgentResult<AgentRecord> {
        let agent = self.require_agent(agent_id).await?;
        if !can_transition(agent.status, DeploymentStatus::Deployed) {
            return Err(AgentError::InvalidState {
                id: agent.id,
                status: agent.status,
                expected: "a deployable status",
            });
        }

        let registered: Result<()> = match agent.agent_type {
            AgentType::Scheduled => {
                let minutes = agent
                    .configuration
                    .interval_minutes
                    .unwrap_or(self.settings.default_interval_minutes);
                let runner: Weak<dyn ScheduledRunner> = self.me.clone();
                self.scheduler
                    .start(&agent.id, minutes, runner)
                    .map(|_| ())
                    .map_err(anyhow::Error::from)
            }
            AgentType::Monitoring | AgentType::Reactive => self.events.subscribe(&agent).await,
            AgentType::Autonomous => Ok(()),
        };

        if let Err(e) = registered {
            let message = format!("{:#}", e);
            error!("Deployment of agent [{}] failed: {}", agent.id, message);
            self.store
                .set_agent_status(&agent.id, DeploymentStatus::Error, Some(&message))
                .await?;
            return Err(AgentError::Deployment(message));
        }

        self.registry().tracked.insert(agent.id.clone());
        self.store
            .set_agent_status(&agent.id, DeploymentStatus::Deployed, None)
            .await?;
        info!(
            "Agent [{}] deployed ({})",
            agent.id,
            agent.agent_type.as_str()
        );
        self.require_agent(agent_id).await
    }

    /// Clear the agent's timer, terminate any in-flight unit and mark it `stopped`.
    ///
    /// When this returns, no execution of the agent is running and none will start
    /// until it is redeployed.
    pub async fn stop_agent(&self, agent_id: &str) -> AgentResult<AgentRecord> {
        self.stop_with_message(agent_id, None).await
    }

    async fn stop_with_message(
        &self,
        agent_id: &str,
        message: Option<&str>,
    ) -> AgentResult<AgentRecord> {
        let agent = self.require_agent(agent_id).await?;

        // Cancelling the timer first means a tick that has not claimed yet will see it.
        self.scheduler.stop(agent_id);
        if matches!(agent.agent_type, AgentType::Monitoring | AgentType::Reactive)
            && let Err(e) = self.events.unsubscribe(agent_id).await
        {
            warn!("Could not unsubscribe agent [{}]: {}", agent_id, e);
        }

        let in_flight = {
            let mut registry = self.registry();
            registry.stopping.insert(agent_id.to_string());
            registry.tracked.remove(agent_id);
            registry.running.get(agent_id).map(|f| {
                f.cancel.cancel();
                f.done.clone()
            })
        };

        if let Some(done) = in_flight {
            info!("Terminating in-flight execution of agent [{}]", agent_id);
            if tokio::time::timeout(self.settings.stop_grace, done.cancelled())
                .await
                .is_err()
            {
                warn!(
                    "In-flight execution of agent [{}] did not finish within {}s",
                    agent_id,
                    self.settings.stop_grace.as_secs()
                );
            }
        }

        let updated = if can_transition(agent.status, DeploymentStatus::Stopped) {
            self.store
                .set_agent_status(agent_id, DeploymentStatus::Stopped, message)
                .await
        } else {
            Ok(true)
        };
        self.registry().stopping.remove(agent_id);
        updated?;

        info!("Agent [{}] stopped", agent_id);
        self.require_agent(agent_id).await
    }

    /// Stop the agent, then remove its row. Its executions stay in the ledger.
    pub async fn delete_agent(&self, agent_id: &str) -> AgentResult<()> {
        self.stop_agent(agent_id).await?;
        if !self.store.delete_agent(agent_id).await? {
            return Err(AgentError::agent_not_found(agent_id));
        }
        info!("Agent [{}] deleted", agent_id);
        Ok(())
    }

    /// Stop every agent this process deployed or is running.
    pub async fn shutdown(&self) -> usize {
        let ids: HashSet<String> = {
            let registry = self.registry();
            registry
                .tracked
                .iter()
                .chain(registry.running.keys())
                .cloned()
                .collect()
        };

        let mut stopped = 0;
        for id in ids {
            match self.stop_with_message(&id, Some(SHUTDOWN_MESSAGE)).await {
                Ok(_) => stopped += 1,
                Err(AgentError::NotFound { .. }) => {}
                Err(e) => warn!("Failed to stop agent [{}] during shutdown: {}", id, e),
            }
        }
        // Timers of agents deleted behind our back.
        self.scheduler.stop_all();
        info!("Agent manager shut down ({} agent(s) stopped)", stopped);
        stopped
    }

    // ─── Execution ───

    /// Run the agent now on behalf of a user.
    pub async fn execute_agent(&self, agent_id: &str, input: Value) -> AgentResult<CompletedExecution> {
        let claim = self.claim(agent_id, None)?;
        let agent = self.require_agent(agent_id).await?;
        self.run_claimed(agent, TriggerType::Manual, input, claim).await
    }

    /// Entry point for the external event source.
    pub async fn dispatch_event(&self, agent_id: &str, payload: Value) -> AgentResult<CompletedExecution> {
        let claim = self.claim(agent_id, None)?;
        let agent = self.require_agent(agent_id).await?;
        if !matches!(agent.agent_type, AgentType::Monitoring | AgentType::Reactive) {
            return Err(AgentError::Validation(format!(
                "agent {} is {}, events are only delivered to monitoring and reactive agents",
                agent.id, agent.agent_type
            )));
        }
        self.run_claimed(agent, TriggerType::Reactive, payload, claim).await
    }

    /// Take the agent's execution slot. When `timer` is given the claim is refused
    /// once that timer has been cleared.
    fn claim(&self, agent_id: &str, timer: Option<&CancellationToken>) -> AgentResult<Claim<'_>> {
        let mut registry = self.registry();
        if timer.is_some_and(CancellationToken::is_cancelled) {
            return Err(AgentError::Cancelled("timer cleared".to_string()));
        }
        if registry.stopping.contains(agent_id) {
            return Err(AgentError::InvalidState {
                id: agent_id.to_string(),
                status: DeploymentStatus::Stopped,
                expected: "deployed",
            });
        }
        if registry.running.contains_key(agent_id) {
            return Err(AgentError::Busy(agent_id.to_string()));
        }

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        registry.running.insert(
            agent_id.to_string(),
            InFlight {
                cancel: cancel.clone(),
                done: done.clone(),
            },
        );
        Ok(Claim {
            registry: &self.registry,
            agent_id: agent_id.to_string(),
            cancel,
            done,
        })
    }

    async fn run_claimed(
        &self,
        agent: AgentRecord,
        trigger: TriggerType,
        input: Value,
        claim: Claim<'_>,
    ) -> AgentResult<CompletedExecution> {
        if agent.status != DeploymentStatus::Deployed {
            return Err(AgentError::InvalidState {
                id: agent.id,
                status: agent.status,
                expected: "deployed",
            });
        }
        if claim.cancel.is_cancelled() {
            return Err(AgentError::Cancelled("agent stopped".to_string()));
        }

        let execution_id = self.ledger.begin(&agent.id, trigger, &input).await?;
        info!(
            "Execution {} of agent [{}] started ({})",
            execution_id, agent.id, trigger
        );

        let resolved = match self.vault.resolve(&agent.owner_id).await {
            Ok(resolved) => resolved,
            Err(e) => {
                let message = format!("credential resolution failed: {}", e);
                if let Err(close) = self
                    .ledger
                    .complete(&execution_id, ExecutionStatus::Error, None, Some(&message), Some(0))
                    .await
                {
                    warn!("Execution {} left running: {}", execution_id, close);
                }
                return Err(e);
            }
        };
        for skipped in &resolved.skipped {
            warn!("Execution {}: {}", execution_id, skipped);
        }

        let request = SandboxRequest {
            agent_id: agent.id.clone(),
            code: agent.generated_code,
            credentials: resolved.credentials,
            configuration: serde_json::to_value(&agent.configuration).unwrap_or_default(),
            input,
            memory: agent.memory,
        };
        let result = self.runner.run(request, &claim.cancel).await;

        let written = if result.success {
            self.ledger
                .complete_with_memory(
                    &execution_id,
                    ExecutionStatus::Success,
                    result.data.as_ref(),
                    None,
                    Some(result.execution_time_ms),
                    result.memory.as_ref(),
                )
                .await
        } else {
            self.ledger
                .complete(
                    &execution_id,
                    ExecutionStatus::Error,
                    None,
                    result.error.as_deref(),
                    Some(result.execution_time_ms),
                )
                .await
        };
        if let Err(e) = written {
            self.abandon_execution(&execution_id, &e).await;
            return Err(e);
        }

        if let Err(e) = self
            .ledger
            .append_logs(&agent.id, &execution_id, &result.logs)
            .await
        {
            warn!("Could not store logs of execution {}: {}", execution_id, e);
        }
        drop(claim);

        if result.success {
            info!(
                "Execution {} of agent [{}] succeeded in {}ms",
                execution_id, agent.id, result.execution_time_ms
            );
            return Ok(CompletedExecution {
                execution_id,
                data: result.data.unwrap_or(Value::Null),
                execution_time_ms: result.execution_time_ms,
                resource_usage: result.resource_usage,
            });
        }

        let message = result.error.unwrap_or_else(|| "unknown failure".to_string());
        warn!(
            "Execution {} of agent [{}] failed: {}",
            execution_id, agent.id, message
        );
        Err(match result.failure {
            Some(FailureKind::Timeout) => AgentError::Timeout(self.runner.limits().timeout),
            Some(FailureKind::Cancelled) => AgentError::Cancelled("agent stopped".to_string()),
            _ => AgentError::Execution(message),
        })
    }

    /// Best-effort close of an attempt whose outcome could not be written, so its
    /// row does not stay `running` after the claim is released.
    async fn abandon_execution(&self, execution_id: &str, cause: &AgentError) {
        let message = format!("could not record outcome: {}", cause);
        if let Err(e) = self
            .ledger
            .complete(execution_id, ExecutionStatus::Error, None, Some(&message), None)
            .await
        {
            warn!("Execution {} left running: {}", execution_id, e);
        }
    }

    // ─── Queries ───

    pub async fn get_agent(&self, agent_id: &str) -> AgentResult<AgentRecord> {
        self.require_agent(agent_id).await
    }

    pub async fn list_agents(&self, owner_id: &str) -> AgentResult<Vec<AgentRecord>> {
        self.store.list_agents(owner_id).await
    }

    fn bounded(&self, limit: Option<usize>) -> usize {
        limit
            .unwrap_or(self.settings.default_list_limit)
            .clamp(1, self.settings.max_list_limit)
    }

    /// Most recent first, bounded by the configured maximum.
    pub async fn list_executions(
        &self,
        agent_id: &str,
        limit: Option<usize>,
    ) -> AgentResult<Vec<ExecutionRecord>> {
        self.ledger.list(agent_id, self.bounded(limit)).await
    }

    pub async fn list_logs(&self, agent_id: &str, limit: Option<usize>) -> AgentResult<Vec<AgentLogRecord>> {
        self.ledger.list_logs(agent_id, self.bounded(limit)).await
    }

    pub async fn get_memory(&self, agent_id: &str) -> AgentResult<Value> {
        self.memory.get(agent_id).await
    }

    /// Replace the memory blob outside of an execution. `Busy` while one is in flight.
    pub async fn set_memory(&self, agent_id: &str, blob: &Value) -> AgentResult<()> {
        let _claim = self.claim(agent_id, None)?;
        self.require_agent(agent_id).await?;
        self.memory.set(agent_id, blob).await
    }

    pub fn is_running(&self, agent_id: &str) -> bool {
        self.registry().running.contains_key(agent_id)
    }

    async fn resume_schedules(&self) -> AgentResult<usize> {
        let mut candidates = self
            .store
            .list_agents_with_status(DeploymentStatus::Deployed)
            .await?;
        candidates.extend(
            self.store
                .list_agents_with_status(DeploymentStatus::Stopped)
                .await?
                .into_iter()
                .filter(|a| a.status_message.as_deref() == Some(SHUTDOWN_MESSAGE)),
        );

        let mut resumed = 0;
        for agent in candidates {
            match self.deploy_agent(&agent.id).await {
                Ok(_) => resumed += 1,
                Err(e) => warn!("Could not resume agent [{}]: {}", agent.id, e),
            }
        }
        Ok(resumed)
    }
}

#[async_trait]
impl ScheduledRunner for AgentManager {
    async fn run_scheduled(&self, agent_id: &str, timer: &CancellationToken) -> AgentResult<()> {
        let claim = match self.claim(agent_id, Some(timer)) {
            Ok(claim) => claim,
            // The timer was cleared between the tick and the claim.
            Err(AgentError::Cancelled(_)) | Err(AgentError::InvalidState { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        let agent = self.require_agent(agent_id).await?;
        self.run_claimed(agent, TriggerType::Scheduled, Value::Object(Default::default()), claim)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl LifecycleComponent for AgentManager {
    async fn on_init(&self) -> Result<()> {
        self.vault.initialize().await?;
        self.ledger.recover_interrupted().await?;
        Ok(())
    }

    async fn on_start(&self) -> Result<()> {
        if self.settings.resume_on_start {
            let resumed = self.resume_schedules().await?;
            info!("Resumed {} agent(s) from a previous run", resumed);
        }
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        self.shutdown().await;
        Ok(())
    }
}
