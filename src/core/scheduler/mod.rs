use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::error::{AgentError, AgentResult};

/// Shortest period a timer may run at.
const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Receives timer ticks. Implemented by the agent manager.
#[async_trait]
pub trait ScheduledRunner: Send + Sync {
    /// Run one scheduled execution. `timer` is the token of the timer that fired;
    /// once it is cancelled the tick must not start a new execution.
    async fn run_scheduled(&self, agent_id: &str, timer: &CancellationToken) -> AgentResult<()>;
}

struct TimerHandle {
    cancel: CancellationToken,
    period: Duration,
    task: JoinHandle<()>,
}

/// One recurring timer per agent.
pub struct Scheduler {
    timers: Mutex<HashMap<String, TimerHandle>>,
}

/// Convert a (possibly fractional) minute interval into a timer period.
pub fn interval_period(minutes: f64) -> AgentResult<Duration> {
    if !minutes.is_finite() || minutes <= 0.0 {
        return Err(AgentError::Validation(format!(
            "interval_minutes must be a positive number, got {}",
            minutes
        )));
    }
    let period = Duration::try_from_secs_f64(minutes * 60.0).map_err(|_| {
        AgentError::Validation(format!("interval_minutes {} is out of range", minutes))
    })?;
    Ok(period.max(MIN_PERIOD))
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<String, TimerHandle>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register (or replace) the timer for `agent_id`. The first tick fires one
    /// full period after registration.
    pub fn start(
        &self,
        agent_id: &str,
        interval_minutes: f64,
        runner: Weak<dyn ScheduledRunner>,
    ) -> AgentResult<CancellationToken> {
        let period = interval_period(interval_minutes)?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(tick_loop(
            agent_id.to_string(),
            period,
            cancel.clone(),
            runner,
        ));

        let previous = self.timers().insert(
            agent_id.to_string(),
            TimerHandle {
                cancel: cancel.clone(),
                period,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
            info!("Replaced timer for agent [{}]", agent_id);
        }
        info!(
            "Scheduled agent [{}] every {:.1}s",
            agent_id,
            period.as_secs_f64()
        );
        Ok(cancel)
    }

    /// Clear the timer for `agent_id`. A tick already in progress finishes on
    /// its own; no further tick starts.
    pub fn stop(&self, agent_id: &str) -> bool {
        match self.timers().remove(agent_id) {
            Some(handle) => {
                handle.cancel.cancel();
                info!("Cleared timer for agent [{}]", agent_id);
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, agent_id: &str) -> bool {
        self.timers()
            .get(agent_id)
            .is_some_and(|h| !h.cancel.is_cancelled() && !h.task.is_finished())
    }

    pub fn period(&self, agent_id: &str) -> Option<Duration> {
        self.timers().get(agent_id).map(|h| h.period)
    }

    pub fn scheduled_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.timers().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn stop_all(&self) -> usize {
        let drained: Vec<(String, TimerHandle)> = self.timers().drain().collect();
        for (_, handle) in &drained {
            handle.cancel.cancel();
        }
        drained.len()
    }
}

async fn tick_loop(
    agent_id: String,
    period: Duration,
    cancel: CancellationToken,
    runner: Weak<dyn ScheduledRunner>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await; // Skip first immediate tick

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(runner) = runner.upgrade() else {
            break;
        };
        match runner.run_scheduled(&agent_id, &cancel).await {
            Ok(()) => {}
            Err(AgentError::Busy(_)) => {
                info!(
                    "Skipped tick for agent [{}]: previous execution still running",
                    agent_id
                );
            }
            Err(e) if e.is_execution_class() => {
                warn!("Scheduled execution of agent [{}] failed: {}", agent_id, e);
            }
            Err(e) => {
                error!("Scheduled tick for agent [{}] failed: {}", agent_id, e);
            }
        }
    }
    info!("Timer loop for agent [{}] exited", agent_id);
}
