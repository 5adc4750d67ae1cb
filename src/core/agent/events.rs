use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::info;

use crate::core::store::types::AgentRecord;

/// Registration point for monitoring and reactive agents.
///
/// The source calls back into the manager's `dispatch_event` when something the
/// agent subscribed to happens.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, agent: &AgentRecord) -> Result<()>;
    async fn unsubscribe(&self, agent_id: &str) -> Result<()>;
}

/// In-process source that only keeps track of subscriptions.
#[derive(Default)]
pub struct LocalEventSource {
    subscriptions: Mutex<HashMap<String, Vec<String>>>,
}

impl LocalEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub fn is_subscribed(&self, agent_id: &str) -> bool {
        self.subscriptions().contains_key(agent_id)
    }

    /// Triggers an agent registered for.
    #[cfg(test)]
    pub fn triggers(&self, agent_id: &str) -> Option<Vec<String>> {
        self.subscriptions().get(agent_id).cloned()
    }
}

#[async_trait]
impl EventSource for LocalEventSource {
    async fn subscribe(&self, agent: &AgentRecord) -> Result<()> {
        let triggers = agent.configuration.triggers.clone();
        info!(
            "Agent [{}] subscribed to {} trigger(s)",
            agent.id,
            triggers.len()
        );
        self.subscriptions().insert(agent.id.clone(), triggers);
        Ok(())
    }

    async fn unsubscribe(&self, agent_id: &str) -> Result<()> {
        if self.subscriptions().remove(agent_id).is_some() {
            info!("Agent [{}] unsubscribed", agent_id);
        }
        Ok(())
    }
}
