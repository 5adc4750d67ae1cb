use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Init,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent: Send + Sync {
    async fn on_init(&self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Drives registered components through init, start and shutdown, in
/// registration order.
pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<dyn LifecycleComponent>>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Created,
            components: Vec::new(),
        }
    }

    pub fn attach(&mut self, component: Arc<dyn LifecycleComponent>) {
        self.components.push(component);
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.on_init().await?;
        }

        for comp in &self.components {
            comp.on_start().await?;
        }

        info!("Lifecycle Phase: Ready");
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Shut every component down; one failing component does not stop the others.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in &self.components {
            if let Err(e) = comp.on_shutdown().await {
                warn!("Component shutdown error: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
        fail_shutdown: bool,
    }

    impl Recorder {
        fn new(name: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                journal: journal.clone(),
                fail_start: false,
                fail_shutdown: false,
            }
        }

        fn note(&self, phase: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, phase));
        }
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        async fn on_init(&self) -> Result<()> {
            self.note("init");
            Ok(())
        }
        async fn on_start(&self) -> Result<()> {
            self.note("start");
            if self.fail_start {
                anyhow::bail!("refusing to start");
            }
            Ok(())
        }
        async fn on_shutdown(&self) -> Result<()> {
            self.note("shutdown");
            if self.fail_shutdown {
                anyhow::bail!("stuck");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn phases_run_in_order() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = LifecycleManager::new();
        lifecycle.attach(Arc::new(Recorder::new("a", &journal)));
        lifecycle.attach(Arc::new(Recorder::new("b", &journal)));
        assert_eq!(lifecycle.state(), LifecycleState::Created);

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Ready);
        lifecycle.shutdown().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Shutdown);

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "a:init", "b:init", "a:start", "b:start", "a:shutdown", "b:shutdown"
            ]
        );
    }

    #[tokio::test]
    async fn start_failure_is_reported() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = LifecycleManager::new();
        let mut failing = Recorder::new("a", &journal);
        failing.fail_start = true;
        lifecycle.attach(Arc::new(failing));
        assert!(lifecycle.start().await.is_err());
        assert_ne!(lifecycle.state(), LifecycleState::Ready);
    }

    #[tokio::test]
    async fn shutdown_continues_past_errors() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut lifecycle = LifecycleManager::new();
        let mut stuck = Recorder::new("a", &journal);
        stuck.fail_shutdown = true;
        lifecycle.attach(Arc::new(stuck));
        lifecycle.attach(Arc::new(Recorder::new("b", &journal)));
        lifecycle.shutdown().await.unwrap();
        assert!(journal.lock().unwrap().contains(&"b:shutdown".to_string()));
    }
}
