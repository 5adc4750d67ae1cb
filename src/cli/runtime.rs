use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::agent::{AgentManager, LocalEventSource, ManagerSettings};
use crate::core::config::Settings;
use crate::core::sandbox::{SandboxLimits, SandboxRunner};
use crate::core::store::Store;
use crate::core::vault::CredentialVault;
use crate::logging;
use crate::platform::{NativePlatform, Platform};

/// Everything a command needs, wired from the data directory's settings.
pub struct Runtime {
    pub data_dir: PathBuf,
    pub settings: Settings,
    pub manager: Arc<AgentManager>,
}

impl Runtime {
    /// Load settings, install logging and open the agent database.
    ///
    /// One-shot commands keep log lines out of stdout so their output stays readable.
    pub async fn open(quiet: bool) -> Result<Self> {
        let data_dir = NativePlatform::data_dir();
        Self::open_at(&data_dir, quiet).await
    }

    pub async fn open_at(data_dir: &Path, quiet: bool) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("could not create data directory {:?}", data_dir))?;
        NativePlatform::restrict_dir_permissions(data_dir);

        let settings = Settings::load(data_dir).await?;
        logging::init(&settings.logging.level, data_dir, quiet);

        let store = Store::open(settings.database_path(data_dir)).await?;
        let vault = CredentialVault::new(store.get_db(), settings.security.encryption_key.as_deref())?;
        let runner = SandboxRunner::new(
            SandboxLimits::from_config(&settings.sandbox),
            settings.services.clone(),
        )?;
        let manager = AgentManager::new(
            store,
            vault,
            runner,
            Arc::new(LocalEventSource::new()),
            ManagerSettings::from_settings(&settings),
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            settings,
            manager,
        })
    }
}
