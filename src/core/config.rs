use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

pub const CONFIG_FILE: &str = "flowforge.toml";

/// Process configuration, read from `flowforge.toml` in the data directory and
/// then overlaid with `FLOWFORGE_*` environment variables.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub services: ServiceEndpoints,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Relative paths are resolved against the data directory.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_minutes")]
    pub default_interval_minutes: f64,
    /// Re-register timers for agents still marked deployed when the process starts.
    #[serde(default)]
    pub resume_on_start: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_list_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

/// Base URLs and fixed parameters for the third-party APIs behind capabilities.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEndpoints {
    #[serde(default = "default_gmail_url")]
    pub gmail_url: String,
    #[serde(default = "default_slack_url")]
    pub slack_url: String,
    #[serde(default = "default_anthropic_url")]
    pub anthropic_url: String,
    #[serde(default = "default_anthropic_model")]
    pub anthropic_model: String,
    #[serde(default = "default_sheets_url")]
    pub sheets_url: String,
    #[serde(default = "default_github_url")]
    pub github_url: String,
    #[serde(default = "default_brevo_url")]
    pub brevo_url: String,
    #[serde(default = "default_brevo_sender")]
    pub brevo_sender: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("flowforge.db")
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_max_memory_mb() -> u64 {
    64
}
fn default_interval_minutes() -> f64 {
    60.0
}
fn default_list_limit() -> usize {
    50
}
fn default_max_limit() -> usize {
    100
}
fn default_gmail_url() -> String {
    "https://gmail.googleapis.com".to_string()
}
fn default_slack_url() -> String {
    "https://slack.com".to_string()
}
fn default_anthropic_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_anthropic_model() -> String {
    "claude-3-haiku-20240307".to_string()
}
fn default_sheets_url() -> String {
    "https://sheets.googleapis.com".to_string()
}
fn default_github_url() -> String {
    "https://api.github.com".to_string()
}
fn default_brevo_url() -> String {
    "https://api.brevo.com".to_string()
}
fn default_brevo_sender() -> String {
    "noreply@flowforge.dev".to_string()
}
fn default_request_timeout_secs() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_memory_mb: default_max_memory_mb(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_interval_minutes: default_interval_minutes(),
            resume_on_start: false,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            default_limit: default_list_limit(),
            max_limit: default_max_limit(),
        }
    }
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            gmail_url: default_gmail_url(),
            slack_url: default_slack_url(),
            anthropic_url: default_anthropic_url(),
            anthropic_model: default_anthropic_model(),
            sheets_url: default_sheets_url(),
            github_url: default_github_url(),
            brevo_url: default_brevo_url(),
            brevo_sender: default_brevo_sender(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Settings {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let config_path = data_dir.as_ref().join(CONFIG_FILE);
        let mut settings = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            let parsed: Settings = toml::from_str(&content)?;
            info!("Loaded settings from {:?}", config_path);
            parsed
        } else {
            info!("No {} found, using default settings.", CONFIG_FILE);
            Settings::default()
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("FLOWFORGE_ENCRYPTION_KEY").filter(|k| !k.is_empty()) {
            self.security.encryption_key = Some(key);
        }
        if let Some(level) = lookup("FLOWFORGE_LOG_LEVEL").filter(|l| !l.is_empty()) {
            self.logging.level = level;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.sandbox.timeout_secs == 0 {
            anyhow::bail!("sandbox.timeout_secs must be greater than zero");
        }
        if !(self.scheduler.default_interval_minutes > 0.0) {
            anyhow::bail!("scheduler.default_interval_minutes must be greater than zero");
        }
        if self.ledger.default_limit == 0 || self.ledger.max_limit < self.ledger.default_limit {
            anyhow::bail!("ledger limits must satisfy 0 < default_limit <= max_limit");
        }
        Ok(())
    }

    pub fn database_path(&self, data_dir: &Path) -> PathBuf {
        if self.database.path.is_absolute() {
            self.database.path.clone()
        } else {
            data_dir.join(&self.database.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.sandbox.timeout_secs, 300);
        assert_eq!(s.scheduler.default_interval_minutes, 60.0);
        assert!(!s.scheduler.resume_on_start);
        assert_eq!(s.ledger.default_limit, 50);
        assert_eq!(s.services.slack_url, "https://slack.com");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let raw = r#"
            [sandbox]
            timeout_secs = 30

            [services]
            slack_url = "http://127.0.0.1:9000"
        "#;
        let s: Settings = toml::from_str(raw).unwrap();
        assert_eq!(s.sandbox.timeout_secs, 30);
        assert_eq!(s.sandbox.max_memory_mb, 64);
        assert_eq!(s.services.slack_url, "http://127.0.0.1:9000");
        assert_eq!(s.services.github_url, "https://api.github.com");
    }

    #[test]
    fn env_overrides_file_values() {
        let mut s = Settings::default();
        s.apply_env(|key| match key {
            "FLOWFORGE_ENCRYPTION_KEY" => Some("from-env".to_string()),
            "FLOWFORGE_LOG_LEVEL" => Some("debug".to_string()),
            _ => None,
        });
        assert_eq!(s.security.encryption_key.as_deref(), Some("from-env"));
        assert_eq!(s.logging.level, "debug");
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let mut s = Settings::default();
        s.sandbox.timeout_secs = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.scheduler.default_interval_minutes = -1.0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn relative_database_path_resolves_under_data_dir() {
        let s = Settings::default();
        assert_eq!(
            s.database_path(Path::new("/srv/ff")),
            PathBuf::from("/srv/ff/flowforge.db")
        );
    }

    #[tokio::test]
    async fn load_reads_file_from_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join(CONFIG_FILE),
            "[ledger]\ndefault_limit = 10\nmax_limit = 20\n",
        )
        .await
        .unwrap();
        let s = Settings::load(dir.path()).await.unwrap();
        assert_eq!(s.ledger.default_limit, 10);
        assert_eq!(s.ledger.max_limit, 20);
    }
}
