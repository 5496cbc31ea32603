use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_BASE_DELAY_MS, DEFAULT_IMAP_PORT, DEFAULT_JITTER_FACTOR,
    DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES, DEFAULT_SMTP_PORT, DEFAULT_SYNC_INTERVAL_SECS,
    IMAP_TIMEOUT_SECS, INBOX, RETRY_STATE_MAX_AGE_SECS, WORKER_TICK_SECS,
};
use crate::helpdesk::types::DepartmentSpec;
use crate::mail::MailEndpoint;
use crate::retry::RetryConfig;
use crate::sync::{SyncSettings, WorkerSettings};

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "HELPDESK_SYNC_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database file (default: data dir / helpdesk.db)
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub imap: ImapSection,
    #[serde(default)]
    pub sync: SyncSection,
    /// Departments upserted into the database at startup
    #[serde(default)]
    pub departments: Vec<DepartmentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
    /// Retry state untouched for this long is purged
    #[serde(default = "default_cleanup_max_age_secs")]
    pub cleanup_max_age_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
            cleanup_max_age_secs: default_cleanup_max_age_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapSection {
    #[serde(default = "default_imap_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
}

impl Default for ImapSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_imap_timeout_secs(),
            mailbox: default_mailbox(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Create a customer when a requester matches none
    #[serde(default = "default_true")]
    pub create_customers: bool,
    /// Send an acknowledgement mail for new tickets
    #[serde(default = "default_true")]
    pub auto_reply: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            create_customers: true,
            auto_reply: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepartmentConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default)]
    pub sequence_prefix: Option<String>,
    /// Parent group shown before the department name
    #[serde(default)]
    pub group: Option<String>,
    pub imap: EndpointConfig,
    #[serde(default)]
    pub smtp: Option<EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub secure: Option<bool>,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Read the password from this environment variable instead
    #[serde(default)]
    pub password_env: Option<String>,
}

impl EndpointConfig {
    fn password(&self) -> String {
        if let Some(var) = &self.password_env {
            match std::env::var(var) {
                Ok(value) => return value,
                Err(_) => tracing::warn!("Password variable {} is not set for {}", var, self.host),
            }
        }
        self.password.clone().unwrap_or_default()
    }

    fn endpoint(&self, default_port: u16, default_secure: bool) -> MailEndpoint {
        MailEndpoint {
            host: self.host.trim().to_string(),
            port: self.port.unwrap_or(default_port),
            secure: self.secure.unwrap_or(default_secure),
            user: self.user.trim().to_string(),
            password: self.password(),
        }
    }
}

impl DepartmentConfig {
    pub fn to_spec(&self) -> DepartmentSpec {
        DepartmentSpec {
            name: self.name.trim().to_string(),
            active: self.active,
            sync_enabled: self.sync_enabled,
            sync_interval_secs: self.sync_interval_secs,
            imap: self.imap.endpoint(DEFAULT_IMAP_PORT, true),
            smtp: self
                .smtp
                .as_ref()
                .map(|smtp| smtp.endpoint(DEFAULT_SMTP_PORT, false))
                .unwrap_or_default(),
            sequence_prefix: self
                .sequence_prefix
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_uppercase),
            group_name: self.group.clone(),
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_jitter_factor() -> f64 {
    DEFAULT_JITTER_FACTOR
}

fn default_cleanup_max_age_secs() -> u64 {
    RETRY_STATE_MAX_AGE_SECS
}

fn default_tick_secs() -> u64 {
    WORKER_TICK_SECS
}

fn default_imap_timeout_secs() -> u64 {
    IMAP_TIMEOUT_SECS
}

fn default_mailbox() -> String {
    INBOX.to_string()
}

fn default_sync_interval_secs() -> u64 {
    DEFAULT_SYNC_INTERVAL_SECS
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("helpdesk-sync");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV)
            && !path.trim().is_empty()
        {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("helpdesk-sync");
        Ok(dir)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("helpdesk.db")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [sync]\n\
                 auto_reply = true\n\n\
                 [[departments]]\n\
                 name = \"Support\"\n\
                 sequence_prefix = \"SUP\"\n\n\
                 [departments.imap]\n\
                 host = \"imap.example.com\"\n\
                 user = \"support@example.com\"\n\
                 password_env = \"SUPPORT_IMAP_PASSWORD\"\n\n\
                 [departments.smtp]\n\
                 host = \"smtp.example.com\"\n\
                 user = \"support@example.com\"\n\
                 password_env = \"SUPPORT_SMTP_PASSWORD\"",
                path.display()
            );
        }

        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_retries == 0 {
            anyhow::bail!("retry.max_retries must be at least 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            anyhow::bail!("retry.backoff_multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            anyhow::bail!("retry.jitter_factor must be between 0 and 1");
        }
        if self.worker.tick_secs == 0 {
            anyhow::bail!("worker.tick_secs must be at least 1");
        }

        let mut names = std::collections::HashSet::new();
        for dept in &self.departments {
            let name = dept.name.trim();
            if name.is_empty() {
                anyhow::bail!("Department names must not be empty");
            }
            if !names.insert(name.to_lowercase()) {
                anyhow::bail!("Duplicate department name: {}", name);
            }
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            jitter_factor: self.retry.jitter_factor,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            tick: Duration::from_secs(self.worker.tick_secs),
            retry_max_age: Duration::from_secs(self.retry.cleanup_max_age_secs),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            create_customers: self.sync.create_customers,
            auto_reply: self.sync.auto_reply,
            mailbox: self.imap.mailbox.clone(),
        }
    }

    pub fn imap_timeout(&self) -> Duration {
        Duration::from_secs(self.imap.timeout_secs)
    }

    pub fn department_specs(&self) -> Vec<DepartmentSpec> {
        self.departments.iter().map(DepartmentConfig::to_spec).collect()
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        fs::create_dir_all(Self::data_dir()?)?;
        if let Ok(path) = self.database_path()
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            database_path = "/var/lib/helpdesk/helpdesk.db"

            [retry]
            max_retries = 3
            base_delay_ms = 500

            [worker]
            tick_secs = 10

            [sync]
            auto_reply = false

            [[departments]]
            name = "Support"
            sequence_prefix = "sup"
            group = "IT"

            [departments.imap]
            host = "imap.example.com"
            user = "support@example.com"
            password = "secret"

            [departments.smtp]
            host = "smtp.example.com"
            user = "support@example.com"
            password = "secret"

            [[departments]]
            name = "Billing"
            sync_enabled = false
            sync_interval_secs = 600

            [departments.imap]
            host = "imap.billing.example.com"
            port = 143
            secure = false
            user = "billing@example.com"
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        let retry = config.retry_config();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.base_delay, Duration::from_millis(500));
        assert_eq!(retry.max_delay, Duration::from_millis(30_000));
        assert_eq!(config.worker_settings().tick, Duration::from_secs(10));
        assert!(!config.sync_settings().auto_reply);
        assert!(config.sync_settings().create_customers);
        assert_eq!(config.sync_settings().mailbox, "INBOX");
        assert_eq!(config.imap_timeout(), Duration::from_secs(30));

        let specs = config.department_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].sequence_prefix.as_deref(), Some("SUP"));
        assert_eq!(specs[0].group_name.as_deref(), Some("IT"));
        assert_eq!(specs[0].imap.port, 993);
        assert!(specs[0].imap.secure);
        assert_eq!(specs[0].smtp.port, 587);
        assert!(!specs[0].smtp.secure);
        assert!(specs[0].smtp.has_credentials());

        assert!(!specs[1].sync_enabled);
        assert_eq!(specs[1].sync_interval_secs, 600);
        assert_eq!(specs[1].imap.port, 143);
        assert!(!specs[1].imap.has_credentials());
        assert!(!specs[1].smtp.has_credentials());
    }

    #[test]
    fn test_defaults_and_validation() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.cleanup_max_age_secs, 3600);
        assert_eq!(config.worker.tick_secs, 30);
        assert!(config.departments.is_empty());

        let duplicate = r#"
            [[departments]]
            name = "Support"
            [departments.imap]
            host = "a"
            user = "a"

            [[departments]]
            name = "support"
            [departments.imap]
            host = "b"
            user = "b"
        "#;
        let config: Config = toml::from_str(duplicate).unwrap();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str("[retry]\njitter_factor = 2.0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = std::env::temp_dir().join(format!("helpdesk-sync-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        fs::write(&path, "[sync]\ncreate_customers = false\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(!config.sync.create_customers);

        fs::write(&path, "[sync\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        fs::remove_dir_all(&dir).ok();
    }
}
