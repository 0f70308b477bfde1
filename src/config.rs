use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;
use tracing::debug;

use crate::error::RosterError;
use crate::membership::SiteAddr;
use crate::replication::AckPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterConfig {
    #[serde(default = "default_local_site")]
    pub local_site: SiteAddr,

    /// Sites to learn about at startup; they are not members until they join
    #[serde(default)]
    pub bootstrap_sites: Vec<SiteAddr>,

    #[serde(default = "default_true")]
    pub electable: bool,

    #[serde(default)]
    pub ack_policy: AckPolicy,

    #[serde(default = "default_retry_wait_ms")]
    pub retry_wait_ms: u64,

    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,

    #[serde(default = "default_master_lock_timeout_ms")]
    pub master_lock_timeout_ms: u64,

    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,

    #[serde(default = "default_deadlock_retries")]
    pub deadlock_retries: u32,

    #[serde(default = "default_max_non_replication_threads")]
    pub max_non_replication_threads: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_table_name")]
    pub table_name: String,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for rotated JSON log files; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub console: bool,
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            local_site: default_local_site(),
            bootstrap_sites: Vec::new(),
            electable: default_true(),
            ack_policy: AckPolicy::default(),
            retry_wait_ms: default_retry_wait_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
            master_lock_timeout_ms: default_master_lock_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            deadlock_retries: default_deadlock_retries(),
            max_non_replication_threads: default_max_non_replication_threads(),
            queue_capacity: default_queue_capacity(),
            table_name: default_table_name(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            console: default_true(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_local_site() -> SiteAddr {
    SiteAddr::new("127.0.0.1", 6000)
}

fn default_true() -> bool {
    true
}

fn default_retry_wait_ms() -> u64 {
    30_000
}

fn default_retry_jitter_ms() -> u64 {
    500
}

fn default_master_lock_timeout_ms() -> u64 {
    5_000
}

fn default_ack_timeout_ms() -> u64 {
    1_000
}

fn default_deadlock_retries() -> u32 {
    5
}

fn default_max_non_replication_threads() -> usize {
    num_cpus::get().max(1)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_table_name() -> String {
    "__db.membership".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    7
}

impl RosterConfig {
    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    pub fn retry_jitter(&self) -> Duration {
        Duration::from_millis(self.retry_jitter_ms)
    }

    pub fn master_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.master_lock_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), RosterError> {
        if self.local_site.host.is_empty() {
            return Err(RosterError::config("local_site.host must not be empty"));
        }
        if self.local_site.port == 0 {
            return Err(RosterError::config("local_site.port must not be 0"));
        }
        if let Some(site) = self.bootstrap_sites.iter().find(|s| s.host.is_empty() || s.port == 0) {
            return Err(RosterError::config(format!("invalid bootstrap site '{}'", site)));
        }
        if self.master_lock_timeout_ms == 0 || self.ack_timeout_ms == 0 {
            return Err(RosterError::config("timeouts must be greater than zero"));
        }
        if self.max_non_replication_threads == 0 {
            return Err(RosterError::config("max_non_replication_threads must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(RosterError::config("queue_capacity must be at least 1"));
        }
        if self.table_name.is_empty() {
            return Err(RosterError::config("table_name must not be empty"));
        }
        Ok(())
    }

    /// Load from the first config file found, or fall back to defaults
    pub fn load() -> Result<Self, RosterError> {
        let config_paths = [
            PathBuf::from("roster.yml"),
            dirs::config_dir()
                .map(|p| p.join("roster/roster.yml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/roster/roster.yml"),
        ];

        for path in &config_paths {
            if path.is_file() {
                return Self::load_from_file(path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, RosterError> {
        let content = fs::read_to_string(path)
            .map_err(|e| RosterError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| RosterError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), RosterError> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| RosterError::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| RosterError::Config(format!("Failed to create config directory: {}", e)))?;
        }

        // Write atomically using a temporary file
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, yaml)
            .map_err(|e| RosterError::Config(format!("Failed to write config: {}", e)))?;

        fs::rename(&temp_path, path)
            .map_err(|e| RosterError::Config(format!("Failed to save config: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RosterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.table_name, "__db.membership");
        assert_eq!(config.ack_policy, AckPolicy::Quorum);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "local_site:\n  host: db-1\n  port: 7000\nack_policy: all\n";
        let config: RosterConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.local_site, SiteAddr::new("db-1", 7000));
        assert_eq!(config.ack_policy, AckPolicy::All);
        assert_eq!(config.retry_wait_ms, 30_000);
        assert!(config.logging.console);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/roster.yml");
        let mut config = RosterConfig::default();
        config.bootstrap_sites.push(SiteAddr::new("db-2", 7001));
        config.ack_timeout_ms = 250;
        config.save(&path).unwrap();

        let loaded = RosterConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.bootstrap_sites, config.bootstrap_sites);
        assert_eq!(loaded.ack_timeout(), Duration::from_millis(250));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = RosterConfig::default();
        config.local_site.port = 0;
        assert!(config.validate().is_err());

        let mut config = RosterConfig::default();
        config.max_non_replication_threads = 0;
        assert!(config.validate().is_err());

        let mut config = RosterConfig::default();
        config.bootstrap_sites.push(SiteAddr::new("", 1));
        assert!(matches!(config.validate(), Err(RosterError::Config(_))));
    }
}
