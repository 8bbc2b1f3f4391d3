//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/hangout/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/hangout/` (~/.config/hangout/)
//! - State/Logs: `$XDG_STATE_HOME/hangout/` (~/.local/state/hangout/)

use crate::error::{Error, Result};
use crate::types::Domain;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Backend REST API configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// Realtime subscription and refresh tuning
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend (REST data store) configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Project URL (e.g., `https://project.supabase.co`)
    pub url: Option<String>,

    /// Public anon key sent as the `apikey` header
    pub anon_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,

    /// Max retry attempts for transient failures
    #[serde(default = "default_backend_max_retries")]
    pub max_retries: usize,

    /// Per-domain table name overrides
    #[serde(default)]
    pub tables: BTreeMap<Domain, String>,

    /// Per-domain PostgREST filter (e.g., `status=neq.archived`)
    #[serde(default)]
    pub filters: BTreeMap<Domain, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            timeout_secs: default_backend_timeout(),
            max_retries: default_backend_max_retries(),
            tables: BTreeMap::new(),
            filters: BTreeMap::new(),
        }
    }
}

impl BackendConfig {
    /// Check if the backend is configured well enough to issue requests
    pub fn is_ready(&self) -> bool {
        self.url.is_some() && self.anon_key.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.url.is_none() {
            return Err(Error::Config("backend.url is required".to_string()));
        }
        if self.anon_key.is_none() {
            return Err(Error::Config("backend.anon_key is required".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "backend.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Table backing a domain
    pub fn table_for(&self, domain: Domain) -> &str {
        self.tables
            .get(&domain)
            .map(String::as_str)
            .unwrap_or_else(|| domain.default_table())
    }

    /// Configured filter for a domain, if any
    pub fn filter_for(&self, domain: Domain) -> Option<&str> {
        self.filters.get(&domain).map(String::as_str)
    }
}

fn default_backend_timeout() -> u64 {
    30
}

fn default_backend_max_retries() -> usize {
    3
}

/// Realtime subscription, debounce and backoff settings
///
/// All values are tunable defaults; only the 600ms debounce window has
/// been observed in production.
#[derive(Debug, Deserialize, Clone)]
pub struct RealtimeConfig {
    /// Quiet window before a burst of refresh requests fires
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// First reconnect delay after a transport error
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Reconnect delay ceiling
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Interval of the periodic authoritative reload (0 disables)
    #[serde(default = "default_backstop_secs")]
    pub backstop_secs: u64,

    /// Domains to subscribe to when a session starts
    #[serde(default = "default_domains")]
    pub domains: Vec<Domain>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            backstop_secs: default_backstop_secs(),
            domains: default_domains(),
        }
    }
}

impl RealtimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.debounce_ms == 0 {
            return Err(Error::Config(
                "realtime.debounce_ms must be greater than 0".to_string(),
            ));
        }
        if self.backoff_initial_ms == 0 {
            return Err(Error::Config(
                "realtime.backoff_initial_ms must be greater than 0".to_string(),
            ));
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(Error::Config(
                "realtime.backoff_max_ms must be >= backoff_initial_ms".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Backstop reload interval, `None` when disabled
    pub fn backstop_interval(&self) -> Option<Duration> {
        (self.backstop_secs > 0).then(|| Duration::from_secs(self.backstop_secs))
    }
}

fn default_debounce_ms() -> u64 {
    600
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backstop_secs() -> u64 {
    300
}

fn default_domains() -> Vec<Domain> {
    Domain::ALL.to_vec()
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.realtime.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/hangout/config.toml` (~/.config/hangout/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("hangout").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/hangout/` (~/.local/state/hangout/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("hangout")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("hangout.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(!config.backend.is_ready());
        assert_eq!(config.realtime.debounce_ms, 600);
        assert_eq!(config.realtime.backoff_initial_ms, 1000);
        assert_eq!(config.realtime.domains.len(), 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[backend]
url = "https://demo.supabase.co"
anon_key = "anon"
max_retries = 5

[backend.tables]
invitations = "plan_invitations"

[backend.filters]
plans = "status=neq.archived"

[realtime]
debounce_ms = 250
domains = ["plans", "invitations"]

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert!(config.backend.is_ready());
        assert_eq!(config.backend.max_retries, 5);
        assert_eq!(config.backend.timeout_secs, 30);
        assert_eq!(
            config.backend.table_for(Domain::Invitations),
            "plan_invitations"
        );
        assert_eq!(config.backend.table_for(Domain::Plans), "plans");
        assert_eq!(
            config.backend.filter_for(Domain::Plans),
            Some("status=neq.archived")
        );
        assert_eq!(config.realtime.debounce_window(), Duration::from_millis(250));
        assert_eq!(
            config.realtime.domains,
            vec![Domain::Plans, Domain::Invitations]
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_backend_validation() {
        let config = BackendConfig::default();
        assert!(config.validate().is_err());

        let config = BackendConfig {
            url: Some("https://demo.supabase.co".to_string()),
            anon_key: Some("anon".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_realtime_validation() {
        assert!(RealtimeConfig::default().validate().is_ok());

        let config = RealtimeConfig {
            backoff_max_ms: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(RealtimeConfig {
            backstop_secs: 0,
            ..Default::default()
        }
        .backstop_interval()
        .is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[realtime]\ndebounce_ms = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());

        std::fs::write(&path, "[realtime]\ndebounce_ms = 100\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.realtime.debounce_ms, 100);
    }
}
