use anyhow::{anyhow, Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::model::SortOrder;

/// Main configuration structure for starshelf
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// GitHub authentication and API settings
    #[serde(default)]
    pub github: GitHubConfig,

    /// Local entity store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Reconciliation and retry behavior
    #[serde(default)]
    pub sync: SyncConfig,

    /// Auto-tagging rules
    #[serde(default)]
    pub categorizer: CategorizerConfig,

    /// Folders created on first use
    #[serde(default)]
    pub folders: FoldersConfig,

    /// Presentation defaults
    #[serde(default)]
    pub behavior: BehaviorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// GitHub configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GitHubConfig {
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: String, // "auto", "gh_cli", "token"

    /// Personal access token (GITHUB_TOKEN takes precedence)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// REST API root
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Items per star-feed page
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

/// Entity store configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    /// SQLite database location
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Stop fetching when fewer calls than this remain
    #[serde(default = "default_rate_limit_buffer")]
    pub rate_limit_buffer: u32,

    /// Timeout for a single remote call in seconds
    #[serde(default = "default_timeout")]
    pub request_timeout: u64,

    /// Failed pushes before a queued star/unstar becomes a pending conflict
    #[serde(default = "default_max_push_attempts")]
    pub max_push_attempts: u32,

    /// Base delay between push retries
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: String, // "30s"

    /// Upper bound for the push retry delay
    #[serde(default = "default_retry_backoff_max")]
    pub retry_backoff_max: String, // "1h"
}

/// Categorizer configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CategorizerConfig {
    /// Pushes newer than this are tagged `active`, older ones `stale`
    #[serde(default = "default_freshness_window")]
    pub freshness_window: String, // "90d"
}

/// A tag-query folder to create when missing
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DefaultFolder {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FoldersConfig {
    #[serde(default = "default_folders")]
    pub default_folders: Vec<DefaultFolder>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BehaviorConfig {
    /// Listing order
    #[serde(default)]
    pub sort_order: SortOrder,

    /// Ask before unstarring from the CLI
    #[serde(default = "default_true")]
    pub confirm_unstar: bool,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "full"
}

// Default value functions
fn default_auth_method() -> String {
    "auto".to_string()
}
fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_per_page() -> u32 {
    100
}
fn default_true() -> bool {
    true
}
fn default_db_path() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/starshelf/shelf.db", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/starshelf/shelf.db", home)
    } else {
        "/tmp/starshelf/shelf.db".to_string()
    }
}
fn default_rate_limit_buffer() -> u32 {
    100
}
fn default_timeout() -> u64 {
    30
}
fn default_max_push_attempts() -> u32 {
    3
}
fn default_retry_backoff() -> String {
    "30s".to_string()
}
fn default_retry_backoff_max() -> String {
    "1h".to_string()
}
fn default_freshness_window() -> String {
    "90d".to_string()
}
fn default_folders() -> Vec<DefaultFolder> {
    vec![DefaultFolder {
        name: "Active".to_string(),
        tags: vec!["active".to_string()],
        description: "Pushed to within the freshness window".to_string(),
    }]
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            auth_method: default_auth_method(),
            token: None,
            api_url: default_api_url(),
            per_page: default_per_page(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rate_limit_buffer: default_rate_limit_buffer(),
            request_timeout: default_timeout(),
            max_push_attempts: default_max_push_attempts(),
            retry_backoff: default_retry_backoff(),
            retry_backoff_max: default_retry_backoff_max(),
        }
    }
}

impl Default for CategorizerConfig {
    fn default() -> Self {
        Self {
            freshness_window: default_freshness_window(),
        }
    }
}

impl Default for FoldersConfig {
    fn default() -> Self {
        Self {
            default_folders: default_folders(),
        }
    }
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            sort_order: SortOrder::default(),
            confirm_unstar: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Parse duration strings like "30s", "30m", "1h", "90d" (raw numbers are seconds)
pub fn parse_duration(duration_str: &str) -> Result<std::time::Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let seconds = if let Some(value) = duration_str.strip_suffix('s') {
        value.parse::<u64>().context("Invalid seconds value")?
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value
            .parse::<u64>()
            .map(|v| v * 60)
            .context("Invalid minutes value")?
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value
            .parse::<u64>()
            .map(|v| v * 3600)
            .context("Invalid hours value")?
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value
            .parse::<u64>()
            .map(|v| v * 86400)
            .context("Invalid days value")?
    } else {
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30m', '1h', '90d'")?
    };

    Ok(std::time::Duration::from_secs(seconds))
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            tracing::info!("Created default configuration at: {:?}", config_path);

            config.apply_env_overrides();
            config.expand_paths()?;
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.apply_env_overrides();
        config.expand_paths()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("starshelf").join("config.yml"))
    }

    /// Environment variables win over file values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STARSHELF_DB") {
            if !path.is_empty() {
                self.store.db_path = path;
            }
        }
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.store.db_path = shellexpand::full(&self.store.db_path)
            .context("Failed to expand db_path")?
            .into_owned();

        Ok(())
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.github.per_page == 0 || self.github.per_page > 100 {
            return Err(anyhow!(
                "github.per_page must be between 1 and 100, got {}",
                self.github.per_page
            ));
        }
        if self.sync.max_push_attempts == 0 {
            return Err(anyhow!("sync.max_push_attempts must be at least 1"));
        }
        self.freshness_window()?;
        self.retry_backoff()?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.store.db_path)
    }

    pub fn freshness_window(&self) -> Result<chrono::Duration> {
        let window = parse_duration(&self.categorizer.freshness_window)
            .context("Invalid categorizer.freshness_window")?;
        chrono::Duration::from_std(window).context("freshness_window out of range")
    }

    /// Base and maximum push retry delay
    pub fn retry_backoff(&self) -> Result<(std::time::Duration, std::time::Duration)> {
        let base =
            parse_duration(&self.sync.retry_backoff).context("Invalid sync.retry_backoff")?;
        let max = parse_duration(&self.sync.retry_backoff_max)
            .context("Invalid sync.retry_backoff_max")?;
        Ok((base, max.max(base)))
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync.request_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    // Helper function to create a temporary config directory
    fn setup_test_config_dir() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_dir = temp_dir.path().join("starshelf");
        std::fs::create_dir_all(&config_dir).expect("Failed to create config dir");
        (temp_dir, config_dir)
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.github.auth_method, "auto");
        assert_eq!(config.github.per_page, 100);
        assert_eq!(config.sync.rate_limit_buffer, 100);
        assert_eq!(config.sync.max_push_attempts, 3);
        assert_eq!(config.freshness_window().unwrap().num_days(), 90);
        assert_eq!(config.behavior.sort_order, SortOrder::Stars);
        assert_eq!(config.folders.default_folders.len(), 1);
        assert!(config.store.db_path.ends_with("starshelf/shelf.db"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("45s").unwrap().as_secs(), 45);
        assert_eq!(parse_duration("30m").unwrap().as_secs(), 1800);
        assert_eq!(parse_duration("1h").unwrap().as_secs(), 3600);
        assert_eq!(parse_duration("90d").unwrap().as_secs(), 90 * 86400);
        assert_eq!(parse_duration("120").unwrap().as_secs(), 120);
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_retry_backoff_max_never_below_base() {
        let mut config = Config::default();
        config.sync.retry_backoff = "10m".to_string();
        config.sync.retry_backoff_max = "1m".to_string();
        let (base, max) = config.retry_backoff().unwrap();
        assert_eq!(base.as_secs(), 600);
        assert_eq!(max.as_secs(), 600);
    }

    #[test]
    #[serial]
    fn test_expand_paths_and_env_override() {
        env::set_var("TEST_STARSHELF_HOME", "/test/home");

        let mut config = Config::default();
        config.store.db_path = "${TEST_STARSHELF_HOME}/shelf.db".to_string();
        config.expand_paths().expect("Failed to expand paths");
        assert_eq!(config.store.db_path, "/test/home/shelf.db");

        env::set_var("STARSHELF_DB", "/override/shelf.db");
        config.apply_env_overrides();
        assert_eq!(config.store.db_path, "/override/shelf.db");

        env::remove_var("STARSHELF_DB");
        env::remove_var("TEST_STARSHELF_HOME");
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.yml"));
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_config_save_and_load() {
        let (_temp_dir, config_dir) = setup_test_config_dir();
        let config_path = config_dir.join("config.yml");

        let mut config = Config::default();
        config.store.db_path = "/custom/shelf.db".to_string();
        config.sync.max_push_attempts = 5;
        config.categorizer.freshness_window = "30d".to_string();

        config.save(&config_path).expect("Failed to save config");
        let loaded = Config::load(&config_path).expect("Failed to load config");

        assert_eq!(loaded.store.db_path, "/custom/shelf.db");
        assert_eq!(loaded.sync.max_push_attempts, 5);
        assert_eq!(loaded.freshness_window().unwrap().num_days(), 30);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.github.per_page = 500;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.categorizer.freshness_window = "fortnight".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml_content = r#"
github:
  auth_method: "gh_cli"
  per_page: 50
sync:
  rate_limit_buffer: 20
  request_timeout: 10
  max_push_attempts: 2
categorizer:
  freshness_window: "180d"
folders:
  default_folders:
    - name: "Rust"
      tags: ["lang:rust"]
    - name: "Machine Learning"
      tags: ["topic:machine-learning", "topic:ml"]
behavior:
  sort_order: "name"
  confirm_unstar: false
logging:
  level: "debug"
  format: "pretty"
"#;

        let config: Config = serde_yaml::from_str(yaml_content).expect("Failed to parse YAML");

        assert_eq!(config.github.auth_method, "gh_cli");
        assert_eq!(config.github.per_page, 50);
        assert_eq!(config.github.api_url, "https://api.github.com");
        assert_eq!(config.sync.rate_limit_buffer, 20);
        assert_eq!(config.request_timeout().as_secs(), 10);
        assert_eq!(config.sync.max_push_attempts, 2);
        assert_eq!(config.freshness_window().unwrap().num_days(), 180);
        assert_eq!(config.folders.default_folders.len(), 2);
        assert_eq!(config.folders.default_folders[1].tags.len(), 2);
        assert_eq!(config.behavior.sort_order, SortOrder::Name);
        assert!(!config.behavior.confirm_unstar);
        assert_eq!(config.logging.format, "pretty");
    }
}
