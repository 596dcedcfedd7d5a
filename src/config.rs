//! Configuration System
//!
//! Loads a TOML file and applies `ERGBOOK_*` environment overrides on top.
//! Every section and field has a default, so an empty file is valid.

use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    error::{ErgbookError, Result},
    logbook::{self, LogbookSettings},
    sync::SyncSettings,
    types::{DeviceMatcher, WatchdogConfig, DEFAULT_OPERATOR_UUID},
};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Device selection
    #[serde(default)]
    pub device: DeviceConfig,

    /// Liveness deadlines
    #[serde(default)]
    pub watchdog: WatchdogSection,

    /// Database settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Logbook API and sync settings
    #[serde(default)]
    pub logbook: LogbookConfig,

    /// Operator attribution
    #[serde(default)]
    pub operator: OperatorConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which monitor to bind to
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Hardware address; when set, the name pattern is ignored
    pub address: Option<String>,

    /// Substrings the advertised name must all contain
    #[serde(default = "default_name_pattern")]
    pub name_pattern: Vec<String>,
}

fn default_name_pattern() -> Vec<String> {
    vec!["PM5".to_string(), "Row".to_string()]
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: None,
            name_pattern: default_name_pattern(),
        }
    }
}

impl DeviceConfig {
    /// Matcher for scan results
    #[must_use]
    pub fn matcher(&self) -> DeviceMatcher {
        match &self.address {
            Some(address) if !address.is_empty() => DeviceMatcher::Address(address.clone()),
            _ => DeviceMatcher::NamePattern(self.name_pattern.clone()),
        }
    }
}

/// Liveness deadlines, in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogSection {
    /// Max time between scan results while scanning
    #[serde(default = "default_scan_deadline")]
    pub scan_deadline_secs: u64,

    /// Max time from connecting to the first summary
    #[serde(default = "default_workout_deadline")]
    pub workout_deadline_secs: u64,

    /// Max time from the last summary to the disconnect
    #[serde(default = "default_disconnect_deadline")]
    pub disconnect_deadline_secs: u64,
}

fn default_scan_deadline() -> u64 {
    60
}

fn default_workout_deadline() -> u64 {
    35 * 60
}

fn default_disconnect_deadline() -> u64 {
    7 * 60
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            scan_deadline_secs: default_scan_deadline(),
            workout_deadline_secs: default_workout_deadline(),
            disconnect_deadline_secs: default_disconnect_deadline(),
        }
    }
}

impl WatchdogSection {
    /// Deadlines as durations
    #[must_use]
    pub const fn to_watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            scan_deadline: Duration::from_secs(self.scan_deadline_secs),
            workout_deadline: Duration::from_secs(self.workout_deadline_secs),
            disconnect_deadline: Duration::from_secs(self.disconnect_deadline_secs),
        }
    }
}

/// Database location
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Database file, created on first open
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/ergbook/ergbook.redb")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Logbook API and sync settings
#[derive(Debug, Clone, Deserialize)]
pub struct LogbookConfig {
    /// Logbook host
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// OAuth client id
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// OAuth client secret
    #[serde(default)]
    pub client_secret: String,

    /// OAuth scope
    #[serde(default = "default_scope")]
    pub scope: String,

    /// OAuth redirect URI
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// Pause between sync passes
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,

    /// Per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Chat webhook for delivery failure alerts
    pub alert_webhook_url: Option<String>,

    /// Minimum time between failure alerts
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown_secs: u64,

    /// Minimum time between pending-count log lines
    #[serde(default = "default_log_interval")]
    pub log_interval_secs: u64,
}

fn default_base_url() -> String {
    logbook::DEFAULT_BASE_URL.to_string()
}

fn default_client_id() -> String {
    logbook::DEFAULT_CLIENT_ID.to_string()
}

fn default_scope() -> String {
    logbook::DEFAULT_SCOPE.to_string()
}

fn default_redirect_uri() -> String {
    logbook::DEFAULT_REDIRECT_URI.to_string()
}

fn default_sync_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    30
}

fn default_alert_cooldown() -> u64 {
    3600
}

fn default_log_interval() -> u64 {
    300
}

impl Default for LogbookConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            client_id: default_client_id(),
            client_secret: String::new(),
            scope: default_scope(),
            redirect_uri: default_redirect_uri(),
            sync_interval_secs: default_sync_interval(),
            request_timeout_secs: default_request_timeout(),
            alert_webhook_url: None,
            alert_cooldown_secs: default_alert_cooldown(),
            log_interval_secs: default_log_interval(),
        }
    }
}

impl LogbookConfig {
    /// Client connection settings
    #[must_use]
    pub fn settings(&self) -> LogbookSettings {
        LogbookSettings {
            base_url: self.base_url.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            scope: self.scope.clone(),
            redirect_uri: self.redirect_uri.clone(),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    /// Sync loop timing
    #[must_use]
    pub const fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            interval: Duration::from_secs(self.sync_interval_secs),
            log_interval: Duration::from_secs(self.log_interval_secs),
            alert_cooldown: Duration::from_secs(self.alert_cooldown_secs),
        }
    }
}

/// Operator attribution
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    /// Attributed when nobody is selected
    #[serde(default = "default_operator_uuid")]
    pub default_uuid: String,

    /// Selected at startup if registered
    pub current_uuid: Option<String>,
}

fn default_operator_uuid() -> String {
    DEFAULT_OPERATOR_UUID.to_string()
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            default_uuid: default_operator_uuid(),
            current_uuid: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Config`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ErgbookError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| ErgbookError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Parse configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Config`] if the text is not valid configuration.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ErgbookError::Config(e.to_string()))
    }

    /// Load configuration with environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns [`ErgbookError::Config`] if the file cannot be read or parsed.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from environment variables only
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Load from default locations or environment
    #[must_use]
    pub fn load_default() -> Self {
        let config_paths = [
            PathBuf::from("/etc/ergbook/config.toml"),
            PathBuf::from("./ergbook.toml"),
        ];

        for path in &config_paths {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Device overrides
        if let Some(address) = lookup("ERGBOOK_DEVICE_ADDRESS") {
            self.device.address = Some(address);
        }

        // Store overrides
        if let Some(path) = lookup("ERGBOOK_DB_PATH") {
            self.store.path = PathBuf::from(path);
        }

        // Logbook overrides
        if let Some(url) = lookup("ERGBOOK_LOGBOOK_URL") {
            self.logbook.base_url = url;
        }
        if let Some(secret) = lookup("ERGBOOK_CLIENT_SECRET") {
            self.logbook.client_secret = secret;
        }
        if let Some(url) = lookup("ERGBOOK_ALERT_WEBHOOK") {
            self.logbook.alert_webhook_url = Some(url);
        }
        if let Some(interval) = lookup("ERGBOOK_SYNC_INTERVAL_SECS") {
            if let Ok(secs) = interval.parse() {
                self.logbook.sync_interval_secs = secs;
            }
        }

        // Operator overrides
        if let Some(uuid) = lookup("ERGBOOK_OPERATOR") {
            self.operator.current_uuid = Some(uuid);
        }

        // Logging overrides
        if let Some(level) = lookup("ERGBOOK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("ERGBOOK_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Generate a default config file content
#[must_use]
pub fn generate_default_config() -> String {
    format!(
        r#"# ergbook configuration
#
# Environment variables override these settings:
# - ERGBOOK_DEVICE_ADDRESS
# - ERGBOOK_DB_PATH
# - ERGBOOK_LOGBOOK_URL
# - ERGBOOK_CLIENT_SECRET
# - ERGBOOK_ALERT_WEBHOOK
# - ERGBOOK_SYNC_INTERVAL_SECS
# - ERGBOOK_OPERATOR
# - ERGBOOK_LOG_LEVEL
# - ERGBOOK_LOG_FORMAT

[device]
# Bind to a specific monitor; otherwise the first advertisement whose
# name contains every pattern entry is used
# address = "AA:BB:CC:DD:EE:FF"
name_pattern = ["PM5", "Row"]

[watchdog]
# Max time between scan results while scanning
scan_deadline_secs = 60

# Max time from connecting to the first workout summary
workout_deadline_secs = 2100

# Max time from the last workout summary to the disconnect
disconnect_deadline_secs = 420

[store]
path = "/var/lib/ergbook/ergbook.redb"

[logbook]
base_url = "{base_url}"
client_id = "{client_id}"
client_secret = ""
scope = "{scope}"
redirect_uri = "{redirect_uri}"
sync_interval_secs = 30
request_timeout_secs = 30
# alert_webhook_url = "https://hooks.slack.com/services/..."
alert_cooldown_secs = 3600
log_interval_secs = 300

[operator]
default_uuid = "{operator}"
# current_uuid = "..."

[logging]
level = "info"
format = "pretty"
"#,
        base_url = logbook::DEFAULT_BASE_URL,
        client_id = logbook::DEFAULT_CLIENT_ID,
        scope = logbook::DEFAULT_SCOPE,
        redirect_uri = logbook::DEFAULT_REDIRECT_URI,
        operator = DEFAULT_OPERATOR_UUID,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = assert_ok!(Config::from_toml(""));
        assert_eq!(config.watchdog.scan_deadline_secs, 60);
        assert_eq!(config.logbook.sync_interval_secs, 30);
        assert_eq!(config.logbook.base_url, "https://log.concept2.com");
        assert_eq!(config.device.matcher(), DeviceMatcher::default());
        assert_eq!(
            config.watchdog.to_watchdog_config(),
            WatchdogConfig::default()
        );
    }

    #[test]
    fn test_generated_config_round_trips() {
        let config = Config::from_toml(&generate_default_config()).unwrap();
        assert_eq!(config.watchdog.workout_deadline_secs, 2100);
        assert_eq!(config.watchdog.disconnect_deadline_secs, 420);
        assert_eq!(config.logbook.client_id, logbook::DEFAULT_CLIENT_ID);
        assert_eq!(config.operator.default_uuid, DEFAULT_OPERATOR_UUID);
        assert!(config.logbook.alert_webhook_url.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml(
            r#"
            [device]
            address = "AA:BB:CC:DD:EE:FF"

            [logbook]
            sync_interval_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(
            config.device.matcher(),
            DeviceMatcher::Address("AA:BB:CC:DD:EE:FF".to_string())
        );
        assert_eq!(
            config.logbook.sync_settings().interval,
            Duration::from_secs(5)
        );
        assert_eq!(config.logbook.scope, "results:write");
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ERGBOOK_DB_PATH", "/tmp/test.redb"),
            ("ERGBOOK_SYNC_INTERVAL_SECS", "not-a-number"),
            ("ERGBOOK_OPERATOR", "alice"),
            ("ERGBOOK_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.store.path, PathBuf::from("/tmp/test.redb"));
        assert_eq!(config.logbook.sync_interval_secs, 30);
        assert_eq!(config.operator.current_uuid.as_deref(), Some("alice"));
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_invalid_toml() {
        let err = assert_err!(Config::from_toml(
            "[watchdog]\nscan_deadline_secs = \"soon\""
        ));
        assert!(matches!(err, ErgbookError::Config(_)));
    }
}
