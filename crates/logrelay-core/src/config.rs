use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{LogRelayError, Result};
use crate::log_entry::Severity;

/// Main configuration for logrelay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of the application doing the logging
    pub app: AppConfig,

    /// General settings
    pub general: GeneralConfig,

    /// Sink configuration
    pub logger: LoggerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| LogRelayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| LogRelayError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides using `lookup` to resolve variable names
    ///
    /// Recognised variables: `TELEGRAM_ENABLED`, `TELEGRAM_LEVEL`,
    /// `TELEGRAM_CHAT_ID`, `BOT_API_TOKEN`, `STD_ENABLED`, `STD_LEVEL`,
    /// `SLOG_ENABLED`, `SLOG_LEVEL`, `SLOG_JSON`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let alert = &mut self.logger.alert;
        if let Some(v) = lookup("TELEGRAM_ENABLED") {
            alert.enabled = parse_bool("TELEGRAM_ENABLED", &v)?;
        }
        if let Some(v) = lookup("TELEGRAM_LEVEL") {
            alert.level = parse_level("TELEGRAM_LEVEL", &v)?;
        }
        if let Some(v) = lookup("TELEGRAM_CHAT_ID") {
            alert.chat_id = v;
        }
        if let Some(v) = lookup("BOT_API_TOKEN") {
            alert.bot_token = v;
        }

        let file = &mut self.logger.file;
        if let Some(v) = lookup("STD_ENABLED") {
            file.enabled = parse_bool("STD_ENABLED", &v)?;
        }
        if let Some(v) = lookup("STD_LEVEL") {
            file.level = parse_level("STD_LEVEL", &v)?;
        }

        let structured = &mut self.logger.structured;
        if let Some(v) = lookup("SLOG_ENABLED") {
            structured.enabled = parse_bool("SLOG_ENABLED", &v)?;
        }
        if let Some(v) = lookup("SLOG_LEVEL") {
            structured.level = parse_level("SLOG_LEVEL", &v)?;
        }
        if let Some(v) = lookup("SLOG_JSON") {
            structured.json = parse_bool("SLOG_JSON", &v)?;
        }

        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(LogRelayError::Config(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

fn parse_level(name: &str, value: &str) -> Result<Severity> {
    value
        .parse()
        .map_err(|e| LogRelayError::Config(format!("{}: {}", name, e)))
}

/// Identity stamped on alert messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
    pub environment: String,
    /// Distinguishes replicas of the same service
    pub instance_id: Uuid,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "service".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "local".to_string(),
            instance_id: Uuid::new_v4(),
        }
    }
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Internal log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
        }
    }
}

/// Sinks and fan-out behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// How long `fatal` waits for asynchronous sinks before exiting
    pub fatal_grace_ms: u64,

    /// Plain text sink writing to a rotated file or stdout
    pub file: FileSinkConfig,

    /// Structured (pretty or JSON) stdout sink
    pub structured: StructuredSinkConfig,

    /// Telegram alert sink
    pub alert: AlertSinkConfig,
}

impl LoggerConfig {
    pub fn fatal_grace(&self) -> Duration {
        Duration::from_millis(self.fatal_grace_ms)
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            fatal_grace_ms: 2_000,
            file: FileSinkConfig::default(),
            structured: StructuredSinkConfig::default(),
            alert: AlertSinkConfig::default(),
        }
    }
}

/// Plain text sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSinkConfig {
    pub enabled: bool,
    pub level: Severity,
    /// Output file path
    pub path: String,
    /// Write to stdout instead of `path`
    pub stdout: bool,
    /// Rotation: size, daily, hourly, none
    pub rotation: String,
    /// Max file size for size-based rotation (e.g., "5MB")
    pub max_size: String,
    /// Number of rotated files to keep
    pub max_files: usize,
    /// Compress rotated files
    pub compress: bool,
}

impl Default for FileSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: Severity::Info,
            path: "/var/log/service.log".to_string(),
            stdout: true,
            rotation: "size".to_string(),
            max_size: "5MB".to_string(),
            max_files: 20,
            compress: false,
        }
    }
}

/// Structured stdout sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuredSinkConfig {
    pub enabled: bool,
    pub level: Severity,
    /// One JSON object per line instead of pretty text
    pub json: bool,
}

impl Default for StructuredSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: Severity::Info,
            json: false,
        }
    }
}

/// Telegram alert sink configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSinkConfig {
    pub enabled: bool,
    /// Lines below this level are neither buffered nor alerted
    pub level: Severity,
    /// Destination chat (numeric id or `@channel`)
    pub chat_id: String,
    pub bot_token: String,
    /// Bot API base URL
    pub api_url: String,
    /// Pending alerts before producers wait
    pub queue_capacity: usize,
    /// How long a request's context lines are kept
    pub context_ttl_secs: u64,
    /// Delay between an error and its alert, so trailing lines are included
    pub flush_delay_ms: u64,
    pub request_timeout_secs: u64,
}

impl AlertSinkConfig {
    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.context_ttl_secs)
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for AlertSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: Severity::Debug,
            chat_id: String::new(),
            bot_token: String::new(),
            api_url: "https://api.telegram.org".to_string(),
            queue_capacity: 100,
            context_ttl_secs: 30,
            flush_delay_ms: 1_000,
            request_timeout_secs: 10,
        }
    }
}

impl fmt::Debug for AlertSinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertSinkConfig")
            .field("enabled", &self.enabled)
            .field("level", &self.level)
            .field("chat_id", &self.chat_id)
            .field("bot_token", &"<redacted>")
            .field("api_url", &self.api_url)
            .field("queue_capacity", &self.queue_capacity)
            .field("context_ttl_secs", &self.context_ttl_secs)
            .field("flush_delay_ms", &self.flush_delay_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.app.name, "service");
        assert_eq!(config.logger.fatal_grace(), Duration::from_secs(2));
        assert!(config.logger.file.enabled);
        assert!(config.logger.file.stdout);
        assert_eq!(config.logger.file.level, Severity::Info);
        assert!(!config.logger.structured.enabled);
        assert!(!config.logger.alert.enabled);
        assert_eq!(config.logger.alert.queue_capacity, 100);
        assert_eq!(config.logger.alert.context_ttl(), Duration::from_secs(30));
        assert_eq!(config.logger.alert.flush_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[app]
name = "billing"
"#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.app.name, "billing");
        // Defaults should be applied
        assert_eq!(config.logger.alert.queue_capacity, 100);
        assert_eq!(config.logger.file.max_files, 20);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[app]
name = "billing"
version = "2.3.1"
environment = "prod"
instance_id = "6f1c1c4e-2b7a-4c43-9a57-5c8a4e9a1d11"

[logger]
fatal_grace_ms = 500

[logger.file]
enabled = true
level = "warning"
stdout = false
path = "/tmp/billing.log"

[logger.structured]
enabled = true
level = "DEBUG"
json = true

[logger.alert]
enabled = true
level = "info"
chat_id = "-100123"
bot_token = "123:abc"
queue_capacity = 10
context_ttl_secs = 5
"#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.app.environment, "prod");
        assert_eq!(
            config.app.instance_id.to_string(),
            "6f1c1c4e-2b7a-4c43-9a57-5c8a4e9a1d11"
        );
        assert_eq!(config.logger.fatal_grace(), Duration::from_millis(500));
        assert_eq!(config.logger.file.level, Severity::Warning);
        assert!(!config.logger.file.stdout);
        assert!(config.logger.structured.json);
        assert_eq!(config.logger.structured.level, Severity::Debug);
        assert_eq!(config.logger.alert.level, Severity::Info);
        assert_eq!(config.logger.alert.chat_id, "-100123");
        assert_eq!(config.logger.alert.queue_capacity, 10);
        assert_eq!(config.logger.alert.context_ttl_secs, 5);
        assert_eq!(config.logger.alert.flush_delay_ms, 1_000);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let toml = r#"
[logger.file]
level = "loud"
"#;
        assert!(Config::from_str(toml).is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = Config::from_file("/nonexistent/logrelay/config.toml");
        assert!(matches!(result, Err(LogRelayError::Io(_))));
    }

    #[test]
    fn test_serialize_to_toml() {
        let config = Config::default();
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("[logger.alert]"));
        assert!(toml.contains("instance_id"));

        let reparsed = Config::from_str(&toml).unwrap();
        assert_eq!(reparsed.app.instance_id, config.app.instance_id);
    }

    #[test]
    fn test_apply_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TELEGRAM_ENABLED", "true"),
            ("TELEGRAM_CHAT_ID", "-42"),
            ("BOT_API_TOKEN", "secret"),
            ("STD_LEVEL", "error"),
            ("SLOG_JSON", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env_from(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert!(config.logger.alert.enabled);
        assert_eq!(config.logger.alert.chat_id, "-42");
        assert_eq!(config.logger.alert.bot_token, "secret");
        assert_eq!(config.logger.file.level, Severity::Error);
        assert!(config.logger.structured.json);
        assert!(!config.logger.structured.enabled);
    }

    #[test]
    fn test_apply_env_rejects_bad_bool() {
        let mut config = Config::default();
        let result = config.apply_env_from(|name| {
            (name == "SLOG_ENABLED").then(|| "maybe".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_alert_config_debug_redacts_token() {
        let config = AlertSinkConfig {
            bot_token: "123:super-secret".to_string(),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
