//! Configuration for the broker and bot adapters
//!
//! Loaded from a TOML file. Secrets never live in the file itself: the file
//! names the environment variables that hold them, and those are resolved at
//! runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Root configuration - either adapter section may be omitted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepertoryConfig {
    pub mqtt: Option<MqttSection>,
    pub telegram: Option<TelegramSection>,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Unique client identifier for this instance
    pub client_id: String,
    /// Broker address or name
    pub host: String,
    /// Broker port (default: 1883, the unencrypted MQTT port)
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Topic, without a leading separator
    pub topic: String,
    /// Keepalive interval in seconds (default: 20)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Time allowed for one connect attempt in seconds (default: 2)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Fixed delay between reconnect attempts in milliseconds (default: 1000)
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Upper bound on graceful disconnect at teardown in milliseconds (default: 1000)
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_ms: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    20
}

fn default_connect_timeout() -> u64 {
    2
}

fn default_reconnect_delay() -> u64 {
    1000
}

fn default_disconnect_timeout() -> u64 {
    1000
}

impl MqttSection {
    /// Build a section with default timings
    pub fn new(client_id: &str, host: &str, topic: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            host: host.to_string(),
            port: default_mqtt_port(),
            username_env: None,
            password_env: None,
            topic: topic.to_string(),
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            reconnect_delay_ms: default_reconnect_delay(),
            disconnect_timeout_ms: default_disconnect_timeout(),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Get MQTT username from environment variable
    pub fn username(&self) -> Option<String> {
        get_env_var_optional(self.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn password(&self) -> Option<String> {
        get_env_var_optional(self.password_env.as_ref())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_client_id(&self.client_id)?;
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "[mqtt] host must not be empty".to_string(),
            ));
        }
        validate_topic(&self.topic)?;
        if self.keep_alive_secs != 0 && self.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "[mqtt] keep_alive_secs must be 0 or at least 5".to_string(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "[mqtt] connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bot endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelegramSection {
    /// Environment variable containing the bot access token
    pub token_env: String,
    /// API endpoint (default: https://api.telegram.org)
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Server-side long-poll wait in seconds (default: 43)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
    /// Parse mode for outbound messages (default: HTML)
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout() -> u64 {
    43
}

fn default_parse_mode() -> String {
    "HTML".to_string()
}

impl TelegramSection {
    /// Build a section with default endpoint and timings
    pub fn new(token_env: &str) -> Self {
        Self {
            token_env: token_env.to_string(),
            api_base: default_api_base(),
            poll_timeout_secs: default_poll_timeout(),
            parse_mode: default_parse_mode(),
        }
    }

    /// Get the bot access token from environment variable
    pub fn token(&self) -> Result<String, ConfigError> {
        get_env_var_required(&self.token_env)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.api_base)
            .map_err(|_| ConfigError::InvalidApiBase(self.api_base.clone()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidApiBase(self.api_base.clone()));
        }
        if self.token_env.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "[telegram] token_env must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid client id: {0}")]
    InvalidClientId(String),
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
    #[error("Invalid API base URL: {0}")]
    InvalidApiBase(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RepertoryConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RepertoryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.is_none() && self.telegram.is_none() {
            return Err(ConfigError::InvalidConfig(
                "at least one of [mqtt] or [telegram] is required".to_string(),
            ));
        }
        if let Some(mqtt) = &self.mqtt {
            mqtt.validate()?;
        }
        if let Some(telegram) = &self.telegram {
            telegram.validate()?;
        }
        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
client_id = "repertory-test"
host = "localhost"
topic = "repertory/test"

[telegram]
token_env = "TELEGRAM_BOT_TOKEN"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

/// Client ids must be non-empty and free of surrounding whitespace; the MQTT
/// client library refuses anything else.
pub fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    if client_id.is_empty() || client_id.trim() != client_id {
        return Err(ConfigError::InvalidClientId(format!(
            "'{client_id}' must be non-empty without surrounding whitespace"
        )));
    }
    Ok(())
}

/// Topics are relative: no leading separator, no empty string, no wildcards
pub fn validate_topic(topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() || topic.starts_with('/') {
        return Err(ConfigError::InvalidTopic(format!(
            "'{topic}' must be non-empty and must not start with '/'"
        )));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(ConfigError::InvalidTopic(format!(
            "'{topic}' must not contain wildcards"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mqtt]
client_id = "sensor-gw"
host = "broker.local"
port = 1884
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
topic = "home/sensors"
keep_alive_secs = 30
connect_timeout_secs = 3
reconnect_delay_ms = 500

[telegram]
token_env = "BOT_TOKEN"
api_base = "http://localhost:8081"
poll_timeout_secs = 10
"#;

        let config = RepertoryConfig::from_toml_str(toml_content).unwrap();
        let mqtt = config.mqtt.expect("mqtt section present");
        assert_eq!(mqtt.client_id, "sensor-gw");
        assert_eq!(mqtt.port, 1884);
        assert_eq!(mqtt.keep_alive(), Duration::from_secs(30));
        assert_eq!(mqtt.reconnect_delay(), Duration::from_millis(500));
        assert_eq!(mqtt.disconnect_timeout(), Duration::from_millis(1000));

        let telegram = config.telegram.expect("telegram section present");
        assert_eq!(telegram.api_base, "http://localhost:8081");
        assert_eq!(telegram.poll_timeout_secs, 10);
        assert_eq!(telegram.parse_mode, "HTML");
    }

    #[test]
    fn test_mqtt_defaults() {
        let config = RepertoryConfig::test_config();
        let mqtt = config.mqtt.unwrap();
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.keep_alive_secs, 20);
        assert_eq!(mqtt.connect_timeout_secs, 2);
        assert_eq!(mqtt.reconnect_delay_ms, 1000);
        assert_eq!(mqtt, MqttSection::new("repertory-test", "localhost", "repertory/test"));
    }

    #[test]
    fn test_telegram_defaults() {
        let config = RepertoryConfig::test_config();
        let telegram = config.telegram.unwrap();
        assert_eq!(telegram, TelegramSection::new("TELEGRAM_BOT_TOKEN"));
        assert_eq!(telegram.poll_timeout_secs, 43);
    }

    #[test]
    fn test_empty_config_rejected() {
        let result = RepertoryConfig::from_toml_str("");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_leading_slash_topic_rejected() {
        assert!(matches!(
            validate_topic("/home/sensors"),
            Err(ConfigError::InvalidTopic(_))
        ));
        assert!(validate_topic("home/sensors").is_ok());
        assert!(validate_topic("home/#").is_err());
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id(" padded").is_err());
        assert!(validate_client_id("gateway-01").is_ok());
    }

    #[test]
    fn test_invalid_api_base() {
        let toml_content = r#"
[telegram]
token_env = "BOT_TOKEN"
api_base = "not a url"
"#;
        let result = RepertoryConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidApiBase(_))));
    }

    #[test]
    fn test_short_keep_alive_rejected() {
        let mut mqtt = MqttSection::new("id", "localhost", "t");
        mqtt.keep_alive_secs = 2;
        let config = RepertoryConfig {
            mqtt: Some(mqtt),
            telegram: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_token_env() {
        let section = TelegramSection::new("REPERTORY_TEST_TOKEN_THAT_IS_NEVER_SET");
        assert!(matches!(
            section.token(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }
}
