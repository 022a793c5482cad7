//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use repertory::config::{ConfigError, RepertoryConfig};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_both_adapters_from_file() {
    let temp_file = write_config(
        r#"
[mqtt]
client_id = "sensor-gw"
host = "broker.local"
topic = "home/sensors"

[telegram]
token_env = "BOT_TOKEN"
"#,
    );

    let config = RepertoryConfig::load_from_file(temp_file.path()).unwrap();

    let mqtt = config.mqtt.unwrap();
    assert_eq!(mqtt.client_id, "sensor-gw");
    assert_eq!(mqtt.host, "broker.local");
    assert_eq!(mqtt.port, 1883);
    assert_eq!(mqtt.connect_timeout(), Duration::from_secs(2));
    assert_eq!(mqtt.reconnect_delay(), Duration::from_millis(1000));

    let telegram = config.telegram.unwrap();
    assert_eq!(telegram.api_base, "https://api.telegram.org");
    assert_eq!(telegram.poll_timeout_secs, 43);
}

#[test]
fn test_config_loads_with_only_broker() {
    let temp_file = write_config(
        r#"
[mqtt]
client_id = "sensor-gw"
host = "broker.local"
topic = "out"
username_env = "MQTT_USER"
password_env = "MQTT_PASS"
"#,
    );

    let config = RepertoryConfig::load_from_file(temp_file.path()).unwrap();
    let mqtt = config.mqtt.unwrap();
    assert_eq!(mqtt.username_env, Some("MQTT_USER".to_string()));
    assert_eq!(mqtt.password_env, Some("MQTT_PASS".to_string()));
    assert!(config.telegram.is_none());
}

#[test]
fn test_config_returns_error_when_file_missing() {
    let result = RepertoryConfig::load_from_file(std::path::Path::new(
        "/nonexistent/repertory.toml",
    ));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_returns_error_for_malformed_toml() {
    let temp_file = write_config("[mqtt\nclient_id = ");
    let result = RepertoryConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_returns_error_when_required_field_missing() {
    let temp_file = write_config(
        r#"
[mqtt]
client_id = "sensor-gw"
topic = "out"
"#,
    );
    let result = RepertoryConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_leading_slash_topic() {
    let temp_file = write_config(
        r#"
[mqtt]
client_id = "sensor-gw"
host = "broker.local"
topic = "/home/sensors"
"#,
    );
    let result = RepertoryConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidTopic(_))));
}

#[test]
fn test_config_rejects_blank_client_id() {
    let temp_file = write_config(
        r#"
[mqtt]
client_id = ""
host = "broker.local"
topic = "out"
"#,
    );
    let result = RepertoryConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidClientId(_))));
}

#[test]
fn test_config_show_round_trips_through_toml() {
    let temp_file = write_config(
        r#"
[telegram]
token_env = "BOT_TOKEN"
parse_mode = "MarkdownV2"
"#,
    );
    let config = RepertoryConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = RepertoryConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(reparsed, config);
}
