//! Configuration management for turnstile.
//!
//! Two layers live here: the process configuration read at startup, and the
//! loosely typed [`LimiterConfig`] record handed to limiter factories.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Prefix for environment variable overrides, e.g. `TURNSTILE_SERVER__LISTEN_ADDR`.
const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter selection
    #[serde(default)]
    pub limiter: LimiterSettings,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Admission server address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which limiter to build, and with what parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Registered algorithm name
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Parameters passed to the algorithm's factory
    #[serde(default)]
    pub params: LimiterConfig,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            params: LimiterConfig::default(),
        }
    }
}

fn default_algorithm() -> String {
    "token_bucket".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a file, with `TURNSTILE_*` environment overrides.
    ///
    /// The format is picked from the file extension (YAML, TOML or JSON).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| {
                TurnstileError::Config(format!("Failed to load {}: {}", path.display(), e))
            })
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }
}

/// A single loosely typed configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Integer(i64),
    Real(f64),
    Duration(Duration),
    Text(String),
}

impl ConfigValue {
    /// Name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Bool(_) => "a boolean",
            ConfigValue::Integer(_) => "an integer",
            ConfigValue::Real(_) => "a real number",
            ConfigValue::Duration(_) => "a duration",
            ConfigValue::Text(_) => "text",
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i32> for ConfigValue {
    fn from(value: i32) -> Self {
        ConfigValue::Integer(value.into())
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Integer(value)
    }
}

impl From<u32> for ConfigValue {
    fn from(value: u32) -> Self {
        ConfigValue::Integer(value.into())
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        ConfigValue::Real(value)
    }
}

impl From<Duration> for ConfigValue {
    fn from(value: Duration) -> Self {
        ConfigValue::Duration(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Text(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::Text(value)
    }
}

/// Loosely typed parameters for a limiter factory.
///
/// The accessors return `Ok(None)` for a missing key and an error for a key
/// that is present with the wrong type. No other validation happens here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LimiterConfig {
    values: BTreeMap<String, ConfigValue>,
}

impl LimiterConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<ConfigValue>,
    {
        self.insert(key, value);
        self
    }

    /// Insert or replace a value.
    pub fn insert<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<ConfigValue>,
    {
        self.values.insert(key.into(), value.into());
    }

    /// Raw access to a value.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    /// Whether no keys are set.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Read a signed integer.
    pub fn integer(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Integer(value)) => Ok(Some(*value)),
            Some(other) => Err(wrong_type(key, "an integer", other)),
        }
    }

    /// Read a non-negative integer. Negative values are rejected.
    pub fn unsigned(&self, key: &str) -> Result<Option<u64>> {
        match self.integer(key)? {
            None => Ok(None),
            Some(value) => u64::try_from(value).map(Some).map_err(|_| {
                TurnstileError::Config(format!("`{}` must not be negative, got {}", key, value))
            }),
        }
    }

    /// Read a real number. Integers are accepted and widened.
    pub fn real(&self, key: &str) -> Result<Option<f64>> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Real(value)) => Ok(Some(*value)),
            Some(ConfigValue::Integer(value)) => Ok(Some(*value as f64)),
            Some(other) => Err(wrong_type(key, "a real number", other)),
        }
    }

    /// Read a duration, either as a duration value or as text like `500ms`, `1s`, `1m`.
    pub fn duration(&self, key: &str) -> Result<Option<Duration>> {
        match self.get(key) {
            None => Ok(None),
            Some(ConfigValue::Duration(value)) => Ok(Some(*value)),
            Some(ConfigValue::Text(text)) => parse_duration(text).map(Some).ok_or_else(|| {
                TurnstileError::Config(format!(
                    "`{}` is not a valid duration: {:?} (expected e.g. 500ms, 1s, 1m, 1h)",
                    key, text
                ))
            }),
            Some(other) => Err(wrong_type(key, "a duration", other)),
        }
    }
}

fn wrong_type(key: &str, expected: &'static str, found: &ConfigValue) -> TurnstileError {
    TurnstileError::WrongType {
        key: key.to_string(),
        expected,
        found: found.type_name(),
    }
}

/// Parse `<integer><unit>` where unit is `ms`, `s`, `m` or `h`.
fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = text.split_at(split);
    let amount: u64 = amount.parse().ok()?;

    match unit.trim() {
        "ms" => Some(Duration::from_millis(amount)),
        "s" => Some(Duration::from_secs(amount)),
        "m" => amount.checked_mul(60).map(Duration::from_secs),
        "h" => amount.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TurnstileConfig::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.limiter.algorithm, "token_bucket");
        assert!(config.limiter.params.is_empty());
    }

    #[test]
    fn test_parse_yaml_config() {
        let yaml = r#"
server:
  listen_addr: 0.0.0.0:9000
limiter:
  algorithm: fixed_window
  params:
    window_duration: 1m
    window_tokens: 10
    window_size: 2
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.limiter.algorithm, "fixed_window");

        let params = &config.limiter.params;
        assert_eq!(params.duration("window_duration").unwrap(), Some(Duration::from_secs(60)));
        assert_eq!(params.unsigned("window_tokens").unwrap(), Some(10));
        assert_eq!(params.unsigned("window_size").unwrap(), Some(2));
    }

    #[test]
    fn test_parse_yaml_real_and_integer() {
        let yaml = r#"
limiter:
  params:
    refill_rate: 0.5
    capacity: 3
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        let params = &config.limiter.params;
        assert_eq!(params.get("refill_rate"), Some(&ConfigValue::Real(0.5)));
        assert_eq!(params.get("capacity"), Some(&ConfigValue::Integer(3)));
        assert_eq!(config.server.listen_addr.port(), 8080);
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let result = TurnstileConfig::from_yaml("server: [not, a, map]");
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "limiter:\n  algorithm: sliding_window_log\n  params:\n    capacity: 7\n",
        )
        .unwrap();

        let config = TurnstileConfig::load(&path);
        std::fs::remove_file(&path).unwrap();

        let config = config.unwrap();
        assert_eq!(config.limiter.algorithm, "sliding_window_log");
        assert_eq!(config.limiter.params.unsigned("capacity").unwrap(), Some(7));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = TurnstileConfig::load("/nonexistent/turnstile.yaml");
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_accessors_absent_key() {
        let params = LimiterConfig::new();
        assert_eq!(params.integer("capacity").unwrap(), None);
        assert_eq!(params.real("refill_rate").unwrap(), None);
        assert_eq!(params.duration("window_duration").unwrap(), None);
    }

    #[test]
    fn test_accessors_wrong_type() {
        let params = LimiterConfig::new()
            .with("capacity", "five")
            .with("refill_rate", true)
            .with("window_duration", 3);

        let err = params.integer("capacity").unwrap_err();
        assert!(matches!(
            err,
            TurnstileError::WrongType {
                ref key,
                expected: "an integer",
                found: "text",
            } if key == "capacity"
        ));
        assert!(matches!(params.real("refill_rate"), Err(TurnstileError::WrongType { .. })));
        assert!(matches!(
            params.duration("window_duration"),
            Err(TurnstileError::WrongType { .. })
        ));
    }

    #[test]
    fn test_real_accepts_integer() {
        let params = LimiterConfig::new().with("refill_rate", 2);
        assert_eq!(params.real("refill_rate").unwrap(), Some(2.0));
    }

    #[test]
    fn test_unsigned_rejects_negative() {
        let params = LimiterConfig::new().with("capacity", -1);
        assert!(matches!(params.unsigned("capacity"), Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("1s"), Some(Duration::from_secs(1)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("3 days"), None);
    }

    #[test]
    fn test_duration_text_invalid() {
        let params = LimiterConfig::new().with("window_duration", "soon");
        assert!(matches!(params.duration("window_duration"), Err(TurnstileError::Config(_))));
    }
}
