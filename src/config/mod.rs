//! Configuration Module
//!
//! TOML configuration for the bridge binary:
//! - Logging level
//! - Broker endpoint, credentials and session parameters
//! - Bridge subscriptions and waiting behaviour
//! - Environment variable overrides (VIBEBRIDGE__* prefix)

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use rand::Rng;
use regex::Regex;
use serde::Deserialize;

use crate::protocol::QoS;
use crate::topic::TopicPattern;
use crate::transport::DEFAULT_PORT;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("substitution pattern is valid")
    });
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Broker connection
    pub broker: BrokerConfig,
    /// Subscriptions and waiting behaviour
    pub bridge: BridgeSettings,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Broker endpoint and MQTT session parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Client identifier; a random `mqtt-N` id when unset
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep alive in seconds (0 disables PINGREQ)
    pub keepalive: u16,
    pub clean_session: bool,
    /// TCP connect and CONNACK timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Initial delay before re-establishing a lost session
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Upper bound for the exponential reconnect backoff
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
    /// Re-establish lost sessions automatically
    pub reconnect: bool,
}

fn default_client_id() -> String {
    format!("mqtt-{}", rand::thread_rng().gen_range(0..1000))
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            client_id: default_client_id(),
            username: None,
            password: None,
            keepalive: 60,
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(60),
            reconnect: true,
        }
    }
}

impl BrokerConfig {
    /// Address in the form accepted by [`Transport::connect`](crate::Transport::connect)
    pub fn address(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }

    pub fn keepalive_duration(&self) -> Option<Duration> {
        (self.keepalive > 0).then(|| Duration::from_secs(self.keepalive as u64))
    }
}

/// Bridge behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// Filters subscribed on startup
    pub subscriptions: Vec<String>,
    /// QoS requested for those subscriptions (0, 1 or 2)
    pub qos: u8,
    /// How long to wait for the connection before publishing
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
    /// Buffer size of channel subscriptions
    pub channel_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            subscriptions: vec!["#".to_string()],
            qos: 0,
            wait_timeout: Duration::from_secs(3),
            channel_capacity: 1024,
        }
    }
}

impl BridgeSettings {
    pub fn qos(&self) -> QoS {
        QoS::from_u8(self.qos).unwrap_or_default()
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `VIBEBRIDGE__` prefix with double underscores for nesting:
    ///    - `VIBEBRIDGE__BROKER__HOST=192.168.1.48` overrides `broker.host`
    ///    - `VIBEBRIDGE__BROKER__CONNECT_TIMEOUT=5s` overrides `broker.connect_timeout`
    ///    - `VIBEBRIDGE__BRIDGE__SUBSCRIPTIONS=dwm/#,sys/#` overrides `bridge.subscriptions`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("broker.host", "localhost")?
            .set_default("broker.port", DEFAULT_PORT as i64)?
            .set_default("broker.keepalive", 60)?
            .set_default("broker.clean_session", true)?
            .set_default("broker.connect_timeout", "10s")?
            .set_default("broker.reconnect_interval", "1s")?
            .set_default("broker.max_reconnect_interval", "60s")?
            .set_default("broker.reconnect", true)?
            .set_default("bridge.subscriptions", vec!["#"])?
            .set_default("bridge.qos", 0)?
            .set_default("bridge.wait_timeout", "3s")?
            .set_default("bridge.channel_capacity", 1024)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEBRIDGE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("bridge.subscriptions")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides only (no file).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.is_empty() {
            return Err(ConfigError::Validation(
                "broker.host must not be empty".to_string(),
            ));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::Validation(
                "broker.port must not be 0".to_string(),
            ));
        }
        // MQTT 3.1.1 only allows an empty client id with a clean session
        if self.broker.client_id.is_empty() && !self.broker.clean_session {
            return Err(ConfigError::Validation(
                "broker.client_id is required when clean_session is false".to_string(),
            ));
        }
        if self.broker.password.is_some() && self.broker.username.is_none() {
            return Err(ConfigError::Validation(
                "broker.password requires broker.username".to_string(),
            ));
        }
        if self.broker.connect_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "broker.connect_timeout must be greater than 0".to_string(),
            ));
        }
        if self.broker.reconnect_interval.is_zero() {
            return Err(ConfigError::Validation(
                "broker.reconnect_interval must be greater than 0".to_string(),
            ));
        }
        if self.broker.max_reconnect_interval < self.broker.reconnect_interval {
            return Err(ConfigError::Validation(
                "broker.max_reconnect_interval must not be below reconnect_interval".to_string(),
            ));
        }

        if self.bridge.qos > 2 {
            return Err(ConfigError::Validation(
                "bridge.qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.bridge.channel_capacity == 0 {
            return Err(ConfigError::Validation(
                "bridge.channel_capacity must be greater than 0".to_string(),
            ));
        }
        for filter in &self.bridge.subscriptions {
            TopicPattern::parse(filter)
                .map_err(|e| ConfigError::Validation(format!("bridge.subscriptions: {}", e)))?;
        }

        Ok(())
    }
}
