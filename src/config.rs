//! Startup configuration.
//!
//! Values are resolved once, with the precedence
//! command-line flag > environment variable > TOML config file > default.
//! Flags and environment variables are both handled by clap; the config file
//! is either the one named by `--config` (which then must exist) or
//! `~/.http2mqtt.toml` when present.

use crate::mqtt::config::{packet_size_for, Credentials, MqttSettings, MQTT_MAX_PACKET_SIZE};
use clap::Parser;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_CONFIG_FILE: &str = ".http2mqtt.toml";

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

#[derive(Debug, Default, Parser)]
#[command(name = "http2mqtt", version, about = "A HTTP to MQTT Broker Bridge")]
pub struct Cli {
    /// Config file (default is $HOME/.http2mqtt.toml)
    #[arg(short, long, env = "HTTP2MQTT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to listen for web connections [default: 8080]
    #[arg(short, long, env = "HTTP2MQTT_PORT")]
    pub port: Option<u16>,

    /// MQTT broker address [default: localhost]
    #[arg(short, long, env = "HTTP2MQTT_BROKER")]
    pub broker: Option<String>,

    /// MQTT broker port [default: 1883]
    #[arg(short = 'q', long = "brokerport", env = "HTTP2MQTT_BROKERPORT")]
    pub brokerport: Option<u16>,

    /// Broker username
    #[arg(short, long, env = "HTTP2MQTT_USERNAME")]
    pub username: Option<String>,

    /// Broker password
    #[arg(short = 'P', long, env = "HTTP2MQTT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// MQTT client id [default: http2mqtt-<pid>]
    #[arg(long, env = "HTTP2MQTT_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Number of messages buffered between HTTP and the broker [default: 10]
    #[arg(long, env = "HTTP2MQTT_QUEUE_CAPACITY")]
    pub queue_capacity: Option<usize>,
}

/// Contents of the TOML config file. Every key is optional.
#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub broker: Option<String>,
    pub brokerport: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub queue_capacity: Option<usize>,
    pub keep_alive_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub max_reconnect_interval_secs: Option<u64>,
    pub max_body_bytes: Option<usize>,
    pub shutdown_grace_secs: Option<u64>,
}

/// Fully resolved, immutable configuration of the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub listen_addr: SocketAddr,
    pub mqtt: MqttSettings,
    pub queue_capacity: usize,
    pub max_body_bytes: usize,
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            mqtt: MqttSettings::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Reads the config file (if any) and merges it with the parsed flags.
pub async fn resolve(cli: Cli) -> Result<BridgeConfig, ConfigError> {
    let file = match cli.config.as_deref() {
        Some(path) => load_file(path).await?,
        None => match default_config_path() {
            Some(path) if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
                load_file(&path).await?
            }
            _ => {
                debug!("No config file found, using flags, environment and defaults");
                FileConfig::default()
            }
        },
    };

    merge(cli, file)
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_CONFIG_FILE))
}

pub async fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    let file = toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    info!("Using config file: {}", path.display());
    Ok(file)
}

/// Applies flag > env > file > default precedence and validates the result.
///
/// clap has already folded environment variables into `cli`, so a value
/// present there is either a flag or its environment variable.
pub fn merge(cli: Cli, file: FileConfig) -> Result<BridgeConfig, ConfigError> {
    let defaults = BridgeConfig::default();
    let mqtt_defaults = defaults.mqtt.clone();

    let port = cli.port.or(file.port).unwrap_or(DEFAULT_PORT);
    let host = cli.broker.or(file.broker).unwrap_or(mqtt_defaults.host);
    let broker_port = cli.brokerport.or(file.brokerport).unwrap_or(mqtt_defaults.port);
    let username = cli.username.or(file.username).unwrap_or_default();
    let password = cli.password.or(file.password).unwrap_or_default();

    let credentials = if username.is_empty() {
        None
    } else {
        Some(Credentials { username, password })
    };

    let max_body_bytes = file.max_body_bytes.unwrap_or(defaults.max_body_bytes);

    let seconds = |value: Option<u64>, default: Duration| {
        value.map(Duration::from_secs).unwrap_or(default)
    };

    let config = BridgeConfig {
        listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        mqtt: MqttSettings {
            host,
            port: broker_port,
            client_id: cli
                .client_id
                .or(file.client_id)
                .unwrap_or(mqtt_defaults.client_id),
            credentials,
            keep_alive: seconds(file.keep_alive_secs, mqtt_defaults.keep_alive),
            connect_timeout: seconds(file.connect_timeout_secs, mqtt_defaults.connect_timeout),
            initial_reconnect_interval: mqtt_defaults.initial_reconnect_interval,
            max_reconnect_interval: seconds(
                file.max_reconnect_interval_secs,
                mqtt_defaults.max_reconnect_interval,
            ),
            max_packet_size: packet_size_for(max_body_bytes),
        },
        queue_capacity: cli
            .queue_capacity
            .or(file.queue_capacity)
            .unwrap_or(defaults.queue_capacity),
        max_body_bytes,
        shutdown_grace: seconds(file.shutdown_grace_secs, defaults.shutdown_grace),
    };

    validate(&config)?;
    Ok(config)
}

fn validate(config: &BridgeConfig) -> Result<(), ConfigError> {
    if config.mqtt.host.trim().is_empty() {
        return Err(ConfigError::Invalid("broker address is empty".to_string()));
    }
    if config.mqtt.port == 0 {
        return Err(ConfigError::Invalid("broker port must not be 0".to_string()));
    }
    if config.mqtt.client_id.is_empty() || config.mqtt.client_id.starts_with(' ') {
        return Err(ConfigError::Invalid(
            "client id must not be empty or start with a space".to_string(),
        ));
    }
    if config.queue_capacity == 0 {
        return Err(ConfigError::Invalid(
            "queue capacity must be at least 1".to_string(),
        ));
    }
    if config.mqtt.max_packet_size > MQTT_MAX_PACKET_SIZE {
        return Err(ConfigError::Invalid(format!(
            "max body bytes {} does not fit in an MQTT packet",
            config.max_body_bytes
        )));
    }
    // rumqttc rejects keep-alive intervals below five seconds
    if config.mqtt.keep_alive < Duration::from_secs(5) {
        return Err(ConfigError::Invalid(
            "keep alive must be at least 5 seconds".to_string(),
        ));
    }
    Ok(())
}
