// Runtime configuration. Everything comes from environment variables (a
// `.env` file is loaded by `main` first); each value falls back to the
// relay's built-in default so a bare `cargo run` talks to localhost:1883 and
// listens on `node/value`.
use std::time::Duration;

use rumqttc::QoS;
use thiserror::Error;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TOPIC: &str = "node/value";
pub const DEFAULT_CLIENT_ID: &str = "mqtt-cell-relay";
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
pub const DEFAULT_IDLE_SECS: u64 = 5;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10;
pub const DEFAULT_CLOUD_HOST: &str = "cloudsocket.hologram.io";
pub const DEFAULT_CLOUD_PORT: u16 = 9999;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("MQTT_HOST must be set if MQTT_PORT is provided")]
    PortWithoutHost,

    #[error("invalid {key} value, expected a number, got: {value}")]
    InvalidNumber { key: &'static str, value: String },

    #[error("invalid {key} value, expected true/false, got: {value}")]
    InvalidBool { key: &'static str, value: String },

    #[error("invalid MQTT_QOS value, expected 0, 1 or 2, got: {0}")]
    InvalidQos(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    /// Foreground idle tick. Only keeps a heartbeat in the debug log.
    pub idle_interval: Duration,
    pub channel_capacity: usize,
    /// `Some` turns the relay into a cellular forwarder.
    pub cellular: Option<CellularConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub credentials: Option<(String, String)>,
    pub topic: String,
    pub qos: QoS,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellularConfig {
    pub cloud_host: String,
    pub cloud_port: u16,
    pub device_key: Option<String>,
    /// Explicitly connect the link at startup and disconnect it on every
    /// exit path. When false the link is left to the network stack.
    pub manage_link: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            credentials: None,
            topic: DEFAULT_TOPIC.to_string(),
            qos: QoS::AtMostOnce,
        }
    }
}

impl Default for CellularConfig {
    fn default() -> Self {
        Self {
            cloud_host: DEFAULT_CLOUD_HOST.to_string(),
            cloud_port: DEFAULT_CLOUD_PORT,
            device_key: None,
            manage_link: true,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut broker = BrokerConfig::default();

        match (var("MQTT_HOST"), var("MQTT_PORT")) {
            (None, None) => {}
            (Some(host), Some(port)) => {
                broker.host = host;
                broker.port = parse_number("MQTT_PORT", &port)?;
            }
            (Some(host), None) => broker.host = host,
            (None, Some(_)) => return Err(ConfigError::PortWithoutHost),
        }

        match (var("MQTT_USER"), var("MQTT_PASS")) {
            (Some(user), Some(pass)) => broker.credentials = Some((user, pass)),
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!("MQTT credentials incomplete: set both MQTT_USER and MQTT_PASS");
            }
            (None, None) => {}
        }

        if let Some(id) = var("MQTT_CLIENT_ID") {
            broker.client_id = id;
        }
        if let Some(secs) = var("MQTT_KEEP_ALIVE_SECS") {
            broker.keep_alive = Duration::from_secs(parse_nonzero("MQTT_KEEP_ALIVE_SECS", &secs)?);
        }
        if let Some(topic) = var("MQTT_TOPIC") {
            broker.topic = topic;
        }
        if let Some(qos) = var("MQTT_QOS") {
            broker.qos = parse_qos(&qos)?;
        }

        let idle_secs = match var("RELAY_IDLE_SECS") {
            Some(v) => parse_nonzero("RELAY_IDLE_SECS", &v)?,
            None => DEFAULT_IDLE_SECS,
        };
        let channel_capacity = match var("RELAY_CHANNEL_CAPACITY") {
            Some(v) => parse_nonzero("RELAY_CHANNEL_CAPACITY", &v)?,
            None => DEFAULT_CHANNEL_CAPACITY,
        };

        let forward = match var("CELLULAR_FORWARD") {
            Some(v) => parse_bool("CELLULAR_FORWARD", &v)?,
            None => false,
        };
        let cellular = if forward {
            let mut cell = CellularConfig::default();
            if let Some(host) = var("CELLULAR_CLOUD_HOST") {
                cell.cloud_host = host;
            }
            if let Some(port) = var("CELLULAR_CLOUD_PORT") {
                cell.cloud_port = parse_number("CELLULAR_CLOUD_PORT", &port)?;
            }
            cell.device_key = var("CELLULAR_DEVICE_KEY");
            if let Some(v) = var("CELLULAR_MANAGE_LINK") {
                cell.manage_link = parse_bool("CELLULAR_MANAGE_LINK", &v)?;
            }
            Some(cell)
        } else {
            None
        };

        Ok(Self {
            broker,
            idle_interval: Duration::from_secs(idle_secs),
            channel_capacity,
            cellular,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse::<T>().map_err(|_| ConfigError::InvalidNumber {
        key,
        value: value.to_string(),
    })
}

fn parse_nonzero<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let n: T = parse_number(key, value)?;
    if n == T::default() {
        return Err(ConfigError::Zero(key));
    }
    Ok(n)
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_qos(value: &str) -> Result<QoS, ConfigError> {
    match value {
        "0" => Ok(QoS::AtMostOnce),
        "1" => Ok(QoS::AtLeastOnce),
        "2" => Ok(QoS::ExactlyOnce),
        other => Err(ConfigError::InvalidQos(other.to_string())),
    }
}
