//! Typed configuration for the proxy.
//!
//! The file is YAML; durations are written as strings like `10s` or
//! `500ms`. Anything unset falls back to the defaults below.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Listen address; a bare `:port` binds all interfaces.
    pub bind: String,
    /// Identifier substituted for `{{gatewayId}}` in message templates.
    pub gateway_id: String,
    /// Ingest a PROXY v1/v2 header on every accepted connection.
    pub proxy_protocol: bool,
    /// Adopt the client address from a Real-IP forwarding suffix.
    #[serde(rename = "receiveRealIP")]
    pub receive_real_ip: bool,
    #[serde(with = "duration_str")]
    pub client_timeout: Duration,
    /// Idle timeout for live sessions; absent means none.
    #[serde(with = "opt_duration_str")]
    pub keep_alive_timeout: Option<Duration>,
    /// How long in-flight sessions may outlive a shutdown request.
    #[serde(with = "duration_str")]
    pub grace_period: Duration,
    /// Number of connection-processing workers; 0 means one per CPU.
    pub processing_node_count: usize,
    /// Kick text when no server matches the requested address.
    pub kick_message: String,
    pub servers: Vec<ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: ":25565".to_owned(),
            gateway_id: "infrared".to_owned(),
            proxy_protocol: false,
            receive_real_ip: false,
            client_timeout: Duration::from_secs(10),
            keep_alive_timeout: None,
            grace_period: Duration::from_secs(5),
            processing_node_count: 0,
            kick_message: "No server matches this address.".to_owned(),
            servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Domain patterns matched against the requested host; `*` wildcards
    /// any run of characters.
    pub domains: Vec<String>,
    /// `host:port` of the backing Minecraft server.
    pub address: String,
    /// Prefix the backend connection with a PROXY v2 header.
    pub send_proxy_protocol: bool,
    /// Rewrite the handshake address to carry the client address.
    #[serde(rename = "sendRealIP")]
    pub send_real_ip: bool,
    #[serde(with = "duration_str")]
    pub dial_timeout: Duration,
    /// Kick text when the backend cannot be dialed.
    pub offline_kick_message: Option<String>,
    pub status_override: Option<StatusOverride>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            address: String::new(),
            send_proxy_protocol: false,
            send_real_ip: false,
            dial_timeout: Duration::from_secs(5),
            offline_kick_message: None,
            status_override: None,
        }
    }
}

/// Replacement fields for a server's status response.
///
/// Without `merge_with_backend` the response is synthesised locally and the
/// backend is never dialed for status; with it the backend's own response is
/// fetched and the set fields replace its values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusOverride {
    pub merge_with_backend: bool,
    pub version_name: Option<String>,
    pub protocol_number: Option<i32>,
    pub max_player_count: Option<i32>,
    pub player_count: Option<i32>,
    pub player_samples: Vec<PlayerSample>,
    pub motd: Option<String>,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerSample {
    pub name: String,
    pub uuid: String,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind.is_empty() {
            return Err(ConfigError::Invalid("bind address is empty".to_owned()));
        }
        for (idx, server) in self.servers.iter().enumerate() {
            if server.address.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "servers[{idx}] has no address"
                )));
            }
            if server.domains.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "servers[{idx}] has no domains"
                )));
            }
        }
        Ok(())
    }

    /// The bind address with a bare `:port` expanded to all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.bind.starts_with(':') {
            format!("0.0.0.0{}", self.bind)
        } else {
            self.bind.clone()
        }
    }
}

pub(crate) fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration {raw:?} is missing a unit"))?;
    let (value, unit) = raw.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("duration {raw:?} has no numeric value"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("duration {raw:?} has unknown unit {unit:?}")),
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod opt_duration_str {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => super::parse_duration(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
