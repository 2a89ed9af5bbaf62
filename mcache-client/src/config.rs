//! Client configuration.
//!
//! A `ClientConfig` can be built in code, parsed from JSON, or read from
//! `MCACHE_*` environment variables. Timeouts are given in milliseconds in
//! both external forms.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use mcache_common::{McError, McResult};

use crate::pool::PoolConfig;

const ENV_HOST: &str = "MCACHE_HOST";
const ENV_PORT: &str = "MCACHE_PORT";
const ENV_MIN_SIZE: &str = "MCACHE_MIN_SIZE";
const ENV_MAX_SIZE: &str = "MCACHE_MAX_SIZE";
const ENV_CONNECT_TIMEOUT_MS: &str = "MCACHE_CONNECT_TIMEOUT_MS";
const ENV_OP_TIMEOUT_MS: &str = "MCACHE_OP_TIMEOUT_MS";

/// Configuration for the client and its pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Connections opened on first use.
    pub min_size: usize,
    /// Maximum total connections (idle + in-use).
    pub max_size: usize,
    /// Optional TCP connect timeout.
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Option<Duration>,
    /// Optional deadline for a single request/reply exchange.
    #[serde(rename = "op_timeout_ms", deserialize_with = "millis")]
    pub op_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 11211,
            min_size: 2,
            max_size: 2,
            connect_timeout: None,
            op_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Parses a JSON object; missing fields keep their defaults.
    ///
    /// ```rust
    /// use mcache_client::ClientConfig;
    ///
    /// let config = ClientConfig::from_json(r#"{"port": 11311, "op_timeout_ms": 250}"#).unwrap();
    /// assert_eq!(config.port, 11311);
    /// assert_eq!(config.host, "127.0.0.1");
    /// ```
    pub fn from_json(text: &str) -> McResult<Self> {
        serde_json::from_str(text)
            .map_err(|err| McError::validation(format!("invalid client config: {}", err)))
    }

    /// Reads `MCACHE_HOST`, `MCACHE_PORT`, `MCACHE_MIN_SIZE`,
    /// `MCACHE_MAX_SIZE`, `MCACHE_CONNECT_TIMEOUT_MS` and
    /// `MCACHE_OP_TIMEOUT_MS`. Unset variables keep their defaults.
    pub fn from_env() -> McResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> McResult<Self> {
        let mut config = ClientConfig::default();
        if let Some(host) = lookup(ENV_HOST) {
            config.host = host;
        }
        if let Some(port) = parse_var(&lookup, ENV_PORT)? {
            config.port = port;
        }
        if let Some(min_size) = parse_var(&lookup, ENV_MIN_SIZE)? {
            config.min_size = min_size;
        }
        if let Some(max_size) = parse_var(&lookup, ENV_MAX_SIZE)? {
            config.max_size = max_size;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_CONNECT_TIMEOUT_MS)? {
            config.connect_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64>(&lookup, ENV_OP_TIMEOUT_MS)? {
            config.op_timeout = Some(Duration::from_millis(ms));
        }
        Ok(config)
    }

    pub(crate) fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            host: self.host.clone(),
            port: self.port,
            min_size: self.min_size,
            max_size: self.max_size,
            connect_timeout: self.connect_timeout,
            op_timeout: self.op_timeout,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> McResult<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| McError::validation(format!("{} has invalid value {:?}", name, raw))),
    }
}

fn millis<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}
