//! Configuration for sessions and bridge relays.
//!
//! Both structs load from JSON files (every key optional at the serde level)
//! and are checked by `validate()` before anything touches the network; a
//! missing required key fails fast with [`ConfigError::Missing`].

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use strait_proto::{DEFAULT_CHANNEL_TAG, DEFAULT_ENDPOINT_ID_OFFSET, MAX_FRAME_LEN};
use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024;
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "strait";
pub const DEFAULT_BRIDGE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(2);

/// What a bridge call does when its reply does not arrive in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Keep waiting until the reply arrives or the relay stops.
    None,
    /// Fail only the call that timed out.
    #[default]
    Critical,
    /// Fail the call that timed out and every other pending call.
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub signalling: Option<String>,
    pub offering: bool,
    pub ice_servers: Vec<String>,
    pub data_channel_label: String,
    pub channel_tag: u8,
    pub max_message_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signalling: None,
            offering: false,
            ice_servers: Vec::new(),
            data_channel_label: DEFAULT_DATA_CHANNEL_LABEL.to_string(),
            channel_tag: DEFAULT_CHANNEL_TAG,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl SessionConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_json(path)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.signalling.as_deref() {
            None => return Err(ConfigError::Missing("signalling")),
            Some(url) if url.trim().is_empty() => return Err(ConfigError::Missing("signalling")),
            Some(_) => {}
        }
        if self.max_message_size <= strait_proto::FRAME_OVERHEAD {
            return Err(ConfigError::Invalid {
                key: "max_message_size",
                reason: format!("{} leaves no room for payload", self.max_message_size),
            });
        }
        Ok(())
    }

    /// Message budget actually used on the data channel.
    pub fn effective_message_size(&self) -> usize {
        self.max_message_size.min(MAX_FRAME_LEN)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the `In` socket binds to.
    pub in_address: Option<String>,
    pub in_port: Option<u16>,
    /// Address the `Out` socket sends to.
    pub out_address: Option<String>,
    pub out_port: Option<u16>,
    pub signalling: Option<String>,
    pub timeout_ms: u64,
    pub timeout_policy: TimeoutPolicy,
    pub rtp_header_offset: usize,
    pub clock_skew_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            in_address: None,
            in_port: None,
            out_address: None,
            out_port: None,
            signalling: None,
            timeout_ms: DEFAULT_BRIDGE_TIMEOUT.as_millis() as u64,
            timeout_policy: TimeoutPolicy::default(),
            rtp_header_offset: DEFAULT_ENDPOINT_ID_OFFSET,
            clock_skew_ms: DEFAULT_CLOCK_SKEW.as_millis() as u64,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        load_json(path)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.in_addr()?;
        self.out_addr()?;
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "timeout_ms",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    pub fn in_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(
            "in_address",
            self.in_address.as_deref(),
            "in_port",
            self.in_port,
        )
    }

    pub fn out_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve(
            "out_address",
            self.out_address.as_deref(),
            "out_port",
            self.out_port,
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_millis(self.clock_skew_ms)
    }
}

fn load_json<T>(path: impl AsRef<Path>) -> Result<T, ConfigError>
where
    T: DeserializeOwned + Validate,
{
    let text = std::fs::read_to_string(path.as_ref())?;
    let config: T = serde_json::from_str(&text)?;
    config.check()?;
    Ok(config)
}

trait Validate {
    fn check(&self) -> Result<(), ConfigError>;
}

impl Validate for SessionConfig {
    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
    }
}

impl Validate for BridgeConfig {
    fn check(&self) -> Result<(), ConfigError> {
        self.validate()
    }
}

fn resolve(
    address_key: &'static str,
    address: Option<&str>,
    port_key: &'static str,
    port: Option<u16>,
) -> Result<SocketAddr, ConfigError> {
    let address = address.ok_or(ConfigError::Missing(address_key))?;
    let port = port.ok_or(ConfigError::Missing(port_key))?;
    (address, port)
        .to_socket_addrs()
        .map_err(|err| ConfigError::Invalid {
            key: address_key,
            reason: err.to_string(),
        })?
        .next()
        .ok_or_else(|| ConfigError::Invalid {
            key: address_key,
            reason: format!("`{address}` did not resolve"),
        })
}

/// Reads `key` through `lookup`, falling back to `default` (with a warning)
/// when the value is unparsable or below `min`.
pub(crate) fn parse_env_or<T, F>(lookup: &F, key: &str, default: T, min: T) -> T
where
    T: FromStr + PartialOrd + Copy + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) if value >= min => value,
            Ok(value) => {
                warn!(key, value = %value, min = %min, "value below minimum; using default");
                default
            }
            Err(_) => {
                warn!(key, value = %raw, "failed to parse value; using default");
                default
            }
        },
        None => default,
    }
}

pub(crate) fn parse_bool_env<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).as_deref().map(str::trim) {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        Some(other) => {
            warn!(key, value = other, "unrecognised boolean; using default");
            default
        }
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn session_config_requires_signalling() {
        let err = SessionConfig::from_json_str(r#"{"offering": true}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("signalling")));

        let config =
            SessionConfig::from_json_str(r#"{"signalling": "ws://127.0.0.1:8080"}"#).unwrap();
        assert_eq!(config.channel_tag, DEFAULT_CHANNEL_TAG);
        assert_eq!(config.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn message_size_is_clamped_to_frame_limit() {
        let config = SessionConfig {
            signalling: Some("ws://x".into()),
            max_message_size: 262_144,
            ..SessionConfig::default()
        };
        assert_eq!(config.effective_message_size(), MAX_FRAME_LEN);
    }

    #[test]
    fn bridge_config_names_the_first_missing_key() {
        let err = BridgeConfig::from_json_str(r#"{"in_address": "127.0.0.1", "in_port": 5000}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("out_address")));

        let config = BridgeConfig::from_json_str(
            r#"{"in_address": "127.0.0.1", "in_port": 5000,
                "out_address": "127.0.0.1", "out_port": 5001,
                "timeout_policy": "all"}"#,
        )
        .unwrap();
        assert_eq!(config.out_addr().unwrap().port(), 5001);
        assert_eq!(config.timeout_policy, TimeoutPolicy::All);
        assert_eq!(config.rtp_header_offset, DEFAULT_ENDPOINT_ID_OFFSET);
    }

    #[test]
    fn env_parsing_falls_back_on_bad_values() {
        let vars: HashMap<&str, &str> = [("A", "12"), ("B", "nope"), ("C", "1"), ("D", "off")]
            .into_iter()
            .collect();
        let lookup = |key: &str| vars.get(key).map(|v| v.to_string());
        assert_eq!(parse_env_or(&lookup, "A", 5usize, 1), 12);
        assert_eq!(parse_env_or(&lookup, "B", 5usize, 1), 5);
        assert_eq!(parse_env_or(&lookup, "C", 5usize, 2), 5);
        assert_eq!(parse_env_or(&lookup, "missing", 5usize, 1), 5);
        assert!(!parse_bool_env(&lookup, "D", true));
        assert!(parse_bool_env(&lookup, "missing", true));
    }
}
