//! Configuration schema and defaults.
//!
//! The file is TOML; keys are camelCase to match the wire-level contract
//! (`jwtSecret`, `connectionLimit.maxPerUser`, `transport.readTimeout`).
//! Environment variables under the `GODISPATCH_` prefix override file
//! values, with dots in key paths mapped to underscores.

use std::collections::HashMap;
use std::time::Duration;

use dispatch_core::EventConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub transport: TransportSettings,
    /// Permission names registered as bits 2..63, in order.
    pub permissions: Vec<String>,
    /// Declarative event pipelines, keyed by event name.
    pub events: HashMap<String, EventConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub address: String,
    pub auth: AuthSettings,
    pub connection_limit: ConnectionLimitSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8080".to_string(),
            auth: AuthSettings::default(),
            connection_limit: ConnectionLimitSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthSettings {
    pub jwt_secret: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "default-secret-key-change-me".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionLimitSettings {
    /// Maximum sockets per user; 0 disables the limit.
    pub max_per_user: usize,
    pub mode: LimitMode,
}

impl Default for ConnectionLimitSettings {
    fn default() -> Self {
        Self {
            max_per_user: 5,
            mode: LimitMode::Reject,
        }
    }
}

/// What happens when a user is at their connection limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitMode {
    /// Refuse the new upgrade with 429.
    Reject,
    /// Evict the user's oldest connection and admit the new one.
    Cycle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportSettings {
    /// Per-read deadline, e.g. "60s", "500ms", "5m".
    pub read_timeout: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            read_timeout: "60s".to_string(),
        }
    }
}

impl TransportSettings {
    pub fn read_timeout(&self) -> Result<Duration, String> {
        parse_duration(&self.read_timeout)
    }
}

/// Parses durations of the form `<number><unit>` with unit `ms`, `s`, `m`,
/// or `h`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let digits_end = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{input}' is missing a unit"))?;
    let (count, unit) = input.split_at(digits_end);
    let count: u64 = count
        .parse()
        .map_err(|_| format!("invalid duration '{input}'"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(count)),
        "s" => Ok(Duration::from_secs(count)),
        "m" => Ok(Duration::from_secs(count * 60)),
        "h" => Ok(Duration::from_secs(count * 60 * 60)),
        _ => Err(format!("invalid duration unit '{unit}' in '{input}'")),
    }
}

/// Accepts the `:8080` shorthand by defaulting the host to all interfaces.
pub fn normalize_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}
