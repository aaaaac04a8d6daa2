//! Settings snapshot loaded at startup.
//!
//! Grounded on `TheerasakPing-bms-monitor/src/can_handler.rs`'s
//! `CanConfig` + `Default` idiom, generalized to the gateway's full
//! configuration surface and made `serde`-deserializable so it can be
//! loaded from a JSON file instead of hardcoded.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::can::{Identity, PublisherMode};
use crate::cvl::CvlConfig;
use crate::serial::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub max_attempts: u32,
    pub per_attempt_timeout_ms: u64,
    pub backoff_ms: u64,
    pub write_settle_ms: u64,
    pub request_queue_capacity: usize,
}

impl Default for SerialSettings {
    fn default() -> Self {
        let default_policy = RetryPolicy::default();
        SerialSettings {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            max_attempts: default_policy.max_attempts,
            per_attempt_timeout_ms: default_policy.per_attempt_timeout.as_millis() as u64,
            backoff_ms: default_policy.backoff.as_millis() as u64,
            write_settle_ms: default_policy.write_settle.as_millis() as u64,
            request_queue_capacity: 32,
        }
    }
}

impl SerialSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            per_attempt_timeout: Duration::from_millis(self.per_attempt_timeout_ms),
            backoff: Duration::from_millis(self.backoff_ms),
            write_settle: Duration::from_millis(self.write_settle_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub retry_ms: u64,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        KeepaliveSettings {
            interval_ms: 1000,
            timeout_ms: 5000,
            retry_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherModeSetting {
    Immediate,
    Periodic,
}

impl From<PublisherModeSetting> for PublisherMode {
    fn from(value: PublisherModeSetting) -> Self {
        match value {
            PublisherModeSetting::Immediate => PublisherMode::Immediate,
            PublisherModeSetting::Periodic => PublisherMode::Periodic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSettings {
    pub mode: PublisherModeSetting,
    pub default_period_ms: u64,
    pub can_interface: String,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        PublisherSettings {
            mode: PublisherModeSetting::Periodic,
            default_period_ms: 1000,
            can_interface: "can0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentitySettings {
    pub manufacturer: String,
    pub battery_name: String,
    pub serial_number: String,
}

impl From<IdentitySettings> for Identity {
    fn from(value: IdentitySettings) -> Self {
        Identity {
            manufacturer: value.manufacturer,
            battery_name: value.battery_name,
        }
    }
}

/// Top-level settings snapshot, deserialized from a JSON config file at
/// startup; every field has a documented default so a missing or partial
/// file still produces a usable gateway.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub serial: SerialSettings,
    pub keepalive: KeepaliveSettings,
    pub publisher: PublisherSettings,
    pub identity: IdentitySettings,
    pub cvl: CvlConfig,
}

impl GatewaySettings {
    /// Parses settings from a JSON string. Callers fall back to
    /// `GatewaySettings::default()` on error and log the reason.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_round_trip_through_json() {
        let settings = GatewaySettings::default();
        let text = serde_json::to_string(&settings).unwrap();
        let parsed = GatewaySettings::from_json(&text).unwrap();
        assert_eq!(settings, parsed);
    }

    #[test]
    fn partial_json_fills_missing_fields_with_defaults() {
        let parsed = GatewaySettings::from_json(r#"{"serial": {"port": "/dev/ttyUSB3"}}"#).unwrap();
        assert_eq!(parsed.serial.port, "/dev/ttyUSB3");
        assert_eq!(parsed.serial.baud_rate, SerialSettings::default().baud_rate);
        assert_eq!(parsed.keepalive, KeepaliveSettings::default());
    }

    #[test]
    fn invalid_json_is_reported_as_an_error() {
        assert!(GatewaySettings::from_json("not json").is_err());
    }
}
