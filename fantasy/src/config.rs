//! Simulation configuration, loaded from JSON.

use std::path::Path;

use comms::controller::ControllerConfig;
use comms::protocol::DeviceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::uart::UartOptions;

/// Errors while loading a simulation
#[derive(Error, Debug)]
pub enum SimError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Two devices on one UART link. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub controller: ControllerConfig,
    pub uart: UartOptions,
    pub device_ids: [DeviceId; 2],
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            uart: UartOptions::default(),
            device_ids: [1, 2],
        }
    }
}

impl SimConfig {
    pub fn from_json(json: &str) -> Result<Self, SimError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String, SimError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SimConfig::from_json(
            r#"{
                "controller": { "max_retries": 5, "user_name": "ada" },
                "uart": { "auto_ack": false },
                "device_ids": [10, 20]
            }"#,
        )
        .unwrap();
        assert_eq!(config.controller.max_retries, 5);
        assert_eq!(config.controller.user_name.as_str(), "ada");
        assert_eq!(config.controller.open_timeout_us, 1_000_000);
        assert!(!config.uart.auto_ack);
        assert_eq!(config.uart.ack_timeout_us, 1000);
        assert_eq!(config.device_ids, [10, 20]);
    }

    #[test]
    fn test_json_round_trip() {
        let config = SimConfig::default();
        let json = config.to_json().unwrap();
        assert_eq!(SimConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(SimConfig::from_json("{ nope"), Err(SimError::Parse(_))));
        assert!(matches!(
            SimConfig::load("/nonexistent/fantasy.json"),
            Err(SimError::Io(_))
        ));
    }
}
