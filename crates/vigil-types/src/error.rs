use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::CommandType;
use crate::event::EmergencyStage;
use crate::sensor::Metric;

/// Error taxonomy shared by every Vigil crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VigilError {
    #[error("Sensor {metric} is stale ({age_secs:.0}s old)")]
    SensorStale { metric: Metric, age_secs: f64 },

    #[error("Device {device} unreachable: {details}")]
    DeviceUnreachable { device: String, details: String },

    #[error("Device fault on {device}: {details}")]
    DeviceFault { device: String, details: String },

    #[error("Command vetoed: {0}")]
    CommandVetoed(String),

    #[error("Command {command} timed out after {after_secs}s")]
    CommandTimeout { command: CommandType, after_secs: u64 },

    #[error("Emergency stage {stage} failed: {details}")]
    EmergencyStageFailed { stage: EmergencyStage, details: String },

    #[error("Command queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("{0} is not running")]
    NotRunning(String),
}

impl VigilError {
    pub fn unreachable(device: impl Into<String>, details: impl Into<String>) -> Self {
        VigilError::DeviceUnreachable {
            device: device.into(),
            details: details.into(),
        }
    }

    pub fn fault(device: impl Into<String>, details: impl Into<String>) -> Self {
        VigilError::DeviceFault {
            device: device.into(),
            details: details.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vigil_error_display() {
        let err = VigilError::CommandTimeout {
            command: CommandType::Slew,
            after_secs: 180,
        };
        assert_eq!(err.to_string(), "Command slew timed out after 180s");

        let err = VigilError::unreachable("mount", "connection refused");
        assert!(err.to_string().contains("mount"));

        let err = VigilError::EmergencyStageFailed {
            stage: EmergencyStage::Park,
            details: "park retries exhausted".into(),
        };
        assert!(err.to_string().contains("PARK"));
    }
}
