//! Device state as reported by collaborators, and service identities.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::EquatorialCoords;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Parked,
    Parking,
    Tracking,
    Slewing,
    Stopped,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountState {
    pub status: MountStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<EquatorialCoords>,
}

impl MountState {
    pub fn is_parked(&self) -> bool {
        self.status == MountStatus::Parked
    }

    /// True when the mount is not moving under its own power.
    pub fn is_at_rest(&self) -> bool {
        matches!(
            self.status,
            MountStatus::Parked | MountStatus::Stopped | MountStatus::Tracking
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnclosureState {
    Open,
    Closed,
    Opening,
    Closing,
    Stopped,
    #[default]
    Unknown,
}

impl EnclosureState {
    pub fn is_moving(&self) -> bool {
        matches!(self, EnclosureState::Opening | EnclosureState::Closing)
    }
}

/// Device facts the interlock judges commands against. Fields are `None` or
/// `Unknown` when the device could not be queried.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceStates {
    pub mount: Option<MountState>,
    pub enclosure: EnclosureState,
}

impl DeviceStates {
    /// `Some(true)` only when the mount positively reported parked.
    pub fn mount_parked(&self) -> Option<bool> {
        self.mount.as_ref().map(MountState::is_parked)
    }
}

/// State a device reported after a command against it was stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "device", rename_all = "snake_case")]
pub enum ReconciledState {
    Mount { state: MountState },
    Enclosure { state: EnclosureState },
    /// Cameras expose no motion state; only whether they still answer.
    Camera { reachable: bool },
}

/// Logical services supervised by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Mount,
    Weather,
    Camera,
    Enclosure,
    Power,
    Ephemeris,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 6] = [
        ServiceKind::Mount,
        ServiceKind::Weather,
        ServiceKind::Camera,
        ServiceKind::Enclosure,
        ServiceKind::Power,
        ServiceKind::Ephemeris,
    ];

    /// Source label readings from this service carry.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Mount => "mount",
            ServiceKind::Weather => "weather",
            ServiceKind::Camera => "camera",
            ServiceKind::Enclosure => "enclosure",
            ServiceKind::Power => "power",
            ServiceKind::Ephemeris => "ephemeris",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Healthy,
    Degraded,
    Failed,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Healthy => "healthy",
            ServiceState::Degraded => "degraded",
            ServiceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_mount_is_not_parked() {
        assert_eq!(DeviceStates::default().mount_parked(), None);
    }

    #[test]
    fn parked_mount_reports_parked() {
        let states = DeviceStates {
            mount: Some(MountState {
                status: MountStatus::Parked,
                position: None,
            }),
            enclosure: EnclosureState::Closed,
        };
        assert_eq!(states.mount_parked(), Some(true));
    }

    #[test]
    fn slewing_mount_is_not_at_rest() {
        let state = MountState {
            status: MountStatus::Slewing,
            position: None,
        };
        assert!(!state.is_at_rest());
    }
}
