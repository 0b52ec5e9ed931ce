//! Operator and scheduler commands, their veto results and outcomes.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::ReconciledState;
use crate::verdict::SafetyVerdict;

/// Right ascension / declination pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquatorialCoords {
    pub ra_hours: f64,
    pub dec_deg: f64,
}

/// A slew destination. Altitude and hour angle are supplied by the caller's
/// ephemeris so the interlock can check horizon and meridian limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlewTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub coords: EquatorialCoords,
    pub altitude_deg: f64,
    pub hour_angle_deg: f64,
}

/// What a command asks the observatory to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum CommandKind {
    Slew(SlewTarget),
    Park,
    Unpark,
    RoofOpen,
    RoofClose,
    Stop,
    EmergencyStop,
    EmergencyClose,
    Capture { exposure_secs: f64 },
}

/// Payload-free discriminant of [`CommandKind`], used in configuration and
/// events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Slew,
    Park,
    Unpark,
    RoofOpen,
    RoofClose,
    Stop,
    EmergencyStop,
    EmergencyClose,
    Capture,
}

impl CommandType {
    /// Commands that only ever reduce risk. The interlock never blocks these.
    pub fn is_safety_reducing(&self) -> bool {
        matches!(
            self,
            CommandType::Park
                | CommandType::Stop
                | CommandType::EmergencyStop
                | CommandType::EmergencyClose
                | CommandType::RoofClose
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Slew => "slew",
            CommandType::Park => "park",
            CommandType::Unpark => "unpark",
            CommandType::RoofOpen => "roof_open",
            CommandType::RoofClose => "roof_close",
            CommandType::Stop => "stop",
            CommandType::EmergencyStop => "emergency_stop",
            CommandType::EmergencyClose => "emergency_close",
            CommandType::Capture => "capture",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical device a command is serialized against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Mount,
    Enclosure,
    Camera,
}

impl CommandKind {
    pub fn command_type(&self) -> CommandType {
        match self {
            CommandKind::Slew(_) => CommandType::Slew,
            CommandKind::Park => CommandType::Park,
            CommandKind::Unpark => CommandType::Unpark,
            CommandKind::RoofOpen => CommandType::RoofOpen,
            CommandKind::RoofClose => CommandType::RoofClose,
            CommandKind::Stop => CommandType::Stop,
            CommandKind::EmergencyStop => CommandType::EmergencyStop,
            CommandKind::EmergencyClose => CommandType::EmergencyClose,
            CommandKind::Capture { .. } => CommandType::Capture,
        }
    }

    pub fn device(&self) -> Device {
        match self {
            CommandKind::Slew(_)
            | CommandKind::Park
            | CommandKind::Unpark
            | CommandKind::Stop
            | CommandKind::EmergencyStop => Device::Mount,
            CommandKind::RoofOpen | CommandKind::RoofClose | CommandKind::EmergencyClose => {
                Device::Enclosure
            }
            CommandKind::Capture { .. } => Device::Camera,
        }
    }

    /// Whether cancelling the command must stop physical motion.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            CommandKind::Slew(_)
                | CommandKind::Park
                | CommandKind::Unpark
                | CommandKind::RoofOpen
                | CommandKind::RoofClose
        )
    }
}

/// Scheduling priority. Emergency commands bypass the queue entirely.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Scheduled and background work.
    #[default]
    Background,
    /// Operator-initiated.
    Interactive,
    Emergency,
}

/// A request to act on the observatory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: Uuid,
    pub kind: CommandKind,
    pub priority: Priority,
    pub requested_at: DateTime<Utc>,
    /// Set when the operator has explicitly confirmed a command that requires
    /// confirmation.
    pub confirmed: bool,
    /// Who asked, e.g. `"repl"` or `"scheduler"`.
    pub origin: String,
}

impl CommandRequest {
    pub fn new(kind: CommandKind, priority: Priority, origin: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            priority,
            requested_at: Utc::now(),
            confirmed: false,
            origin: origin.into(),
        }
    }

    pub fn interactive(kind: CommandKind) -> Self {
        Self::new(kind, Priority::Interactive, "operator")
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }

    pub fn command_type(&self) -> CommandType {
        self.kind.command_type()
    }

    pub fn device(&self) -> Device {
        self.kind.device()
    }
}

/// A refusal from the interlock, carrying the verdict it was judged against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Veto {
    /// Name of the check that refused the command, e.g. `"roof_open"`.
    pub rule: String,
    /// Spoken-style explanation.
    pub reason: String,
    pub verdict: Arc<SafetyVerdict>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum VetoResult {
    Allowed,
    Vetoed(Veto),
}

impl VetoResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, VetoResult::Allowed)
    }

    pub fn veto(&self) -> Option<&Veto> {
        match self {
            VetoResult::Allowed => None,
            VetoResult::Vetoed(v) => Some(v),
        }
    }
}

/// Terminal state of a submitted command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommandOutcome {
    Completed,
    Vetoed { reason: String },
    /// Stopped on request; the device confirmed it is no longer moving.
    Cancelled,
    /// Exceeded its deadline. `state` is what the targeted device reported
    /// after it was stopped, when it could be read.
    TimedOut {
        after_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<ReconciledState>,
    },
    Failed { error: String },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_reducing_commands() {
        assert!(CommandType::Park.is_safety_reducing());
        assert!(CommandType::RoofClose.is_safety_reducing());
        assert!(CommandType::EmergencyStop.is_safety_reducing());
        assert!(!CommandType::RoofOpen.is_safety_reducing());
        assert!(!CommandType::Slew.is_safety_reducing());
        assert!(!CommandType::Unpark.is_safety_reducing());
    }

    #[test]
    fn commands_map_to_devices() {
        assert_eq!(CommandKind::RoofOpen.device(), Device::Enclosure);
        assert_eq!(CommandKind::Unpark.device(), Device::Mount);
        assert_eq!(
            CommandKind::Capture { exposure_secs: 30.0 }.device(),
            Device::Camera
        );
    }

    #[test]
    fn priorities_are_ordered() {
        assert!(Priority::Emergency > Priority::Interactive);
        assert!(Priority::Interactive > Priority::Background);
    }

    #[test]
    fn command_kind_json_is_tagged() -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(&CommandKind::Capture { exposure_secs: 5.0 })?;
        assert!(json.contains("\"action\":\"capture\""));
        let back: CommandKind = serde_json::from_str(&json)?;
        assert_eq!(back.command_type(), CommandType::Capture);
        Ok(())
    }

    #[test]
    fn confirmed_builder_sets_flag() {
        let cmd = CommandRequest::interactive(CommandKind::RoofOpen).confirmed();
        assert!(cmd.confirmed);
        assert_eq!(cmd.priority, Priority::Interactive);
    }
}
