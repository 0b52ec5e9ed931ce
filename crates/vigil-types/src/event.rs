//! Bus events and the emergency / alert vocabulary they carry.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::{CommandOutcome, CommandRequest, CommandType, Veto};
use crate::device::{ServiceKind, ServiceState};
use crate::verdict::{SafetyVerdict, VerdictLevel};

/// Stages of the emergency-response machine. `Warning` is the resting stage.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyStage {
    #[default]
    Warning,
    Park,
    Close,
    Shutdown,
}

impl EmergencyStage {
    /// The stage to escalate to when this one cannot complete.
    pub fn next(&self) -> Option<EmergencyStage> {
        match self {
            EmergencyStage::Warning => Some(EmergencyStage::Park),
            EmergencyStage::Park => Some(EmergencyStage::Close),
            EmergencyStage::Close => Some(EmergencyStage::Shutdown),
            EmergencyStage::Shutdown => None,
        }
    }
}

impl fmt::Display for EmergencyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EmergencyStage::Warning => "WARNING",
            EmergencyStage::Park => "PARK",
            EmergencyStage::Close => "CLOSE",
            EmergencyStage::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    #[default]
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertSeverity {
    /// One step up, saturating at `Emergency`.
    pub fn escalate(&self) -> AlertSeverity {
        match self {
            AlertSeverity::Info => AlertSeverity::Warning,
            AlertSeverity::Warning => AlertSeverity::Critical,
            AlertSeverity::Critical | AlertSeverity::Emergency => AlertSeverity::Emergency,
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Critical => "CRITICAL",
            AlertSeverity::Emergency => "EMERGENCY",
        };
        f.write_str(s)
    }
}

/// Unified event wrapper for the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"vigil-runtime::monitor"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    VerdictChanged {
        previous: VerdictLevel,
        verdict: Arc<SafetyVerdict>,
    },
    CommandVetoed {
        command: CommandRequest,
        veto: Veto,
    },
    CommandFinished {
        command_id: Uuid,
        command: CommandType,
        outcome: CommandOutcome,
    },
    EmergencyStageChanged {
        from: EmergencyStage,
        to: EmergencyStage,
        reason: String,
    },
    EmergencyStageFailed {
        stage: EmergencyStage,
        details: String,
    },
    ServiceHealthChanged {
        service: ServiceKind,
        state: ServiceState,
        attempts: u32,
    },
    Alert {
        severity: AlertSeverity,
        message: String,
    },
    SessionStarted {
        session_id: String,
    },
    SessionEnded {
        session_id: String,
        parked: bool,
        closed: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_escalate_in_order() {
        assert_eq!(EmergencyStage::Warning.next(), Some(EmergencyStage::Park));
        assert_eq!(EmergencyStage::Close.next(), Some(EmergencyStage::Shutdown));
        assert_eq!(EmergencyStage::Shutdown.next(), None);
        assert!(EmergencyStage::Park < EmergencyStage::Close);
    }

    #[test]
    fn alert_escalation_saturates() {
        assert_eq!(AlertSeverity::Info.escalate(), AlertSeverity::Warning);
        assert_eq!(AlertSeverity::Warning.escalate(), AlertSeverity::Critical);
        assert_eq!(AlertSeverity::Critical.escalate(), AlertSeverity::Emergency);
        assert_eq!(AlertSeverity::Emergency.escalate(), AlertSeverity::Emergency);
    }

    #[test]
    fn event_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let event = Event::new(
            "vigil-runtime::responder",
            EventPayload::EmergencyStageChanged {
                from: EmergencyStage::Warning,
                to: EmergencyStage::Park,
                reason: "wind 27 mph".into(),
            },
        );
        let json = serde_json::to_string(&event)?;
        let back: Event = serde_json::from_str(&json)?;
        assert_eq!(back.id, event.id);
        assert!(matches!(
            back.payload,
            EventPayload::EmergencyStageChanged {
                to: EmergencyStage::Park,
                ..
            }
        ));
        Ok(())
    }
}
