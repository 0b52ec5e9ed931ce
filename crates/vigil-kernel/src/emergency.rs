//! Emergency stage machine – the pure half of emergency response.
//!
//! Which stage the observatory should be in is a function of the current
//! verdict and the battery level; how the stage changes is a function of
//! where it is now. Neither touches a device: the runtime responder executes
//! the [`StagePlan`] produced here.
//!
//! | Verdict | Target stage |
//! |---|---|
//! | `SAFE`, `WARNING` | `WARNING` |
//! | `PARK_REQUIRED` | `PARK` |
//! | `CLOSE_REQUIRED`, `EMERGENCY` | `CLOSE` |
//!
//! The battery ladder is applied independently and the more severe of the two
//! targets wins.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_types::{EmergencyStage, ThresholdSet, VerdictLevel};

/// Battery percentages at which the stage machine escalates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryLadder {
    pub park_pct: f64,
    pub close_pct: f64,
    pub shutdown_pct: f64,
}

impl Default for BatteryLadder {
    fn default() -> Self {
        Self {
            park_pct: 35.0,
            close_pct: 25.0,
            shutdown_pct: 20.0,
        }
    }
}

impl From<&ThresholdSet> for BatteryLadder {
    fn from(t: &ThresholdSet) -> Self {
        Self {
            park_pct: t.battery_park_pct,
            close_pct: t.battery_close_pct,
            shutdown_pct: t.battery_shutdown_pct,
        }
    }
}

/// Timeouts and retry policy for stage actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyConfig {
    pub park_timeout_secs: u64,
    pub close_timeout_secs: u64,
    pub alert_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Upper bound on executing one whole stage plan.
    pub stage_timeout_secs: u64,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            park_timeout_secs: 60,
            close_timeout_secs: 45,
            alert_timeout_secs: 10,
            max_retries: 3,
            retry_delay_secs: 2,
            stage_timeout_secs: 300,
        }
    }
}

impl EmergencyConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Per-attempt deadline for one action.
    pub fn action_timeout(&self, action: StageAction) -> Duration {
        let secs = match action {
            StageAction::Alert => self.alert_timeout_secs,
            StageAction::StopMount | StageAction::ParkMount | StageAction::VerifyParked => {
                self.park_timeout_secs
            }
            StageAction::CloseEnclosure | StageAction::VerifyClosed | StageAction::CutLoads => {
                self.close_timeout_secs
            }
        };
        Duration::from_secs(secs)
    }
}

/// The stage the observatory should be in for `level` and `battery_pct`.
///
/// A missing battery reading does not contribute; the evaluator already
/// accounts for the failed power sensor.
pub fn target_stage(
    level: VerdictLevel,
    battery_pct: Option<f64>,
    ladder: &BatteryLadder,
) -> EmergencyStage {
    let weather = match level {
        VerdictLevel::Safe | VerdictLevel::Warning => EmergencyStage::Warning,
        VerdictLevel::ParkRequired => EmergencyStage::Park,
        VerdictLevel::CloseRequired | VerdictLevel::Emergency => EmergencyStage::Close,
    };
    let battery = match battery_pct {
        Some(pct) if pct <= ladder.shutdown_pct => EmergencyStage::Shutdown,
        Some(pct) if pct <= ladder.close_pct => EmergencyStage::Close,
        Some(pct) if pct <= ladder.park_pct => EmergencyStage::Park,
        _ => EmergencyStage::Warning,
    };
    weather.max(battery)
}

/// Next stage given the `current` one, the computed `target`, and the verdict.
///
/// The machine only moves forward, except that a `SAFE` verdict returns it to
/// `WARNING`. A `WARNING` verdict with a lower target leaves it where it is.
pub fn transition(
    current: EmergencyStage,
    target: EmergencyStage,
    level: VerdictLevel,
) -> EmergencyStage {
    if target > current {
        target
    } else if level == VerdictLevel::Safe && target == EmergencyStage::Warning {
        EmergencyStage::Warning
    } else {
        current
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Plans
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    Alert,
    StopMount,
    ParkMount,
    VerifyParked,
    CloseEnclosure,
    VerifyClosed,
    CutLoads,
}

impl StageAction {
    /// Actions whose failure does not abort the rest of a rushed plan.
    pub fn best_effort(&self) -> bool {
        matches!(self, StageAction::Alert)
    }
}

/// Ordered actions to run on entry to a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePlan {
    pub stage: EmergencyStage,
    pub actions: Vec<StageAction>,
    /// One bounded park attempt only; closing proceeds whatever the mount does.
    pub rushed: bool,
}

impl StagePlan {
    /// ```
    /// use vigil_kernel::emergency::{StageAction, StagePlan};
    /// use vigil_types::EmergencyStage;
    ///
    /// let plan = StagePlan::for_stage(EmergencyStage::Close, false);
    /// assert_eq!(plan.actions.last(), Some(&StageAction::VerifyClosed));
    /// ```
    pub fn for_stage(stage: EmergencyStage, rushed: bool) -> Self {
        use StageAction::*;
        let actions = match stage {
            EmergencyStage::Warning => vec![Alert],
            EmergencyStage::Park => vec![Alert, StopMount, ParkMount, VerifyParked],
            EmergencyStage::Close if rushed => {
                vec![Alert, StopMount, ParkMount, CloseEnclosure, VerifyClosed]
            }
            EmergencyStage::Close => vec![
                Alert,
                StopMount,
                ParkMount,
                VerifyParked,
                CloseEnclosure,
                VerifyClosed,
            ],
            EmergencyStage::Shutdown => vec![
                Alert,
                StopMount,
                ParkMount,
                CloseEnclosure,
                VerifyClosed,
                CutLoads,
            ],
        };
        Self {
            stage,
            actions,
            rushed: rushed && stage == EmergencyStage::Close,
        }
    }

    /// Whether a failed `action` should stop the plan and escalate.
    ///
    /// In a rushed plan, and during shutdown, the mount is given one chance
    /// and the enclosure is closed regardless of the outcome.
    pub fn is_blocking(&self, action: StageAction) -> bool {
        if action.best_effort() {
            return false;
        }
        let mount_action = matches!(
            action,
            StageAction::StopMount | StageAction::ParkMount | StageAction::VerifyParked
        );
        !(mount_action && (self.rushed || self.stage == EmergencyStage::Shutdown))
    }

    /// Retries allowed for `action` under `config`.
    pub fn attempts_for(&self, action: StageAction, config: &EmergencyConfig) -> u32 {
        if self.rushed && action == StageAction::ParkMount {
            1
        } else {
            config.max_retries.max(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weather_maps_to_stage() {
        let ladder = BatteryLadder::default();
        assert_eq!(target_stage(VerdictLevel::Safe, Some(100.0), &ladder), EmergencyStage::Warning);
        assert_eq!(target_stage(VerdictLevel::ParkRequired, Some(100.0), &ladder), EmergencyStage::Park);
        assert_eq!(target_stage(VerdictLevel::Emergency, None, &ladder), EmergencyStage::Close);
    }

    #[test]
    fn battery_ladder_applies_independently_of_weather() {
        let ladder = BatteryLadder::default();
        let stages: Vec<_> = [50.0, 35.0, 25.0, 20.0]
            .into_iter()
            .map(|pct| target_stage(VerdictLevel::Safe, Some(pct), &ladder))
            .collect();
        assert_eq!(
            stages,
            vec![
                EmergencyStage::Warning,
                EmergencyStage::Park,
                EmergencyStage::Close,
                EmergencyStage::Shutdown,
            ]
        );
    }

    #[test]
    fn more_severe_target_wins() {
        let ladder = BatteryLadder::default();
        assert_eq!(
            target_stage(VerdictLevel::CloseRequired, Some(30.0), &ladder),
            EmergencyStage::Close
        );
    }

    #[test]
    fn stages_only_move_forward() {
        use EmergencyStage::*;
        assert_eq!(transition(Warning, Close, VerdictLevel::Emergency), Close);
        assert_eq!(transition(Close, Park, VerdictLevel::ParkRequired), Close);
        assert_eq!(transition(Close, Warning, VerdictLevel::Warning), Close);
        assert_eq!(transition(Close, Warning, VerdictLevel::Safe), Warning);
    }

    #[test]
    fn safe_verdict_does_not_reset_while_battery_holds_stage() {
        use EmergencyStage::*;
        assert_eq!(transition(Park, Park, VerdictLevel::Safe), Park);
    }

    #[test]
    fn rushed_close_tolerates_park_failure() {
        let plan = StagePlan::for_stage(EmergencyStage::Close, true);
        assert!(plan.rushed);
        assert!(!plan.actions.contains(&StageAction::VerifyParked));
        assert!(!plan.is_blocking(StageAction::ParkMount));
        assert!(plan.is_blocking(StageAction::CloseEnclosure));
        assert_eq!(plan.attempts_for(StageAction::ParkMount, &EmergencyConfig::default()), 1);
    }

    #[test]
    fn normal_close_parks_before_closing() {
        let plan = StagePlan::for_stage(EmergencyStage::Close, false);
        let park = plan.actions.iter().position(|a| *a == StageAction::VerifyParked);
        let close = plan.actions.iter().position(|a| *a == StageAction::CloseEnclosure);
        assert!(park < close);
        assert!(plan.is_blocking(StageAction::ParkMount));
    }

    #[test]
    fn rushed_flag_only_applies_to_close() {
        assert!(!StagePlan::for_stage(EmergencyStage::Park, true).rushed);
    }

    #[test]
    fn shutdown_cuts_loads_last() {
        let plan = StagePlan::for_stage(EmergencyStage::Shutdown, false);
        assert_eq!(plan.actions.last(), Some(&StageAction::CutLoads));
    }
}
