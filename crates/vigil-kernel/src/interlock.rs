//! [`Interlock`] – command veto rule engine.
//!
//! Every command passes through [`Interlock::check`] immediately before it is
//! dispatched to a device. The check runs in three tiers:
//!
//! 1. Safety-reducing commands (park, stop, emergency stop, emergency close,
//!    roof close) are always allowed. Nothing may prevent the observatory from
//!    becoming safer.
//! 2. Commands that expose the telescope (slew, unpark, roof open) are
//!    refused while the verdict is `CLOSE_REQUIRED` or worse, or while the
//!    mount state is unknown. This floor holds whatever rules are registered.
//! 3. Command types listed in the confirmation set must carry
//!    `confirmed = true`.
//! 4. Every registered [`Rule`] is evaluated in order; the first veto wins.
//!
//! Unknown device state is treated as the unsafe value.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use chrono::Utc;
//! use vigil_kernel::interlock::Interlock;
//! use vigil_types::{CommandKind, CommandRequest, DeviceStates, SafetyVerdict, ThresholdSet};
//!
//! let interlock = Interlock::standard(&ThresholdSet::default());
//! let verdict = Arc::new(SafetyVerdict::from_reasons(vec![], Utc::now()));
//!
//! // Mount park state unknown: the roof stays shut.
//! let open = CommandRequest::interactive(CommandKind::RoofOpen).confirmed();
//! assert!(!interlock.check(&open, &verdict, &DeviceStates::default()).is_allowed());
//!
//! // Parking is always allowed.
//! let park = CommandRequest::interactive(CommandKind::Park);
//! assert!(interlock.check(&park, &verdict, &DeviceStates::default()).is_allowed());
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;
use vigil_types::{
    CommandKind, CommandRequest, CommandType, DeviceStates, EnclosureState, SafetyVerdict,
    ThresholdSet, VerdictLevel, Veto, VetoResult,
};

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// What a rule sees besides the command itself.
pub struct InterlockContext<'a> {
    pub verdict: &'a SafetyVerdict,
    pub devices: &'a DeviceStates,
}

/// A single precondition a command must satisfy.
pub trait Rule: Send + Sync {
    /// Identifier carried in the [`Veto`] and in logs.
    fn name(&self) -> &str;

    /// `Err(reason)` vetoes the command. Reasons are read aloud to the
    /// operator, so phrase them as a sentence.
    fn check(&self, command: &CommandRequest, ctx: &InterlockContext<'_>) -> Result<(), String>;
}

// ────────────────────────────────────────────────────────────────────────────
// Interlock
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Interlock {
    rules: Vec<Box<dyn Rule>>,
    confirmation_required: BTreeSet<CommandType>,
}

impl Interlock {
    /// An interlock with no rules and no confirmation requirements.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in rule set with roof open and unpark requiring confirmation.
    pub fn standard(thresholds: &ThresholdSet) -> Self {
        let mut interlock = Self::new();
        interlock.require_confirmation(CommandType::RoofOpen);
        interlock.require_confirmation(CommandType::Unpark);
        interlock.add_rule(Box::new(SlewRule {
            min_altitude_deg: thresholds.min_altitude_deg,
            horizon_buffer_deg: thresholds.horizon_buffer_deg,
            meridian_zone_deg: thresholds.meridian_zone_deg,
        }));
        interlock.add_rule(Box::new(UnparkRule));
        interlock.add_rule(Box::new(RoofOpenRule));
        interlock.add_rule(Box::new(CaptureRule));
        interlock
    }

    /// Register a new [`Rule`]. Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn require_confirmation(&mut self, command: CommandType) {
        self.confirmation_required.insert(command);
    }

    pub fn check(
        &self,
        command: &CommandRequest,
        verdict: &Arc<SafetyVerdict>,
        devices: &DeviceStates,
    ) -> VetoResult {
        let command_type = command.command_type();
        if command_type.is_safety_reducing() {
            return VetoResult::Allowed;
        }

        let veto = |rule: &str, reason: String| {
            info!(command = %command_type, id = %command.id, rule, %reason, "command vetoed");
            VetoResult::Vetoed(Veto {
                rule: rule.to_string(),
                reason,
                verdict: verdict.clone(),
            })
        };

        if exposes_telescope(command_type) {
            if verdict.level() >= VerdictLevel::CloseRequired {
                return veto(
                    FLOOR_RULE,
                    format!(
                        "{} isn't allowed, {}.",
                        spoken(command_type),
                        conditions(verdict)
                    ),
                );
            }
            if devices.mount.is_none() {
                return veto(
                    FLOOR_RULE,
                    format!(
                        "I can't confirm the mount state, so {} isn't allowed.",
                        spoken(command_type).to_lowercase()
                    ),
                );
            }
        }

        if self.confirmation_required.contains(&command_type) && !command.confirmed {
            return veto(
                CONFIRMATION_RULE,
                format!(
                    "{} needs confirmation. Say it again with confirmation to proceed.",
                    spoken(command_type)
                ),
            );
        }

        let ctx = InterlockContext {
            verdict: verdict.as_ref(),
            devices,
        };
        for rule in &self.rules {
            if let Err(reason) = rule.check(command, &ctx) {
                return veto(rule.name(), reason);
            }
        }
        VetoResult::Allowed
    }
}

const FLOOR_RULE: &str = "exposure_floor";
const CONFIRMATION_RULE: &str = "confirmation";

fn exposes_telescope(command: CommandType) -> bool {
    matches!(
        command,
        CommandType::Slew | CommandType::Unpark | CommandType::RoofOpen
    )
}

fn spoken(command: CommandType) -> &'static str {
    match command {
        CommandType::Slew => "Slewing",
        CommandType::Park => "Parking",
        CommandType::Unpark => "Unparking the mount",
        CommandType::RoofOpen => "Opening the roof",
        CommandType::RoofClose => "Closing the roof",
        CommandType::Stop => "Stopping",
        CommandType::EmergencyStop => "An emergency stop",
        CommandType::EmergencyClose => "An emergency close",
        CommandType::Capture => "Starting an exposure",
    }
}

fn conditions(verdict: &SafetyVerdict) -> String {
    format!(
        "conditions are {}: {}",
        verdict.level().to_string().to_lowercase().replace('_', " "),
        verdict.summary()
    )
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Slews need tolerable conditions, an unparked mount, a target above the
/// horizon buffer and outside the meridian flip zone.
pub struct SlewRule {
    pub min_altitude_deg: f64,
    pub horizon_buffer_deg: f64,
    pub meridian_zone_deg: f64,
}

impl Rule for SlewRule {
    fn name(&self) -> &str {
        "slew"
    }

    fn check(&self, command: &CommandRequest, ctx: &InterlockContext<'_>) -> Result<(), String> {
        let CommandKind::Slew(target) = &command.kind else {
            return Ok(());
        };
        if ctx.verdict.level() > VerdictLevel::Warning {
            return Err(format!("I can't slew, {}.", conditions(ctx.verdict)));
        }
        match ctx.devices.mount_parked() {
            Some(false) => {}
            Some(true) => return Err("The mount is parked. Unpark it before slewing.".into()),
            None => return Err("I can't confirm the mount state, so I won't slew.".into()),
        }
        let floor = self.min_altitude_deg + self.horizon_buffer_deg;
        if target.altitude_deg.is_nan() || target.altitude_deg < floor {
            return Err(format!(
                "That target is at {:.1} degrees altitude, below the {floor:.1} degree limit.",
                target.altitude_deg
            ));
        }
        if target.hour_angle_deg.is_nan() || target.hour_angle_deg.abs() <= self.meridian_zone_deg {
            return Err(format!(
                "That target is within {:.1} degrees of the meridian. Wait for it to cross.",
                self.meridian_zone_deg
            ));
        }
        Ok(())
    }
}

/// Unparking needs a safe verdict and a fully open enclosure.
pub struct UnparkRule;

impl Rule for UnparkRule {
    fn name(&self) -> &str {
        "unpark"
    }

    fn check(&self, command: &CommandRequest, ctx: &InterlockContext<'_>) -> Result<(), String> {
        if command.command_type() != CommandType::Unpark {
            return Ok(());
        }
        if !ctx.verdict.is_safe() {
            return Err(format!("I can't unpark, {}.", conditions(ctx.verdict)));
        }
        if ctx.devices.enclosure != EnclosureState::Open {
            return Err("The roof isn't open. Open it before unparking.".into());
        }
        Ok(())
    }
}

/// The roof opens only over a parked mount under a safe verdict.
pub struct RoofOpenRule;

impl Rule for RoofOpenRule {
    fn name(&self) -> &str {
        "roof_open"
    }

    fn check(&self, command: &CommandRequest, ctx: &InterlockContext<'_>) -> Result<(), String> {
        if command.command_type() != CommandType::RoofOpen {
            return Ok(());
        }
        match ctx.devices.mount_parked() {
            Some(true) => {}
            Some(false) => {
                return Err("The mount isn't parked. Park it before opening the roof.".into());
            }
            None => {
                return Err("I can't confirm the mount is parked, so the roof stays closed.".into());
            }
        }
        if !ctx.verdict.is_safe() {
            return Err(format!("I can't open the roof, {}.", conditions(ctx.verdict)));
        }
        Ok(())
    }
}

/// Exposures are allowed in anything short of an emergency.
pub struct CaptureRule;

impl Rule for CaptureRule {
    fn name(&self) -> &str {
        "capture"
    }

    fn check(&self, command: &CommandRequest, ctx: &InterlockContext<'_>) -> Result<(), String> {
        if command.command_type() == CommandType::Capture
            && ctx.verdict.level() >= VerdictLevel::Emergency
        {
            return Err(format!("I can't start an exposure, {}.", conditions(ctx.verdict)));
        }
        Ok(())
    }
}
