//! Safety verdicts, thresholds and the hysteresis memory the evaluator keeps
//! between cycles.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VigilError;
use crate::sensor::Metric;

// ────────────────────────────────────────────────────────────────────────────
// Verdict
// ────────────────────────────────────────────────────────────────────────────

/// Ordered severity of a [`SafetyVerdict`]. `Safe` is the least severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictLevel {
    #[default]
    Safe,
    Warning,
    ParkRequired,
    CloseRequired,
    Emergency,
}

impl fmt::Display for VerdictLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictLevel::Safe => "SAFE",
            VerdictLevel::Warning => "WARNING",
            VerdictLevel::ParkRequired => "PARK_REQUIRED",
            VerdictLevel::CloseRequired => "CLOSE_REQUIRED",
            VerdictLevel::Emergency => "EMERGENCY",
        };
        f.write_str(s)
    }
}

/// What caused a [`VerdictReason`]. Threshold triggers double as latch keys in
/// [`HysteresisState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    WindPark,
    WindClose,
    Gust,
    Humidity,
    Cold,
    Cloud,
    Daylight,
    BatteryWarn,
    BatteryPark,
    BatteryClose,
    BatteryShutdown,
    Rain,
    RainHoldoff,
    /// A reading is missing, too old, or comes from a failed service.
    SensorFailure,
    /// Held at WARNING after a severe verdict until the recovery window passes.
    Recovering,
    /// No evaluation has completed yet.
    AwaitingData,
}

/// One contributing cause of a verdict: `(reason, measured, threshold)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictReason {
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<Metric>,
    pub level: VerdictLevel,
    pub message: String,
    pub measured: f64,
    pub threshold: f64,
}

/// The evaluator's judgement of a single snapshot. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    level: VerdictLevel,
    reasons: Vec<VerdictReason>,
    evaluated_at: DateTime<Utc>,
}

impl SafetyVerdict {
    /// Build a verdict whose level is the most severe level among `reasons`,
    /// or [`VerdictLevel::Safe`] when there are none.
    pub fn from_reasons(reasons: Vec<VerdictReason>, evaluated_at: DateTime<Utc>) -> Self {
        let level = reasons
            .iter()
            .map(|r| r.level)
            .max()
            .unwrap_or(VerdictLevel::Safe);
        Self {
            level,
            reasons,
            evaluated_at,
        }
    }

    /// Conservative placeholder used before the first evaluation completes.
    pub fn awaiting_data(at: DateTime<Utc>) -> Self {
        Self::from_reasons(
            vec![VerdictReason {
                trigger: Trigger::AwaitingData,
                metric: None,
                level: VerdictLevel::ParkRequired,
                message: "no conditions evaluated yet".to_string(),
                measured: 0.0,
                threshold: 0.0,
            }],
            at,
        )
    }

    pub fn level(&self) -> VerdictLevel {
        self.level
    }

    pub fn reasons(&self) -> &[VerdictReason] {
        &self.reasons
    }

    pub fn evaluated_at(&self) -> DateTime<Utc> {
        self.evaluated_at
    }

    pub fn is_safe(&self) -> bool {
        self.level == VerdictLevel::Safe
    }

    pub fn has_trigger(&self, trigger: Trigger) -> bool {
        self.reasons.iter().any(|r| r.trigger == trigger)
    }

    /// One-line human summary of the contributing reasons.
    pub fn summary(&self) -> String {
        if self.reasons.is_empty() {
            return "all conditions nominal".to_string();
        }
        self.reasons
            .iter()
            .map(|r| r.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Thresholds
// ────────────────────────────────────────────────────────────────────────────

/// Site limits. Loaded once from configuration and read-only afterwards.
///
/// Margins are hysteresis widths: a latched high-side trigger releases at
/// `trigger - margin`, a latched low-side trigger at `trigger + margin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSet {
    pub wind_park_mph: f64,
    pub wind_close_mph: f64,
    pub gust_park_mph: f64,
    pub wind_margin_mph: f64,

    pub humidity_max_pct: f64,
    pub humidity_margin_pct: f64,

    pub temp_min_f: f64,
    pub temp_margin_f: f64,

    /// Sky-ambient delta above which the sky counts as cloudy.
    pub cloudy_sky_delta_c: f64,
    pub cloud_margin_c: f64,

    /// Solar altitude above which it is too bright to observe.
    pub twilight_sun_alt_deg: f64,
    pub twilight_margin_deg: f64,

    pub rain_holdoff_min: u64,
    pub sensor_timeout_secs: u64,

    pub battery_warn_pct: f64,
    pub battery_park_pct: f64,
    pub battery_close_pct: f64,
    pub battery_shutdown_pct: f64,
    pub battery_margin_pct: f64,

    pub min_altitude_deg: f64,
    pub horizon_buffer_deg: f64,
    /// Hour-angle half width around the meridian where slews are refused.
    pub meridian_zone_deg: f64,

    /// How long a verdict must stay at or below WARNING after a
    /// CLOSE_REQUIRED or EMERGENCY before it may report SAFE.
    pub recovery_hold_secs: u64,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            wind_park_mph: 25.0,
            wind_close_mph: 35.0,
            gust_park_mph: 35.0,
            wind_margin_mph: 5.0,
            humidity_max_pct: 85.0,
            humidity_margin_pct: 5.0,
            temp_min_f: 20.0,
            temp_margin_f: 5.0,
            cloudy_sky_delta_c: -15.0,
            cloud_margin_c: 3.0,
            twilight_sun_alt_deg: -12.0,
            twilight_margin_deg: 2.0,
            rain_holdoff_min: 30,
            sensor_timeout_secs: 120,
            battery_warn_pct: 50.0,
            battery_park_pct: 35.0,
            battery_close_pct: 25.0,
            battery_shutdown_pct: 20.0,
            battery_margin_pct: 5.0,
            min_altitude_deg: 10.0,
            horizon_buffer_deg: 2.0,
            meridian_zone_deg: 5.0,
            recovery_hold_secs: 300,
        }
    }
}

impl ThresholdSet {
    /// Reject threshold sets whose limits are out of order or whose margins
    /// are negative.
    pub fn validate(&self) -> Result<(), VigilError> {
        let margins = [
            ("wind_margin_mph", self.wind_margin_mph),
            ("humidity_margin_pct", self.humidity_margin_pct),
            ("temp_margin_f", self.temp_margin_f),
            ("cloud_margin_c", self.cloud_margin_c),
            ("twilight_margin_deg", self.twilight_margin_deg),
            ("battery_margin_pct", self.battery_margin_pct),
            ("horizon_buffer_deg", self.horizon_buffer_deg),
            ("meridian_zone_deg", self.meridian_zone_deg),
        ];
        if let Some((name, _)) = margins.iter().find(|(_, v)| *v < 0.0 || v.is_nan()) {
            return Err(VigilError::Config(format!("{name} must be non-negative")));
        }
        if self.wind_park_mph >= self.wind_close_mph {
            return Err(VigilError::Config(format!(
                "wind_park_mph ({}) must be below wind_close_mph ({})",
                self.wind_park_mph, self.wind_close_mph
            )));
        }
        let ladder = [
            self.battery_warn_pct,
            self.battery_park_pct,
            self.battery_close_pct,
            self.battery_shutdown_pct,
        ];
        if ladder.windows(2).any(|w| w[0] <= w[1]) {
            return Err(VigilError::Config(
                "battery thresholds must strictly decrease: warn > park > close > shutdown"
                    .to_string(),
            ));
        }
        if self.sensor_timeout_secs == 0 {
            return Err(VigilError::Config(
                "sensor_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Hysteresis memory
// ────────────────────────────────────────────────────────────────────────────

/// Latched state of one threshold trigger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Latch {
    pub triggered: bool,
    /// When the latch last changed state.
    pub since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RainTracker {
    pub raining: bool,
    /// When the most recent rain episode ended; starts the holdoff.
    pub cleared_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryTracker {
    /// A CLOSE_REQUIRED or EMERGENCY verdict has not yet been recovered from.
    pub pending: bool,
    /// Start of the current uninterrupted stretch at or below WARNING.
    pub calm_since: Option<DateTime<Utc>>,
}

/// Everything the evaluator remembers between cycles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HysteresisState {
    pub latches: BTreeMap<Trigger, Latch>,
    pub rain: RainTracker,
    pub recovery: RecoveryTracker,
}

impl HysteresisState {
    pub fn is_latched(&self, trigger: Trigger) -> bool {
        self.latches.get(&trigger).is_some_and(|l| l.triggered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(trigger: Trigger, level: VerdictLevel) -> VerdictReason {
        VerdictReason {
            trigger,
            metric: None,
            level,
            message: format!("{trigger:?}"),
            measured: 0.0,
            threshold: 0.0,
        }
    }

    #[test]
    fn verdict_levels_are_ordered_by_severity() {
        assert!(VerdictLevel::Safe < VerdictLevel::Warning);
        assert!(VerdictLevel::Warning < VerdictLevel::ParkRequired);
        assert!(VerdictLevel::ParkRequired < VerdictLevel::CloseRequired);
        assert!(VerdictLevel::CloseRequired < VerdictLevel::Emergency);
    }

    #[test]
    fn verdict_takes_most_severe_reason() {
        let verdict = SafetyVerdict::from_reasons(
            vec![
                reason(Trigger::Cold, VerdictLevel::Warning),
                reason(Trigger::WindPark, VerdictLevel::ParkRequired),
            ],
            Utc::now(),
        );
        assert_eq!(verdict.level(), VerdictLevel::ParkRequired);
        assert!(verdict.has_trigger(Trigger::Cold));
    }

    #[test]
    fn empty_verdict_is_safe() {
        let verdict = SafetyVerdict::from_reasons(vec![], Utc::now());
        assert!(verdict.is_safe());
        assert_eq!(verdict.summary(), "all conditions nominal");
    }

    #[test]
    fn awaiting_data_is_not_safe() {
        let verdict = SafetyVerdict::awaiting_data(Utc::now());
        assert_eq!(verdict.level(), VerdictLevel::ParkRequired);
    }

    #[test]
    fn default_thresholds_validate() {
        assert!(ThresholdSet::default().validate().is_ok());
    }

    #[test]
    fn inverted_battery_ladder_is_rejected() {
        let thresholds = ThresholdSet {
            battery_park_pct: 60.0,
            ..ThresholdSet::default()
        };
        assert!(matches!(thresholds.validate(), Err(VigilError::Config(_))));
    }

    #[test]
    fn negative_margin_is_rejected() {
        let thresholds = ThresholdSet {
            wind_margin_mph: -1.0,
            ..ThresholdSet::default()
        };
        assert!(thresholds.validate().is_err());
    }

    #[test]
    fn hysteresis_state_survives_json() -> Result<(), Box<dyn std::error::Error>> {
        let mut state = HysteresisState::default();
        state.latches.insert(
            Trigger::WindPark,
            Latch {
                triggered: true,
                since: Some(Utc::now()),
            },
        );
        let json = serde_json::to_string(&state)?;
        let back: HysteresisState = serde_json::from_str(&json)?;
        assert!(back.is_latched(Trigger::WindPark));
        assert!(!back.is_latched(Trigger::Gust));
        Ok(())
    }
}
