//! Condition evaluator – turns a [`SensorSnapshot`] into a [`SafetyVerdict`].
//!
//! [`evaluate`] is a pure function: it never reads a clock (the snapshot's
//! `taken_at` is "now") and never mutates its inputs. The caller owns the
//! [`HysteresisState`] and replaces it with the one returned.
//!
//! # Latches
//!
//! Every numeric limit is a latch with a release margin, so a value hovering
//! on the limit cannot flap the verdict:
//!
//! | Side | Triggers when | Releases when |
//! |---|---|---|
//! | High (wind, gust, humidity, cloud, sun) | `value > limit` | `value <= limit - margin` |
//! | Low (cold, battery) | `value < limit` | `value >= limit + margin` |
//!
//! | Trigger | Level |
//! |---|---|
//! | wind park, gust, daylight, battery park | `PARK_REQUIRED` |
//! | wind close, humidity, battery close, battery shutdown | `CLOSE_REQUIRED` |
//! | cold, cloud, battery warn | `WARNING` |
//! | rain | `EMERGENCY` |
//!
//! # Sensor failure
//!
//! A reading that is missing, older than `sensor_timeout_secs`, or produced
//! by a service the watchdog declared failed counts as failed. Failed wind,
//! gust, rain or sun readings force at least `PARK_REQUIRED`; any other failed
//! reading forces at least `WARNING`. Latches on a failed metric keep their
//! previous state.
//!
//! # Recovery hold
//!
//! Once the verdict reaches `CLOSE_REQUIRED` or worse, it cannot fall below
//! `WARNING` until conditions have stayed at `WARNING` or better for
//! `recovery_hold_secs`.
//!
//! # Example
//!
//! ```
//! use chrono::Utc;
//! use vigil_kernel::evaluator::evaluate;
//! use vigil_types::{HysteresisState, Metric, SensorSnapshot, ThresholdSet, VerdictLevel};
//!
//! let now = Utc::now();
//! let snapshot = SensorSnapshot::builder(now)
//!     .reading(Metric::WindSpeed, 30.0, now, "weather")
//!     .build();
//!
//! let (verdict, state) = evaluate(&snapshot, &ThresholdSet::default(), &HysteresisState::default());
//! assert!(verdict.level() >= VerdictLevel::ParkRequired);
//! assert!(state.is_latched(vigil_types::Trigger::WindPark));
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vigil_types::{
    HysteresisState, Latch, Metric, SafetyVerdict, SensorSnapshot, ThresholdSet, Trigger,
    VerdictLevel, VerdictReason,
};

// ────────────────────────────────────────────────────────────────────────────
// Latch table
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    High,
    Low,
}

struct LatchRule {
    trigger: Trigger,
    metric: Metric,
    side: Side,
    level: VerdictLevel,
    label: &'static str,
    limit: fn(&ThresholdSet) -> f64,
    margin: fn(&ThresholdSet) -> f64,
}

const LATCH_RULES: [LatchRule; 11] = [
    LatchRule {
        trigger: Trigger::WindPark,
        metric: Metric::WindSpeed,
        side: Side::High,
        level: VerdictLevel::ParkRequired,
        label: "wind",
        limit: |t| t.wind_park_mph,
        margin: |t| t.wind_margin_mph,
    },
    LatchRule {
        trigger: Trigger::WindClose,
        metric: Metric::WindSpeed,
        side: Side::High,
        level: VerdictLevel::CloseRequired,
        label: "wind",
        limit: |t| t.wind_close_mph,
        margin: |t| t.wind_margin_mph,
    },
    LatchRule {
        trigger: Trigger::Gust,
        metric: Metric::WindGust,
        side: Side::High,
        level: VerdictLevel::ParkRequired,
        label: "gusts",
        limit: |t| t.gust_park_mph,
        margin: |t| t.wind_margin_mph,
    },
    LatchRule {
        trigger: Trigger::Humidity,
        metric: Metric::Humidity,
        side: Side::High,
        level: VerdictLevel::CloseRequired,
        label: "humidity",
        limit: |t| t.humidity_max_pct,
        margin: |t| t.humidity_margin_pct,
    },
    LatchRule {
        trigger: Trigger::Cold,
        metric: Metric::Temperature,
        side: Side::Low,
        level: VerdictLevel::Warning,
        label: "temperature",
        limit: |t| t.temp_min_f,
        margin: |t| t.temp_margin_f,
    },
    LatchRule {
        trigger: Trigger::Cloud,
        metric: Metric::SkyAmbientDelta,
        side: Side::High,
        level: VerdictLevel::Warning,
        label: "sky temperature",
        limit: |t| t.cloudy_sky_delta_c,
        margin: |t| t.cloud_margin_c,
    },
    LatchRule {
        trigger: Trigger::Daylight,
        metric: Metric::SunAltitude,
        side: Side::High,
        level: VerdictLevel::ParkRequired,
        label: "sun altitude",
        limit: |t| t.twilight_sun_alt_deg,
        margin: |t| t.twilight_margin_deg,
    },
    LatchRule {
        trigger: Trigger::BatteryWarn,
        metric: Metric::BatteryPercent,
        side: Side::Low,
        level: VerdictLevel::Warning,
        label: "battery",
        limit: |t| t.battery_warn_pct,
        margin: |t| t.battery_margin_pct,
    },
    LatchRule {
        trigger: Trigger::BatteryPark,
        metric: Metric::BatteryPercent,
        side: Side::Low,
        level: VerdictLevel::ParkRequired,
        label: "battery",
        limit: |t| t.battery_park_pct,
        margin: |t| t.battery_margin_pct,
    },
    LatchRule {
        trigger: Trigger::BatteryClose,
        metric: Metric::BatteryPercent,
        side: Side::Low,
        level: VerdictLevel::CloseRequired,
        label: "battery",
        limit: |t| t.battery_close_pct,
        margin: |t| t.battery_margin_pct,
    },
    LatchRule {
        trigger: Trigger::BatteryShutdown,
        metric: Metric::BatteryPercent,
        side: Side::Low,
        level: VerdictLevel::CloseRequired,
        label: "battery",
        limit: |t| t.battery_shutdown_pct,
        margin: |t| t.battery_margin_pct,
    },
];

/// Metrics whose loss alone is enough to park the mount.
const PARK_ON_FAILURE: [Metric; 4] = [
    Metric::WindSpeed,
    Metric::WindGust,
    Metric::Rain,
    Metric::SunAltitude,
];

/// Metrics the evaluator expects in every snapshot.
const EVALUATED: [Metric; 8] = [
    Metric::WindSpeed,
    Metric::WindGust,
    Metric::Humidity,
    Metric::Temperature,
    Metric::Rain,
    Metric::SkyAmbientDelta,
    Metric::SunAltitude,
    Metric::BatteryPercent,
];

impl LatchRule {
    fn crossed(&self, value: f64, t: &ThresholdSet) -> bool {
        match self.side {
            Side::High => value > (self.limit)(t),
            Side::Low => value < (self.limit)(t),
        }
    }

    fn released(&self, value: f64, t: &ThresholdSet) -> bool {
        match self.side {
            Side::High => value <= (self.limit)(t) - (self.margin)(t),
            Side::Low => value >= (self.limit)(t) + (self.margin)(t),
        }
    }

    fn reason(&self, measured: f64, t: &ThresholdSet, stale: bool) -> VerdictReason {
        let limit = (self.limit)(t);
        let unit = self.metric.unit();
        let message = if stale {
            format!(
                "{} limit of {limit}{unit} still latched while the sensor is unavailable",
                self.label
            )
        } else {
            let relation = match self.side {
                Side::High => "above",
                Side::Low => "below",
            };
            format!(
                "{} {measured:.1}{unit} is {relation} the {limit}{unit} limit",
                self.label
            )
        };
        VerdictReason {
            trigger: self.trigger,
            metric: Some(self.metric),
            level: self.level,
            message,
            measured,
            threshold: limit,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Evaluation
// ────────────────────────────────────────────────────────────────────────────

/// Why a metric could not be trusted.
enum Failure {
    Missing,
    Stale(f64),
    SourceFailed(String),
}

fn fresh_value(
    snapshot: &SensorSnapshot,
    metric: Metric,
    thresholds: &ThresholdSet,
) -> Result<f64, Failure> {
    let reading = snapshot.get(metric).ok_or(Failure::Missing)?;
    if snapshot.is_source_failed(&reading.source) {
        return Err(Failure::SourceFailed(reading.source.clone()));
    }
    let age = reading.age_secs(snapshot.taken_at());
    if age > thresholds.sensor_timeout_secs as f64 {
        return Err(Failure::Stale(age));
    }
    Ok(reading.value)
}

fn failure_reason(metric: Metric, failure: &Failure, thresholds: &ThresholdSet) -> VerdictReason {
    let level = if PARK_ON_FAILURE.contains(&metric) {
        VerdictLevel::ParkRequired
    } else {
        VerdictLevel::Warning
    };
    let (message, measured) = match failure {
        Failure::Missing => (format!("no {} reading", metric.as_str()), 0.0),
        Failure::Stale(age) => (
            format!("{} reading is {age:.0}s old", metric.as_str()),
            *age,
        ),
        Failure::SourceFailed(source) => (
            format!("{} unavailable because {source} has failed", metric.as_str()),
            0.0,
        ),
    };
    VerdictReason {
        trigger: Trigger::SensorFailure,
        metric: Some(metric),
        level,
        message,
        measured,
        threshold: thresholds.sensor_timeout_secs as f64,
    }
}

/// Evaluate `snapshot` against `thresholds`, continuing from `prior`.
///
/// Returns the verdict and the hysteresis state to use for the next call.
/// Calling it twice with the same snapshot yields the same verdict.
pub fn evaluate(
    snapshot: &SensorSnapshot,
    thresholds: &ThresholdSet,
    prior: &HysteresisState,
) -> (SafetyVerdict, HysteresisState) {
    let now = snapshot.taken_at();
    let mut state = prior.clone();
    let mut reasons = Vec::new();

    let mut values = std::collections::BTreeMap::new();
    for metric in EVALUATED {
        match fresh_value(snapshot, metric, thresholds) {
            Ok(v) => {
                values.insert(metric, v);
            }
            Err(failure) => reasons.push(failure_reason(metric, &failure, thresholds)),
        }
    }

    evaluate_rain(values.get(&Metric::Rain).copied(), thresholds, now, &mut state, &mut reasons);

    for rule in &LATCH_RULES {
        let was_latched = state.is_latched(rule.trigger);
        match values.get(&rule.metric) {
            Some(&value) => {
                let latched = if was_latched {
                    !rule.released(value, thresholds)
                } else {
                    rule.crossed(value, thresholds)
                };
                if latched != was_latched {
                    debug!(trigger = ?rule.trigger, value, latched, "latch changed");
                    state.latches.insert(
                        rule.trigger,
                        Latch {
                            triggered: latched,
                            since: latched.then_some(now),
                        },
                    );
                }
                if latched {
                    reasons.push(rule.reason(value, thresholds, false));
                }
            }
            None if was_latched => {
                reasons.push(rule.reason((rule.limit)(thresholds), thresholds, true));
            }
            None => {}
        }
    }

    apply_recovery_hold(thresholds, now, &mut state, &mut reasons);

    (SafetyVerdict::from_reasons(reasons, now), state)
}

const RAIN_LEVEL: f64 = 0.5;

fn rain_reason(message: String, measured: f64) -> VerdictReason {
    VerdictReason {
        trigger: Trigger::Rain,
        metric: Some(Metric::Rain),
        level: VerdictLevel::Emergency,
        message,
        measured,
        threshold: RAIN_LEVEL,
    }
}

fn evaluate_rain(
    rain: Option<f64>,
    thresholds: &ThresholdSet,
    now: DateTime<Utc>,
    state: &mut HysteresisState,
    reasons: &mut Vec<VerdictReason>,
) {
    match rain {
        Some(value) if value >= RAIN_LEVEL => {
            state.rain.raining = true;
            state.rain.cleared_at = None;
            reasons.push(rain_reason("rain detected".to_string(), value));
            return;
        }
        Some(_) if state.rain.raining => {
            state.rain.raining = false;
            state.rain.cleared_at = Some(now);
        }
        // Losing the rain sensor mid-shower must not read as the rain stopping.
        None if state.rain.raining => {
            reasons.push(rain_reason(
                "rain still latched while the rain sensor is unavailable".to_string(),
                RAIN_LEVEL,
            ));
            return;
        }
        _ => {}
    }

    let holdoff = Duration::minutes(thresholds.rain_holdoff_min as i64);
    if let Some(cleared_at) = state.rain.cleared_at {
        let elapsed = now - cleared_at;
        if elapsed < holdoff {
            let remaining = (holdoff - elapsed).num_seconds().max(0) as f64 / 60.0;
            reasons.push(VerdictReason {
                trigger: Trigger::RainHoldoff,
                metric: Some(Metric::Rain),
                level: VerdictLevel::Warning,
                message: format!("rain stopped, holding off for {remaining:.0} more minutes"),
                measured: elapsed.num_seconds() as f64 / 60.0,
                threshold: thresholds.rain_holdoff_min as f64,
            });
        } else {
            state.rain.cleared_at = None;
        }
    }
}

fn apply_recovery_hold(
    thresholds: &ThresholdSet,
    now: DateTime<Utc>,
    state: &mut HysteresisState,
    reasons: &mut Vec<VerdictReason>,
) {
    let raw = reasons
        .iter()
        .map(|r| r.level)
        .max()
        .unwrap_or(VerdictLevel::Safe);

    if raw >= VerdictLevel::CloseRequired {
        state.recovery.pending = true;
        state.recovery.calm_since = None;
        return;
    }
    if !state.recovery.pending {
        return;
    }
    if raw > VerdictLevel::Warning {
        state.recovery.calm_since = None;
    } else {
        let calm_since = *state.recovery.calm_since.get_or_insert(now);
        let hold = Duration::seconds(thresholds.recovery_hold_secs as i64);
        if now - calm_since >= hold {
            state.recovery.pending = false;
            state.recovery.calm_since = None;
            return;
        }
    }

    let calm_for = state
        .recovery
        .calm_since
        .map(|t| (now - t).num_seconds() as f64)
        .unwrap_or(0.0);
    reasons.push(VerdictReason {
        trigger: Trigger::Recovering,
        metric: None,
        level: VerdictLevel::Warning,
        message: format!(
            "recovering from a close, conditions calm for {calm_for:.0} of {} seconds",
            thresholds.recovery_hold_secs
        ),
        measured: calm_for,
        threshold: thresholds.recovery_hold_secs as f64,
    });
}

// ────────────────────────────────────────────────────────────────────────────
// Rain holdoff status
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RainHoldoff {
    pub active: bool,
    pub minutes_remaining: f64,
}

/// Whether the post-rain holdoff is still running at `now`.
pub fn rain_holdoff_status(
    state: &HysteresisState,
    now: DateTime<Utc>,
    thresholds: &ThresholdSet,
) -> RainHoldoff {
    let holdoff = Duration::minutes(thresholds.rain_holdoff_min as i64);
    if state.rain.raining {
        return RainHoldoff {
            active: true,
            minutes_remaining: thresholds.rain_holdoff_min as f64,
        };
    }
    match state.rain.cleared_at {
        Some(cleared_at) if now - cleared_at < holdoff => RainHoldoff {
            active: true,
            minutes_remaining: (holdoff - (now - cleared_at)).num_seconds() as f64 / 60.0,
        },
        _ => RainHoldoff {
            active: false,
            minutes_remaining: 0.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T03:00:00Z")
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now())
    }

    /// A clear, dark, calm night with `wind` mph of wind at `at`.
    fn night(at: DateTime<Utc>, wind: f64) -> SensorSnapshot {
        SensorSnapshot::builder(at)
            .reading(Metric::WindSpeed, wind, at, "weather")
            .reading(Metric::WindGust, wind + 3.0, at, "weather")
            .reading(Metric::Humidity, 50.0, at, "weather")
            .reading(Metric::Temperature, 45.0, at, "weather")
            .reading(Metric::SkyAmbientDelta, -30.0, at, "weather")
            .rain(false, at, "weather")
            .reading(Metric::SunAltitude, -30.0, at, "ephemeris")
            .reading(Metric::BatteryPercent, 100.0, at, "power")
            .build()
    }

    fn with(snapshot: SensorSnapshot, metric: Metric, value: f64) -> SensorSnapshot {
        let at = snapshot.taken_at();
        let mut b = SensorSnapshot::builder(at);
        for (m, r) in snapshot.readings() {
            b = b.with_reading(*m, r.clone());
        }
        let source = snapshot
            .get(metric)
            .map(|r| r.source.clone())
            .unwrap_or_else(|| "weather".to_string());
        b.reading(metric, value, at, source).build()
    }

    #[test]
    fn calm_night_is_safe() {
        let (verdict, _) = evaluate(&night(t0(), 5.0), &ThresholdSet::default(), &HysteresisState::default());
        assert!(verdict.is_safe(), "unexpected reasons: {}", verdict.summary());
    }

    #[test]
    fn wind_latch_does_not_flap() {
        let t = ThresholdSet::default();
        let mut state = HysteresisState::default();
        let mut levels = Vec::new();
        for (i, wind) in [24.0, 26.0, 23.0, 20.0].into_iter().enumerate() {
            let at = t0() + Duration::seconds(i as i64 * 60);
            let (verdict, next) = evaluate(&night(at, wind), &t, &state);
            levels.push(verdict.level());
            state = next;
        }
        assert_eq!(
            levels,
            vec![
                VerdictLevel::Safe,
                VerdictLevel::ParkRequired,
                VerdictLevel::ParkRequired,
                VerdictLevel::Safe,
            ]
        );
    }

    #[test]
    fn reading_exactly_at_release_level_releases() {
        let t = ThresholdSet::default();
        let (_, state) = evaluate(&night(t0(), 26.0), &t, &HysteresisState::default());
        assert!(state.is_latched(Trigger::WindPark));
        let (verdict, state) = evaluate(&night(t0(), 20.0), &t, &state);
        assert!(!state.is_latched(Trigger::WindPark));
        assert!(!verdict.has_trigger(Trigger::WindPark));
    }

    #[test]
    fn strong_wind_requires_close() {
        let (verdict, _) = evaluate(&night(t0(), 36.0), &ThresholdSet::default(), &HysteresisState::default());
        assert_eq!(verdict.level(), VerdictLevel::CloseRequired);
        assert!(verdict.has_trigger(Trigger::WindPark));
        assert!(verdict.has_trigger(Trigger::WindClose));
    }

    #[test]
    fn rain_is_an_emergency_then_holds_off() {
        let t = ThresholdSet::default();
        let wet = {
            let s = night(t0(), 5.0);
            with(s, Metric::Rain, 1.0)
        };
        let (verdict, state) = evaluate(&wet, &t, &HysteresisState::default());
        assert_eq!(verdict.level(), VerdictLevel::Emergency);
        assert!(state.rain.raining);

        let dry_at = t0() + Duration::minutes(1);
        let (verdict, state) = evaluate(&night(dry_at, 5.0), &t, &state);
        assert!(verdict.has_trigger(Trigger::RainHoldoff));
        assert_eq!(verdict.level(), VerdictLevel::Warning);
        let holdoff = rain_holdoff_status(&state, dry_at + Duration::minutes(10), &t);
        assert!(holdoff.active);
        assert!((holdoff.minutes_remaining - 20.0).abs() < 0.01);

        let later = dry_at + Duration::minutes(31);
        let (verdict, state) = evaluate(&night(later, 5.0), &t, &state);
        assert!(!verdict.has_trigger(Trigger::RainHoldoff));
        assert!(!rain_holdoff_status(&state, later, &t).active);
    }

    #[test]
    fn rain_sensor_loss_while_raining_stays_an_emergency() {
        let t = ThresholdSet::default();
        let (verdict, state) = evaluate(&with(night(t0(), 5.0), Metric::Rain, 1.0), &t, &HysteresisState::default());
        assert_eq!(verdict.level(), VerdictLevel::Emergency);

        // Next cycle the rain reading is gone entirely.
        let at = t0() + Duration::seconds(30);
        let base = night(at, 5.0);
        let mut b = SensorSnapshot::builder(at);
        for (m, r) in base.readings().filter(|(m, _)| **m != Metric::Rain) {
            b = b.with_reading(*m, r.clone());
        }
        let (verdict, state) = evaluate(&b.build(), &t, &state);
        assert_eq!(verdict.level(), VerdictLevel::Emergency, "{}", verdict.summary());
        assert!(verdict.has_trigger(Trigger::Rain));
        assert!(state.rain.raining);
        assert!(state.rain.cleared_at.is_none());

        // A failed weather service is treated the same way.
        let failed = {
            let base = night(at + Duration::seconds(30), 5.0);
            let mut b = SensorSnapshot::builder(base.taken_at());
            for (m, r) in base.readings() {
                b = b.with_reading(*m, r.clone());
            }
            b.failed_source("weather").build()
        };
        let (verdict, state) = evaluate(&failed, &t, &state);
        assert_eq!(verdict.level(), VerdictLevel::Emergency);
        assert!(state.rain.raining);
    }

    #[test]
    fn identical_snapshot_gives_identical_verdict() {
        let t = ThresholdSet::default();
        let snapshot = with(night(t0(), 28.0), Metric::Humidity, 90.0);
        let (first, state) = evaluate(&snapshot, &t, &HysteresisState::default());
        let (second, _) = evaluate(&snapshot, &t, &state);
        assert_eq!(first, second);
    }

    #[test]
    fn stale_wind_forces_park() {
        let t = ThresholdSet::default();
        let now = t0();
        let old = now - Duration::seconds(t.sensor_timeout_secs as i64 + 1);
        let snapshot = {
            let base = night(now, 5.0);
            let mut b = SensorSnapshot::builder(now);
            for (m, r) in base.readings() {
                b = b.with_reading(*m, r.clone());
            }
            b.reading(Metric::WindSpeed, 5.0, old, "weather").build()
        };
        let (verdict, _) = evaluate(&snapshot, &t, &HysteresisState::default());
        assert_eq!(verdict.level(), VerdictLevel::ParkRequired);
        assert!(verdict.has_trigger(Trigger::SensorFailure));
    }

    #[test]
    fn missing_temperature_is_only_a_warning() {
        let now = t0();
        let base = night(now, 5.0);
        let mut b = SensorSnapshot::builder(now);
        for (m, r) in base.readings().filter(|(m, _)| **m != Metric::Temperature) {
            b = b.with_reading(*m, r.clone());
        }
        let (verdict, _) = evaluate(&b.build(), &ThresholdSet::default(), &HysteresisState::default());
        assert_eq!(verdict.level(), VerdictLevel::Warning);
    }

    #[test]
    fn failed_source_keeps_latch_and_parks() {
        let t = ThresholdSet::default();
        let (_, state) = evaluate(&night(t0(), 36.0), &t, &HysteresisState::default());
        assert!(state.is_latched(Trigger::WindClose));

        let base = night(t0() + Duration::seconds(30), 5.0);
        let mut b = SensorSnapshot::builder(base.taken_at());
        for (m, r) in base.readings() {
            b = b.with_reading(*m, r.clone());
        }
        let degraded = b.failed_source("weather").build();
        let (verdict, state) = evaluate(&degraded, &t, &state);
        assert!(state.is_latched(Trigger::WindClose));
        assert!(verdict.level() >= VerdictLevel::CloseRequired);
    }

    #[test]
    fn close_recovers_only_after_hold() {
        let t = ThresholdSet {
            recovery_hold_secs: 300,
            ..ThresholdSet::default()
        };
        let (verdict, state) = evaluate(&with(night(t0(), 5.0), Metric::Humidity, 95.0), &t, &HysteresisState::default());
        assert_eq!(verdict.level(), VerdictLevel::CloseRequired);

        // Humidity falls well below the release level.
        let calm = |secs: i64| with(night(t0() + Duration::seconds(secs), 5.0), Metric::Humidity, 50.0);
        let (verdict, state) = evaluate(&calm(60), &t, &state);
        assert_eq!(verdict.level(), VerdictLevel::Warning);
        assert!(verdict.has_trigger(Trigger::Recovering));

        let (verdict, state) = evaluate(&calm(300), &t, &state);
        assert_eq!(verdict.level(), VerdictLevel::Warning);

        let (verdict, state) = evaluate(&calm(360), &t, &state);
        assert!(verdict.is_safe(), "still holding: {}", verdict.summary());
        assert!(!state.recovery.pending);
    }

    #[test]
    fn park_level_during_recovery_restarts_the_hold() {
        let t = ThresholdSet::default();
        let (_, state) = evaluate(&night(t0(), 40.0), &t, &HysteresisState::default());
        let (_, state) = evaluate(&night(t0() + Duration::seconds(60), 10.0), &t, &state);
        assert!(state.recovery.calm_since.is_some());

        // Gusts push back to PARK_REQUIRED.
        let gusty = with(night(t0() + Duration::seconds(120), 10.0), Metric::WindGust, 40.0);
        let (verdict, state) = evaluate(&gusty, &t, &state);
        assert_eq!(verdict.level(), VerdictLevel::ParkRequired);
        assert!(state.recovery.pending);
        assert!(state.recovery.calm_since.is_none());
    }

    #[test]
    fn battery_ladder_levels() {
        let t = ThresholdSet::default();
        let level = |pct: f64| {
            let (v, _) = evaluate(&with(night(t0(), 5.0), Metric::BatteryPercent, pct), &t, &HysteresisState::default());
            v.level()
        };
        assert_eq!(level(45.0), VerdictLevel::Warning);
        assert_eq!(level(30.0), VerdictLevel::ParkRequired);
        assert_eq!(level(22.0), VerdictLevel::CloseRequired);
        assert_eq!(level(10.0), VerdictLevel::CloseRequired);
    }

    #[test]
    fn daylight_parks() {
        let (verdict, _) = evaluate(
            &with(night(t0(), 5.0), Metric::SunAltitude, -5.0),
            &ThresholdSet::default(),
            &HysteresisState::default(),
        );
        assert!(verdict.has_trigger(Trigger::Daylight));
        assert_eq!(verdict.level(), VerdictLevel::ParkRequired);
    }
}
