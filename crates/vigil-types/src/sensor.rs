//! Sensor readings and the immutable [`SensorSnapshot`] fed to the evaluator.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every quantity the evaluator knows how to judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Sustained wind speed in mph.
    WindSpeed,
    /// Peak gust in mph.
    WindGust,
    /// Relative humidity in percent.
    Humidity,
    /// Ambient temperature in °F.
    Temperature,
    /// Rain flag, `1.0` when rain is detected.
    Rain,
    /// Sky minus ambient temperature in °C (cloud sensor).
    SkyAmbientDelta,
    /// Solar altitude in degrees.
    SunAltitude,
    /// Battery state of charge in percent.
    BatteryPercent,
    /// Enclosure opening in percent, `100.0` fully open.
    EnclosurePosition,
}

impl Metric {
    pub const ALL: [Metric; 9] = [
        Metric::WindSpeed,
        Metric::WindGust,
        Metric::Humidity,
        Metric::Temperature,
        Metric::Rain,
        Metric::SkyAmbientDelta,
        Metric::SunAltitude,
        Metric::BatteryPercent,
        Metric::EnclosurePosition,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::WindSpeed => "wind_speed",
            Metric::WindGust => "wind_gust",
            Metric::Humidity => "humidity",
            Metric::Temperature => "temperature",
            Metric::Rain => "rain",
            Metric::SkyAmbientDelta => "sky_ambient_delta",
            Metric::SunAltitude => "sun_altitude",
            Metric::BatteryPercent => "battery_percent",
            Metric::EnclosurePosition => "enclosure_position",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Metric::WindSpeed | Metric::WindGust => "mph",
            Metric::Humidity | Metric::BatteryPercent | Metric::EnclosurePosition => "%",
            Metric::Temperature => "°F",
            Metric::SkyAmbientDelta => "°C",
            Metric::SunAltitude => "°",
            Metric::Rain => "",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One measured value with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,
    pub captured_at: DateTime<Utc>,
    /// Service that produced the value, e.g. `"weather"`.
    pub source: String,
}

impl Reading {
    /// Age of the reading relative to `now`, in seconds. Readings stamped in
    /// the future report zero.
    pub fn age_secs(&self, now: DateTime<Utc>) -> f64 {
        let millis = (now - self.captured_at).num_milliseconds();
        (millis.max(0) as f64) / 1000.0
    }
}

/// Point-in-time collection of readings. Immutable once built.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use vigil_types::{Metric, SensorSnapshot};
///
/// let now = Utc::now();
/// let snapshot = SensorSnapshot::builder(now)
///     .reading(Metric::WindSpeed, 12.0, now, "weather")
///     .rain(false, now, "weather")
///     .build();
///
/// assert_eq!(snapshot.value(Metric::WindSpeed), Some(12.0));
/// assert_eq!(snapshot.is_raining(), Some(false));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    taken_at: DateTime<Utc>,
    readings: BTreeMap<Metric, Reading>,
    failed_sources: BTreeSet<String>,
}

impl SensorSnapshot {
    pub fn builder(taken_at: DateTime<Utc>) -> SnapshotBuilder {
        SnapshotBuilder {
            inner: SensorSnapshot {
                taken_at,
                readings: BTreeMap::new(),
                failed_sources: BTreeSet::new(),
            },
        }
    }

    /// The evaluation clock for this snapshot.
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn get(&self, metric: Metric) -> Option<&Reading> {
        self.readings.get(&metric)
    }

    pub fn value(&self, metric: Metric) -> Option<f64> {
        self.readings.get(&metric).map(|r| r.value)
    }

    /// `Some(true)` when the rain sensor reports precipitation, `None` when
    /// there is no rain reading at all.
    pub fn is_raining(&self) -> Option<bool> {
        self.value(Metric::Rain).map(|v| v >= 0.5)
    }

    pub fn readings(&self) -> impl Iterator<Item = (&Metric, &Reading)> {
        self.readings.iter()
    }

    /// Services the watchdog has declared failed at the time of capture.
    pub fn failed_sources(&self) -> &BTreeSet<String> {
        &self.failed_sources
    }

    pub fn is_source_failed(&self, source: &str) -> bool {
        self.failed_sources.contains(source)
    }
}

/// Builder for [`SensorSnapshot`].
#[derive(Debug)]
pub struct SnapshotBuilder {
    inner: SensorSnapshot,
}

impl SnapshotBuilder {
    pub fn reading(
        mut self,
        metric: Metric,
        value: f64,
        captured_at: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Self {
        self.inner.readings.insert(
            metric,
            Reading {
                value,
                captured_at,
                source: source.into(),
            },
        );
        self
    }

    pub fn rain(self, raining: bool, captured_at: DateTime<Utc>, source: impl Into<String>) -> Self {
        let value = if raining { 1.0 } else { 0.0 };
        self.reading(Metric::Rain, value, captured_at, source)
    }

    /// Insert an already-built reading, e.g. a cached last-known-good value.
    pub fn with_reading(mut self, metric: Metric, reading: Reading) -> Self {
        self.inner.readings.insert(metric, reading);
        self
    }

    pub fn failed_source(mut self, source: impl Into<String>) -> Self {
        self.inner.failed_sources.insert(source.into());
        self
    }

    pub fn build(self) -> SensorSnapshot {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn reading_age_is_measured_against_snapshot_clock() {
        let now = Utc::now();
        let reading = Reading {
            value: 10.0,
            captured_at: now - Duration::seconds(90),
            source: "weather".into(),
        };
        assert!((reading.age_secs(now) - 90.0).abs() < 0.01);
    }

    #[test]
    fn future_readings_have_zero_age() {
        let now = Utc::now();
        let reading = Reading {
            value: 10.0,
            captured_at: now + Duration::seconds(5),
            source: "weather".into(),
        };
        assert_eq!(reading.age_secs(now), 0.0);
    }

    #[test]
    fn builder_records_failed_sources() {
        let snapshot = SensorSnapshot::builder(Utc::now())
            .failed_source("weather")
            .build();
        assert!(snapshot.is_source_failed("weather"));
        assert!(!snapshot.is_source_failed("power"));
    }

    #[test]
    fn missing_rain_reading_is_none() {
        let snapshot = SensorSnapshot::builder(Utc::now()).build();
        assert_eq!(snapshot.is_raining(), None);
    }
}
