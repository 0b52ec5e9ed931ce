//! Weather station and sky sensor role.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vigil_types::{Metric, SnapshotBuilder, VigilError};

use crate::device::Device;

/// One poll of the weather station. Fields the station does not report are
/// `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherReading {
    pub captured_at: DateTime<Utc>,
    pub wind_mph: Option<f64>,
    pub gust_mph: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub temperature_f: Option<f64>,
    pub rain: Option<bool>,
    pub sky_ambient_delta_c: Option<f64>,
}

impl WeatherReading {
    /// A calm, clear, dry night.
    pub fn clear_night(captured_at: DateTime<Utc>) -> Self {
        Self {
            captured_at,
            wind_mph: Some(5.0),
            gust_mph: Some(8.0),
            humidity_pct: Some(55.0),
            temperature_f: Some(50.0),
            rain: Some(false),
            sky_ambient_delta_c: Some(-30.0),
        }
    }

    /// Copy every reported field into `builder` tagged with `source`.
    pub fn apply_to(&self, mut builder: SnapshotBuilder, source: &str) -> SnapshotBuilder {
        let at = self.captured_at;
        let numeric = [
            (Metric::WindSpeed, self.wind_mph),
            (Metric::WindGust, self.gust_mph),
            (Metric::Humidity, self.humidity_pct),
            (Metric::Temperature, self.temperature_f),
            (Metric::SkyAmbientDelta, self.sky_ambient_delta_c),
        ];
        for (metric, value) in numeric {
            if let Some(v) = value {
                builder = builder.reading(metric, v, at, source);
            }
        }
        if let Some(raining) = self.rain {
            builder = builder.rain(raining, at, source);
        }
        builder
    }
}

#[async_trait]
pub trait WeatherStation: Device {
    /// Latest observation, or `None` when the station has no data.
    async fn reading(&self) -> Result<Option<WeatherReading>, VigilError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_types::SensorSnapshot;

    #[test]
    fn apply_to_skips_unreported_fields() {
        let now = Utc::now();
        let reading = WeatherReading {
            humidity_pct: None,
            ..WeatherReading::clear_night(now)
        };
        let snapshot = reading
            .apply_to(SensorSnapshot::builder(now), "weather")
            .build();

        assert_eq!(snapshot.value(Metric::WindSpeed), Some(5.0));
        assert_eq!(snapshot.value(Metric::Humidity), None);
        assert_eq!(snapshot.is_raining(), Some(false));
        assert_eq!(
            snapshot.get(Metric::WindSpeed).map(|r| r.source.as_str()),
            Some("weather")
        );
    }
}
