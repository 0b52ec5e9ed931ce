//! [`ConditionMonitor`] – the evaluation slot.
//!
//! The monitor is the only owner of the [`HysteresisState`]. Each cycle it
//! polls the weather station, power supply, ephemeris and enclosure (every
//! call bounded by the device timeout), builds a [`SensorSnapshot`], runs the
//! evaluator and publishes the resulting verdict:
//!
//! - to the `watch` channel every other task reads the latest verdict from;
//! - to the bus as `VerdictChanged` when the level moves;
//! - to the journal whenever the verdict or the hysteresis state changes, and
//!   the hysteresis state to its own `watch` channel;
//! - to the alert dispatcher when the level rises to `PARK_REQUIRED` or worse.
//!
//! A failed poll is not an error here. The monitor keeps every metric's last
//! good reading; the evaluator sees it age past the sensor timeout and treats
//! it as failed. Services the watchdog has declared failed are folded into the
//! snapshot as failed sources.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vigil_hal::{AlertDispatcher, DeviceRegistry};
use vigil_kernel::evaluate;
use vigil_memory::JournalKind;
use vigil_middleware::EventBus;
use vigil_types::{
    AlertSeverity, Event, EventPayload, HysteresisState, Metric, Reading, SafetyVerdict,
    SensorSnapshot, ServiceKind, ServiceState, ThresholdSet, Trigger, VerdictLevel,
};

use crate::{SharedJournal, record};

const SOURCE: &str = "vigil-runtime::monitor";

/// Channels the monitor publishes on and reads from.
pub struct MonitorLinks {
    pub verdict_tx: watch::Sender<Arc<SafetyVerdict>>,
    pub battery_tx: watch::Sender<Option<f64>>,
    pub hysteresis_tx: watch::Sender<HysteresisState>,
    pub health_rx: watch::Receiver<BTreeMap<ServiceKind, ServiceState>>,
    pub bus: EventBus,
    pub alerts: AlertDispatcher,
    pub journal: Option<SharedJournal>,
}

pub struct ConditionMonitor {
    devices: DeviceRegistry,
    thresholds: ThresholdSet,
    hysteresis: HysteresisState,
    last_good: BTreeMap<Metric, Reading>,
    /// Hardware rain line on the enclosure, when it has one.
    rain_line: Option<watch::Receiver<bool>>,
    device_timeout: Duration,
    links: MonitorLinks,
}

impl ConditionMonitor {
    /// `hysteresis` is the state restored from the journal, or the default.
    pub fn new(
        devices: DeviceRegistry,
        thresholds: ThresholdSet,
        hysteresis: HysteresisState,
        device_timeout: Duration,
        links: MonitorLinks,
    ) -> Self {
        let rain_line = devices.enclosure().rain_interrupt();
        links.hysteresis_tx.send_replace(hysteresis.clone());
        Self {
            devices,
            thresholds,
            hysteresis,
            last_good: BTreeMap::new(),
            rain_line,
            device_timeout,
            links,
        }
    }

    /// Poll every sensor service and assemble a snapshot stamped now.
    #[instrument(skip(self))]
    pub async fn snapshot(&mut self) -> SensorSnapshot {
        let now = Utc::now();
        let timeout = self.device_timeout;

        match tokio::time::timeout(timeout, self.devices.weather().reading()).await {
            Ok(Ok(Some(reading))) => {
                let polled = reading
                    .apply_to(SensorSnapshot::builder(now), ServiceKind::Weather.as_str())
                    .build();
                self.remember(&polled);
            }
            Ok(Ok(None)) => debug!("weather station has no data"),
            Ok(Err(e)) => warn!(error = %e, "weather poll failed"),
            Err(_) => warn!("weather poll timed out"),
        }

        let battery = match tokio::time::timeout(timeout, self.devices.power().battery_percent()).await {
            Ok(Ok(pct)) => Some(pct),
            Ok(Err(e)) => {
                warn!(error = %e, "battery poll failed");
                None
            }
            Err(_) => {
                warn!("battery poll timed out");
                None
            }
        };
        if let Some(pct) = battery {
            self.remember_value(Metric::BatteryPercent, pct, now, ServiceKind::Power);
        }
        self.links.battery_tx.send_replace(battery);

        match tokio::time::timeout(timeout, self.devices.ephemeris().sun_altitude_deg()).await {
            Ok(Ok(alt)) => self.remember_value(Metric::SunAltitude, alt, now, ServiceKind::Ephemeris),
            Ok(Err(e)) => warn!(error = %e, "ephemeris query failed"),
            Err(_) => warn!("ephemeris query timed out"),
        }

        match tokio::time::timeout(timeout, self.devices.enclosure().position_percent()).await {
            Ok(Ok(pct)) => {
                self.remember_value(Metric::EnclosurePosition, pct, now, ServiceKind::Enclosure)
            }
            Ok(Err(e)) => debug!(error = %e, "enclosure position unavailable"),
            Err(_) => debug!("enclosure position query timed out"),
        }

        let mut builder = SensorSnapshot::builder(now);
        for (metric, reading) in &self.last_good {
            builder = builder.with_reading(*metric, reading.clone());
        }
        if self.rain_line.as_ref().is_some_and(|line| *line.borrow()) {
            builder = builder.rain(true, now, ServiceKind::Enclosure.as_str());
        }
        for (service, state) in self.links.health_rx.borrow().iter() {
            if *state == ServiceState::Failed {
                builder = builder.failed_source(service.as_str());
            }
        }
        builder.build()
    }

    fn remember(&mut self, polled: &SensorSnapshot) {
        for (metric, reading) in polled.readings() {
            self.last_good.insert(*metric, reading.clone());
        }
    }

    fn remember_value(
        &mut self,
        metric: Metric,
        value: f64,
        at: chrono::DateTime<Utc>,
        source: ServiceKind,
    ) {
        self.last_good.insert(
            metric,
            Reading {
                value,
                captured_at: at,
                source: source.as_str().to_string(),
            },
        );
    }

    /// Evaluate `snapshot` and publish the verdict. Synchronous so tests and
    /// replays can drive the slot without devices.
    pub fn evaluate_snapshot(&mut self, snapshot: &SensorSnapshot) -> Arc<SafetyVerdict> {
        let previous = self.links.verdict_tx.borrow().clone();
        let (verdict, hysteresis) = evaluate(snapshot, &self.thresholds, &self.hysteresis);
        let verdict = Arc::new(verdict);

        let hysteresis_changed = hysteresis != self.hysteresis;
        self.hysteresis = hysteresis;
        if hysteresis_changed {
            record(&self.links.journal, JournalKind::Hysteresis, &self.hysteresis);
            self.links.hysteresis_tx.send_replace(self.hysteresis.clone());
        }

        let triggers = |v: &SafetyVerdict| -> BTreeSet<Trigger> {
            v.reasons().iter().map(|r| r.trigger).collect()
        };
        if previous.level() != verdict.level() || triggers(&previous) != triggers(&verdict) {
            record(&self.links.journal, JournalKind::Verdict, verdict.as_ref());
        }

        if previous.level() != verdict.level() {
            info!(from = %previous.level(), to = %verdict.level(), reasons = %verdict.summary(), "verdict changed");
            self.links.bus.publish(Event::new(
                SOURCE,
                EventPayload::VerdictChanged {
                    previous: previous.level(),
                    verdict: verdict.clone(),
                },
            ));
            if verdict.level() > previous.level() {
                self.alert_on_rise(&verdict);
            }
        }

        self.links.verdict_tx.send_replace(verdict.clone());
        verdict
    }

    fn alert_on_rise(&self, verdict: &SafetyVerdict) {
        let severity = match verdict.level() {
            VerdictLevel::Emergency => AlertSeverity::Emergency,
            VerdictLevel::CloseRequired => AlertSeverity::Critical,
            VerdictLevel::ParkRequired => AlertSeverity::Warning,
            VerdictLevel::Warning | VerdictLevel::Safe => return,
        };
        self.links.alerts.raise(
            severity,
            "monitor",
            format!("{}: {}", verdict.level(), verdict.summary()),
        );
    }

    /// Poll, evaluate and publish once.
    pub async fn cycle(&mut self) -> Arc<SafetyVerdict> {
        let snapshot = self.snapshot().await;
        self.evaluate_snapshot(&snapshot)
    }

    /// Run cycles every `interval` until `cancel` fires. The first cycle runs
    /// immediately.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.cycle().await;
                }
            }
        }
        debug!("condition monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_hal::sim::{SimOp, SimSite};
    use vigil_hal::{AlertPolicy, LogAlertSink};
    use vigil_memory::Journal;
    use vigil_middleware::Topic;

    struct Harness {
        site: SimSite,
        monitor: ConditionMonitor,
        verdict_rx: watch::Receiver<Arc<SafetyVerdict>>,
        hysteresis_rx: watch::Receiver<HysteresisState>,
        health_tx: watch::Sender<BTreeMap<ServiceKind, ServiceState>>,
        bus: EventBus,
        journal: SharedJournal,
    }

    fn harness() -> Harness {
        let site = SimSite::new();
        let (verdict_tx, verdict_rx) =
            watch::channel(Arc::new(SafetyVerdict::awaiting_data(Utc::now())));
        let (battery_tx, _) = watch::channel(None);
        let (hysteresis_tx, hysteresis_rx) = watch::channel(HysteresisState::default());
        let (health_tx, health_rx) = watch::channel(BTreeMap::new());
        let bus = EventBus::default();
        let journal = Arc::new(parking_lot::Mutex::new(Journal::open_in_memory().unwrap()));
        let links = MonitorLinks {
            verdict_tx,
            battery_tx,
            hysteresis_tx,
            health_rx,
            bus: bus.clone(),
            alerts: AlertDispatcher::spawn(vec![Arc::new(LogAlertSink)], AlertPolicy::default()),
            journal: Some(journal.clone()),
        };
        let monitor = ConditionMonitor::new(
            site.registry(),
            ThresholdSet::default(),
            HysteresisState::default(),
            Duration::from_secs(5),
            links,
        );
        Harness {
            site,
            monitor,
            verdict_rx,
            hysteresis_rx,
            health_tx,
            bus,
            journal,
        }
    }

    #[tokio::test]
    async fn clear_night_publishes_safe_verdict() {
        let mut h = harness();
        let mut changes = h.bus.subscribe_to(Topic::VerdictChanged);

        let verdict = h.monitor.cycle().await;
        assert!(verdict.is_safe(), "{}", verdict.summary());
        assert!(h.verdict_rx.borrow().is_safe());

        let event = changes.next().await.unwrap();
        assert!(matches!(
            event.payload,
            EventPayload::VerdictChanged { previous: VerdictLevel::ParkRequired, .. }
        ));
        let recorded: Option<SafetyVerdict> =
            h.journal.lock().latest(JournalKind::Verdict).unwrap();
        assert!(recorded.is_some_and(|v| v.is_safe()));
    }

    #[tokio::test]
    async fn weather_outage_falls_back_to_last_good_reading() {
        let mut h = harness();
        assert!(h.monitor.cycle().await.is_safe());

        h.site.weather.faults.set_offline(true);
        // Cached readings are still fresh, so the verdict holds.
        let verdict = h.monitor.cycle().await;
        assert!(verdict.is_safe(), "{}", verdict.summary());
        assert!(h.site.weather.faults.calls(SimOp::Read) >= 2);
    }

    #[tokio::test]
    async fn failed_weather_service_forces_park() {
        let mut h = harness();
        h.monitor.cycle().await;

        h.health_tx.send_replace(BTreeMap::from([(ServiceKind::Weather, ServiceState::Failed)]));
        let verdict = h.monitor.cycle().await;
        assert_eq!(verdict.level(), VerdictLevel::ParkRequired);
        assert!(verdict.has_trigger(Trigger::SensorFailure));
    }

    #[tokio::test]
    async fn rain_is_published_as_emergency() {
        let mut h = harness();
        h.monitor.cycle().await;

        h.site.weather.update(|r| r.rain = Some(true));
        let verdict = h.monitor.cycle().await;
        assert_eq!(verdict.level(), VerdictLevel::Emergency);
        assert!(h.hysteresis_rx.borrow().rain.raining);
        let restored: Option<HysteresisState> =
            h.journal.lock().latest(JournalKind::Hysteresis).unwrap();
        assert!(restored.is_some_and(|s| s.rain.raining));
    }

    #[tokio::test]
    async fn hardware_rain_line_overrides_weather_station() {
        let mut h = harness();
        h.site.enclosure.trigger_rain(true);
        let verdict = h.monitor.cycle().await;
        assert_eq!(verdict.level(), VerdictLevel::Emergency);
        assert!(verdict.has_trigger(Trigger::Rain));
    }

    #[tokio::test]
    async fn low_battery_reaches_the_battery_channel() {
        let mut h = harness();
        let battery_rx = h.monitor.links.battery_tx.subscribe();
        h.site.power.set_battery(30.0);
        let verdict = h.monitor.cycle().await;
        assert_eq!(*battery_rx.borrow(), Some(30.0));
        assert!(verdict.has_trigger(Trigger::BatteryPark));
    }
}
