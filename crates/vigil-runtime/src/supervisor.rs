//! [`Supervisor`] – drives the kernel [`ServiceWatchdog`] against live devices.
//!
//! Every tick the supervisor pings the services that are due, reports each
//! successful ping as a heartbeat, advances the watchdog and carries out the
//! resulting actions:
//!
//! | Action | Effect |
//! |---|---|
//! | `Recover` | `connect()` or `reset()` the device (or nothing, for hold-last-known-good), then re-ping |
//! | `MarkedFailed` | `CRITICAL` alert; the service is reported failed to the monitor |
//! | `Recovered` | `INFO` alert; the service is reported healthy again |
//!
//! Each change is published as `ServiceHealthChanged`. When more than one
//! safety-relevant service has failed the responder is forced to `CLOSE`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use vigil_hal::{AlertDispatcher, DeviceRegistry};
use vigil_kernel::{RecoveryAction, ServiceWatchdog, WatchdogAction, WatchdogConfig};
use vigil_middleware::EventBus;
use vigil_types::{AlertSeverity, EmergencyStage, Event, EventPayload, ServiceKind, ServiceState};

use crate::responder::ForcedStage;

const SOURCE: &str = "vigil-runtime::supervisor";

pub type HealthMap = BTreeMap<ServiceKind, ServiceState>;

pub struct SupervisorLinks {
    pub health_tx: watch::Sender<HealthMap>,
    pub bus: EventBus,
    pub alerts: AlertDispatcher,
    pub force_tx: mpsc::Sender<ForcedStage>,
}

pub struct Supervisor {
    devices: DeviceRegistry,
    watchdog: ServiceWatchdog,
    ping_timeout: Duration,
    check_interval: Duration,
    close_forced: bool,
    links: SupervisorLinks,
}

/// Wall-clock instant that follows Tokio's clock, so paused-time tests and
/// production share one code path.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl Supervisor {
    /// Supervise every service in `config` that has a driver in `devices`.
    pub fn new(devices: DeviceRegistry, config: &WatchdogConfig, links: SupervisorLinks) -> Self {
        let bound = devices.services();
        let mut config = config.clone();
        config.services.retain(|service, _| bound.contains(service));
        let watchdog = ServiceWatchdog::new(&config, now());
        let supervisor = Self {
            devices,
            ping_timeout: Duration::from_secs(config.ping_timeout_secs),
            check_interval: Duration::from_secs(config.check_interval_secs.max(1)),
            watchdog,
            close_forced: false,
            links,
        };
        supervisor.publish_health();
        supervisor
    }

    /// One supervision pass.
    pub async fn tick(&mut self) {
        for service in self.watchdog.due_for_ping(now()) {
            if self.ping(service).await
                && let Some(action) = self.watchdog.heartbeat_at(service, now())
            {
                self.apply(action).await;
            }
        }
        for action in self.watchdog.poll_at(now()) {
            self.apply(action).await;
        }
        self.publish_health();

        if self.watchdog.requires_forced_close() {
            if !self.close_forced {
                let failed: Vec<&str> = self
                    .watchdog
                    .failed_safety_relevant()
                    .iter()
                    .map(ServiceKind::as_str)
                    .collect();
                let reason = format!("safety services failed: {}", failed.join(", "));
                error!(%reason, "forcing enclosure close");
                let forced = ForcedStage {
                    stage: EmergencyStage::Close,
                    reason,
                };
                if self.links.force_tx.send(forced).await.is_ok() {
                    self.close_forced = true;
                } else {
                    warn!("responder is gone, forced close not delivered");
                }
            }
        } else {
            self.close_forced = false;
        }
    }

    async fn ping(&self, service: ServiceKind) -> bool {
        let Some(device) = self.devices.device(service) else {
            return false;
        };
        match tokio::time::timeout(self.ping_timeout, device.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!(%service, error = %e, "ping failed");
                false
            }
            Err(_) => {
                debug!(%service, "ping timed out");
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn apply(&mut self, action: WatchdogAction) {
        match action {
            WatchdogAction::Recover {
                service,
                action,
                attempt,
            } => {
                self.health_changed(service, ServiceState::Degraded, attempt);
                if self.recover(service, action).await
                    && self.ping(service).await
                    && let Some(WatchdogAction::Recovered { service }) =
                        self.watchdog.heartbeat_at(service, now())
                {
                    self.recovered(service);
                }
            }
            WatchdogAction::MarkedFailed { service } => {
                let attempts = self.watchdog.attempts(service);
                self.health_changed(service, ServiceState::Failed, attempts);
                let impact = if self.watchdog.is_safety_relevant(service) {
                    ", its readings are now treated as stale"
                } else {
                    ""
                };
                self.links.alerts.raise(
                    AlertSeverity::Critical,
                    "watchdog",
                    format!("{service} failed after {attempts} recovery attempts{impact}"),
                );
            }
            WatchdogAction::Recovered { service } => self.recovered(service),
        }
    }

    fn recovered(&self, service: ServiceKind) {
        info!(%service, "service healthy again");
        self.health_changed(service, ServiceState::Healthy, self.watchdog.attempts(service));
        self.links
            .alerts
            .raise(AlertSeverity::Info, "watchdog", format!("{service} recovered"));
    }

    /// Run one recovery step. Returns whether it is worth pinging again.
    async fn recover(&self, service: ServiceKind, action: RecoveryAction) -> bool {
        let Some(device) = self.devices.device(service) else {
            return false;
        };
        let result = match action {
            RecoveryAction::HoldLastKnownGood => {
                info!(%service, "holding last known good readings");
                return false;
            }
            RecoveryAction::Reconnect => {
                tokio::time::timeout(self.ping_timeout, device.connect()).await
            }
            RecoveryAction::Reset => tokio::time::timeout(self.ping_timeout, device.reset()).await,
        };
        match result {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(%service, ?action, error = %e, "recovery step failed");
                false
            }
            Err(_) => {
                warn!(%service, ?action, "recovery step timed out");
                false
            }
        }
    }

    fn health_changed(&self, service: ServiceKind, state: ServiceState, attempts: u32) {
        self.links.bus.publish(Event::new(
            SOURCE,
            EventPayload::ServiceHealthChanged {
                service,
                state,
                attempts,
            },
        ));
    }

    fn publish_health(&self) {
        let current: HealthMap = self
            .watchdog
            .services()
            .into_iter()
            .filter_map(|s| self.watchdog.state(s).map(|state| (s, state)))
            .collect();
        self.links.health_tx.send_if_modified(|health| {
            if *health == current {
                false
            } else {
                *health = current;
                true
            }
        });
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        debug!("supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vigil_hal::AlertPolicy;
    use vigil_hal::sim::{RecordingAlertSink, SimOp, SimSite};
    use vigil_middleware::Topic;

    struct Harness {
        site: SimSite,
        health_rx: watch::Receiver<HealthMap>,
        force_rx: mpsc::Receiver<ForcedStage>,
        sink: Arc<RecordingAlertSink>,
        bus: EventBus,
        cancel: CancellationToken,
    }

    fn spawn_supervisor() -> Harness {
        let site = SimSite::new();
        let (health_tx, health_rx) = watch::channel(HealthMap::new());
        let (force_tx, force_rx) = mpsc::channel(4);
        let sink = Arc::new(RecordingAlertSink::new());
        let bus = EventBus::default();
        let links = SupervisorLinks {
            health_tx,
            bus: bus.clone(),
            alerts: AlertDispatcher::spawn(vec![sink.clone()], AlertPolicy::default()),
            force_tx,
        };
        let supervisor = Supervisor::new(site.registry(), &WatchdogConfig::default(), links);
        let cancel = CancellationToken::new();
        tokio::spawn(supervisor.run(cancel.clone()));
        Harness {
            site,
            health_rx,
            force_rx,
            sink,
            bus,
            cancel,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_site_stays_healthy() {
        let h = spawn_supervisor();
        tokio::time::sleep(Duration::from_secs(600)).await;
        let health = h.health_rx.borrow().clone();
        assert_eq!(health.len(), 6);
        assert!(health.values().all(|s| *s == ServiceState::Healthy));
        assert!(h.site.mount.faults.calls(SimOp::Ping) >= 50);
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_weather_station_is_marked_failed() {
        let mut h = spawn_supervisor();
        let mut health_events = h.bus.subscribe_to(Topic::ServiceHealth);
        h.site.weather.faults.set_offline(true);

        tokio::time::sleep(Duration::from_secs(400)).await;

        assert_eq!(
            h.health_rx.borrow().get(&ServiceKind::Weather),
            Some(&ServiceState::Failed)
        );
        // Hold, reconnect, then resets.
        assert!(h.site.weather.faults.calls(SimOp::Connect) >= 1);
        assert!(
            h.sink
                .alerts()
                .iter()
                .any(|a| a.severity == AlertSeverity::Critical && a.message.contains("weather"))
        );
        let first = health_events.next().await.unwrap();
        assert!(matches!(
            first.payload,
            EventPayload::ServiceHealthChanged {
                service: ServiceKind::Weather,
                state: ServiceState::Degraded,
                attempts: 1,
            }
        ));
        // One failed safety service does not force a close.
        assert!(h.force_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn weather_gets_exactly_five_recovery_attempts() {
        let h = spawn_supervisor();
        let mut health_events = h.bus.subscribe_to(Topic::ServiceHealth);
        h.site.weather.faults.set_offline(true);

        tokio::time::sleep(Duration::from_secs(400)).await;

        let mut degraded = Vec::new();
        let mut failed_after = None;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(10), health_events.next()).await
        {
            if let EventPayload::ServiceHealthChanged {
                service: ServiceKind::Weather,
                state,
                attempts,
            } = event.payload
            {
                match state {
                    ServiceState::Degraded => degraded.push(attempts),
                    ServiceState::Failed => failed_after = Some(attempts),
                    ServiceState::Healthy => panic!("weather never came back"),
                }
            }
        }
        assert_eq!(degraded, vec![1, 2, 3, 4, 5]);
        assert_eq!(failed_after, Some(5));
        // Attempt 1 holds cached readings, 2 reconnects, 3..=5 reset.
        assert_eq!(h.site.weather.faults.calls(SimOp::Connect), 4);
        assert!(h.sink.alerts().iter().any(|a| {
            a.message.contains("weather failed after 5 recovery attempts")
                && a.message.contains("stale")
        }));
        h.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn two_failed_safety_services_force_close_once() {
        let mut h = spawn_supervisor();
        h.site.weather.faults.set_offline(true);
        h.site.power.faults.set_offline(true);

        tokio::time::sleep(Duration::from_secs(600)).await;

        let forced = h.force_rx.try_recv().unwrap();
        assert_eq!(forced.stage, EmergencyStage::Close);
        assert!(forced.reason.contains("weather"));
        assert!(forced.reason.contains("power"));
        assert!(h.force_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_brings_mount_back() {
        let h = spawn_supervisor();
        h.site.mount.faults.set_offline(true);
        // Mount timeout is 30 s.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(
            h.health_rx.borrow().get(&ServiceKind::Mount),
            Some(&ServiceState::Degraded)
        );

        h.site.mount.faults.set_offline(false);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(
            h.health_rx.borrow().get(&ServiceKind::Mount),
            Some(&ServiceState::Healthy)
        );
        assert!(h.sink.wait_for(1, Duration::from_secs(1)).await);
    }
}
