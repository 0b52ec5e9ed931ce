//! [`ServiceWatchdog`] – service health and recovery scheduling.
//!
//! The runtime pings every device on its heartbeat interval and reports each
//! successful ping through [`ServiceWatchdog::heartbeat_at`]. A service whose
//! last heartbeat is older than its timeout is marked degraded and recovery
//! starts immediately; further attempts follow an exponential backoff. Once a
//! service has used up its attempts the next due poll marks it failed.
//!
//! ```text
//!   Healthy ──timeout──▶ Degraded ──attempts exhausted──▶ Failed
//!      ▲                    │                               │
//!      └──── heartbeat ─────┴─────────── heartbeat ─────────┘
//! ```
//!
//! The attempt counter is only cleared after a service has stayed healthy for
//! the stable period, so a service that flaps still ends up failed.
//!
//! Time is always passed in, which keeps the scheduling testable without
//! sleeping.
//!
//! # Example
//!
//! ```
//! use std::time::{Duration, Instant};
//! use vigil_kernel::watchdog::{ServiceWatchdog, WatchdogAction, WatchdogConfig};
//! use vigil_types::{ServiceKind, ServiceState};
//!
//! let start = Instant::now();
//! let mut wd = ServiceWatchdog::new(&WatchdogConfig::default(), start);
//!
//! // The mount misses its 30 s deadline.
//! let actions = wd.poll_at(start + Duration::from_secs(31));
//! assert!(matches!(
//!     actions.as_slice(),
//!     [WatchdogAction::Recover { service: ServiceKind::Mount, attempt: 1, .. }]
//! ));
//! assert_eq!(wd.state(ServiceKind::Mount), Some(ServiceState::Degraded));
//! ```

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use vigil_types::{ServiceKind, ServiceState};

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Per-service supervision settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePolicy {
    /// How often the service is pinged.
    pub heartbeat_secs: u64,
    /// Silence longer than this marks the service degraded.
    pub timeout_secs: u64,
    pub max_attempts: u32,
    /// Whether losing this service compromises observatory safety.
    pub safety_relevant: bool,
}

impl ServicePolicy {
    pub fn defaults_for(service: ServiceKind) -> Self {
        let (heartbeat_secs, timeout_secs, max_attempts, safety_relevant) = match service {
            ServiceKind::Mount => (10, 30, 3, true),
            ServiceKind::Weather => (60, 120, 5, true),
            ServiceKind::Camera => (30, 90, 3, false),
            ServiceKind::Enclosure => (30, 60, 2, true),
            ServiceKind::Power => (30, 60, 3, true),
            ServiceKind::Ephemeris => (60, 180, 3, false),
        };
        Self {
            heartbeat_secs,
            timeout_secs,
            max_attempts,
            safety_relevant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Watchdog tick.
    pub check_interval_secs: u64,
    /// Deadline for a single ping.
    pub ping_timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_secs: u64,
    /// Healthy time after which the attempt counter is cleared.
    pub stable_period_secs: u64,
    /// Entries given in a config file replace the default policy of that
    /// service only; services left out keep their defaults.
    #[serde(deserialize_with = "services_over_defaults")]
    pub services: BTreeMap<ServiceKind, ServicePolicy>,
}

fn default_services() -> BTreeMap<ServiceKind, ServicePolicy> {
    ServiceKind::ALL
        .into_iter()
        .map(|s| (s, ServicePolicy::defaults_for(s)))
        .collect()
}

fn services_over_defaults<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<ServiceKind, ServicePolicy>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let overrides = BTreeMap::<ServiceKind, ServicePolicy>::deserialize(deserializer)?;
    let mut services = default_services();
    services.extend(overrides);
    Ok(services)
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            ping_timeout_secs: 5,
            backoff_base_secs: 5,
            backoff_multiplier: 2.0,
            backoff_max_secs: 60,
            stable_period_secs: 300,
            services: default_services(),
        }
    }
}

impl WatchdogConfig {
    /// Delay before attempt `attempt + 1`, i.e. `base * multiplier^(attempt-1)`
    /// capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.backoff_base_secs as f64 * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.backoff_max_secs as f64).max(0.0))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Actions
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Drop and re-establish the connection.
    Reconnect,
    /// Full device reset.
    Reset,
    /// Do nothing to the device and keep serving its last good readings.
    HoldLastKnownGood,
}

impl RecoveryAction {
    /// Sensor services first ride out a blip on cached readings; actuators are
    /// reconnected straight away. Later attempts escalate to a reset.
    pub fn for_attempt(service: ServiceKind, attempt: u32) -> Self {
        let sensor = matches!(
            service,
            ServiceKind::Weather | ServiceKind::Power | ServiceKind::Ephemeris
        );
        match (sensor, attempt) {
            (true, 1) => RecoveryAction::HoldLastKnownGood,
            (true, 2) | (false, 1) => RecoveryAction::Reconnect,
            _ => RecoveryAction::Reset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Recover {
        service: ServiceKind,
        action: RecoveryAction,
        attempt: u32,
    },
    MarkedFailed {
        service: ServiceKind,
    },
    Recovered {
        service: ServiceKind,
    },
}

// ────────────────────────────────────────────────────────────────────────────
// Watchdog
// ────────────────────────────────────────────────────────────────────────────

struct Entry {
    policy: ServicePolicy,
    state: ServiceState,
    last_heartbeat: Instant,
    last_ping: Option<Instant>,
    healthy_since: Instant,
    attempts: u32,
    next_attempt_at: Option<Instant>,
}

pub struct ServiceWatchdog {
    config: WatchdogConfig,
    entries: BTreeMap<ServiceKind, Entry>,
}

impl ServiceWatchdog {
    /// Register every service in `config`, all healthy as of `now`.
    pub fn new(config: &WatchdogConfig, now: Instant) -> Self {
        let mut wd = Self {
            config: config.clone(),
            entries: BTreeMap::new(),
        };
        for (service, policy) in &config.services {
            wd.register(*service, policy.clone(), now);
        }
        wd
    }

    /// Add or replace a service. Re-registering resets its history.
    pub fn register(&mut self, service: ServiceKind, policy: ServicePolicy, now: Instant) {
        self.entries.insert(
            service,
            Entry {
                policy,
                state: ServiceState::Healthy,
                last_heartbeat: now,
                last_ping: None,
                healthy_since: now,
                attempts: 0,
                next_attempt_at: None,
            },
        );
    }

    pub fn services(&self) -> Vec<ServiceKind> {
        self.entries.keys().copied().collect()
    }

    /// Record a successful ping. Returns [`WatchdogAction::Recovered`] when
    /// the service was degraded or failed.
    pub fn heartbeat_at(&mut self, service: ServiceKind, now: Instant) -> Option<WatchdogAction> {
        let stable = Duration::from_secs(self.config.stable_period_secs);
        let entry = self.entries.get_mut(&service)?;
        entry.last_heartbeat = now;

        if entry.state == ServiceState::Healthy {
            if entry.attempts > 0 && now.duration_since(entry.healthy_since) >= stable {
                entry.attempts = 0;
            }
            return None;
        }

        info!(%service, attempts = entry.attempts, "service recovered");
        entry.state = ServiceState::Healthy;
        entry.healthy_since = now;
        entry.next_attempt_at = None;
        Some(WatchdogAction::Recovered { service })
    }

    /// Services whose heartbeat interval has elapsed since they were last
    /// pinged. Marks them as pinged at `now`.
    pub fn due_for_ping(&mut self, now: Instant) -> Vec<ServiceKind> {
        let mut due = Vec::new();
        for (service, entry) in self.entries.iter_mut() {
            let interval = Duration::from_secs(entry.policy.heartbeat_secs);
            let is_due = entry
                .last_ping
                .is_none_or(|t| now.duration_since(t) >= interval);
            if is_due {
                entry.last_ping = Some(now);
                due.push(*service);
            }
        }
        due
    }

    /// Advance every service's state machine to `now`.
    pub fn poll_at(&mut self, now: Instant) -> Vec<WatchdogAction> {
        let mut actions = Vec::new();
        for (service, entry) in self.entries.iter_mut() {
            let service = *service;
            match entry.state {
                ServiceState::Healthy => {
                    let timeout = Duration::from_secs(entry.policy.timeout_secs);
                    if now.duration_since(entry.last_heartbeat) <= timeout {
                        continue;
                    }
                    if entry.attempts >= entry.policy.max_attempts {
                        warn!(%service, attempts = entry.attempts, "service failed again before stabilising");
                        entry.state = ServiceState::Failed;
                        entry.next_attempt_at = None;
                        actions.push(WatchdogAction::MarkedFailed { service });
                        continue;
                    }
                    entry.state = ServiceState::Degraded;
                    entry.attempts += 1;
                    warn!(%service, attempt = entry.attempts, "heartbeat missed, starting recovery");
                    entry.next_attempt_at = Some(now + self.config.backoff(entry.attempts));
                    actions.push(WatchdogAction::Recover {
                        service,
                        action: RecoveryAction::for_attempt(service, entry.attempts),
                        attempt: entry.attempts,
                    });
                }
                ServiceState::Degraded => {
                    let Some(due) = entry.next_attempt_at else {
                        continue;
                    };
                    if now < due {
                        continue;
                    }
                    if entry.attempts >= entry.policy.max_attempts {
                        warn!(%service, attempts = entry.attempts, "recovery attempts exhausted");
                        entry.state = ServiceState::Failed;
                        entry.next_attempt_at = None;
                        actions.push(WatchdogAction::MarkedFailed { service });
                        continue;
                    }
                    entry.attempts += 1;
                    entry.next_attempt_at = Some(now + self.config.backoff(entry.attempts));
                    actions.push(WatchdogAction::Recover {
                        service,
                        action: RecoveryAction::for_attempt(service, entry.attempts),
                        attempt: entry.attempts,
                    });
                }
                ServiceState::Failed => {}
            }
        }
        actions
    }

    pub fn state(&self, service: ServiceKind) -> Option<ServiceState> {
        self.entries.get(&service).map(|e| e.state)
    }

    pub fn attempts(&self, service: ServiceKind) -> u32 {
        self.entries.get(&service).map(|e| e.attempts).unwrap_or(0)
    }

    pub fn is_safety_relevant(&self, service: ServiceKind) -> bool {
        self.entries
            .get(&service)
            .is_some_and(|e| e.policy.safety_relevant)
    }

    pub fn failed_safety_relevant(&self) -> Vec<ServiceKind> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == ServiceState::Failed && e.policy.safety_relevant)
            .map(|(s, _)| *s)
            .collect()
    }

    /// More than one safety-relevant service has failed: the observatory can
    /// no longer judge or act on conditions and must close.
    pub fn requires_forced_close(&self) -> bool {
        self.failed_safety_relevant().len() > 1
    }
}
