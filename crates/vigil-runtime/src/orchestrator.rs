//! [`Orchestrator`] – owns the site and runs every safety task.
//!
//! [`Orchestrator::start`] restores the last verdict, hysteresis state and
//! emergency stage from the journal, then spawns:
//!
//! | Task | Reads | Writes |
//! |---|---|---|
//! | condition monitor | sensors, service health | verdict, battery |
//! | emergency responder | verdict, battery, forced stages | stage |
//! | supervisor | device pings | service health, forced stages |
//! | executor workers | command queue, verdict | devices |
//! | rain-interrupt watcher | enclosure rain line | forced stages |
//! | journal archiver | every bus event | journal |
//!
//! The tasks share no locks on safety state; they talk through `watch`
//! channels, one `mpsc` lane for forced stages and the event bus.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vigil_hal::{AlertDispatcher, AlertPolicy, AlertSink, DeviceRegistry};
use vigil_kernel::{
    BatteryLadder, EmergencyConfig, Interlock, RainHoldoff, WatchdogConfig, rain_holdoff_status,
};
use vigil_memory::{Journal, JournalKind, RecoveredState};
use vigil_middleware::{EventBus, Topic, TopicReceiver};
use vigil_types::{
    AlertSeverity, CommandKind, CommandOutcome, CommandRequest, EmergencyStage, Event,
    EventPayload, HysteresisState, Priority, SafetyVerdict, ThresholdSet, VigilError,
};

use crate::executor::{CommandTicket, Executor, ExecutorConfig, QueueStats};
use crate::monitor::{ConditionMonitor, MonitorLinks};
use crate::responder::{
    EmergencyEvent, EmergencyResponder, ForcedStage, ResponderHistory, ResponderLinks,
};
use crate::supervisor::{HealthMap, Supervisor, SupervisorLinks};
use crate::{SharedJournal, record};

const SOURCE: &str = "vigil-runtime::orchestrator";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub site_name: String,
    pub poll_interval: Duration,
    /// Bound on every sensor poll.
    pub device_timeout: Duration,
    pub thresholds: ThresholdSet,
    pub emergency: EmergencyConfig,
    pub executor: ExecutorConfig,
    pub watchdog: WatchdogConfig,
    pub alerts: AlertPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            site_name: "vigil".into(),
            poll_interval: Duration::from_secs(10),
            device_timeout: Duration::from_secs(5),
            thresholds: ThresholdSet::default(),
            emergency: EmergencyConfig::default(),
            executor: ExecutorConfig::default(),
            watchdog: WatchdogConfig::default(),
            alerts: AlertPolicy::default(),
        }
    }
}

/// Whether the observatory ended up in a safe configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SafingReport {
    pub parked: bool,
    pub closed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteStatus {
    pub site_name: String,
    pub verdict: Arc<SafetyVerdict>,
    pub stage: EmergencyStage,
    pub rain_holdoff: RainHoldoff,
    pub session: Option<String>,
    pub services: HealthMap,
    pub pending_commands: usize,
    pub queue: QueueStats,
    pub last_emergency: Option<EmergencyEvent>,
}

#[derive(Serialize)]
struct SessionRecord<'a> {
    session_id: &'a str,
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<SafingReport>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    bus: EventBus,
    alerts: AlertDispatcher,
    executor: Executor,
    journal: Option<SharedJournal>,
    verdict_rx: watch::Receiver<Arc<SafetyVerdict>>,
    hysteresis_rx: watch::Receiver<HysteresisState>,
    stage_rx: watch::Receiver<EmergencyStage>,
    health_rx: watch::Receiver<HealthMap>,
    force_tx: mpsc::Sender<ForcedStage>,
    history: ResponderHistory,
    session: Mutex<Option<String>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Restore state and start every task on the current Tokio runtime.
    pub fn start(
        config: OrchestratorConfig,
        devices: DeviceRegistry,
        journal: Option<Journal>,
        sinks: Vec<Arc<dyn AlertSink>>,
    ) -> Result<Self, VigilError> {
        config.thresholds.validate()?;

        let recovered = match &journal {
            Some(journal) => journal.recover()?,
            None => RecoveredState::default(),
        };
        let initial_verdict = Arc::new(
            recovered
                .verdict
                .clone()
                .unwrap_or_else(|| SafetyVerdict::awaiting_data(Utc::now())),
        );
        info!(
            site = %config.site_name,
            verdict = %initial_verdict.level(),
            stage = %recovered.stage,
            "starting safety core"
        );

        let journal = journal.map(|j| Arc::new(Mutex::new(j)));
        let bus = EventBus::default();
        let alerts = AlertDispatcher::spawn(sinks, config.alerts.clone());
        let cancel = CancellationToken::new();

        let (verdict_tx, verdict_rx) = watch::channel(initial_verdict);
        let (battery_tx, battery_rx) = watch::channel(None);
        let (hysteresis_tx, hysteresis_rx) = watch::channel(recovered.hysteresis.clone());
        let (health_tx, health_rx) = watch::channel(HealthMap::new());
        let (stage_tx, stage_rx) = watch::channel(recovered.stage);
        let (force_tx, force_rx) = mpsc::channel(16);

        let mut tasks = Vec::new();

        let monitor = ConditionMonitor::new(
            devices.clone(),
            config.thresholds.clone(),
            recovered.hysteresis,
            config.device_timeout,
            MonitorLinks {
                verdict_tx,
                battery_tx,
                hysteresis_tx,
                health_rx: health_rx.clone(),
                bus: bus.clone(),
                alerts: alerts.clone(),
                journal: journal.clone(),
            },
        );
        tasks.push(tokio::spawn(monitor.run(config.poll_interval, cancel.clone())));

        let responder = EmergencyResponder::new(
            devices.clone(),
            config.emergency.clone(),
            BatteryLadder::from(&config.thresholds),
            recovered.stage,
            ResponderLinks {
                stage_tx,
                bus: bus.clone(),
                alerts: alerts.clone(),
                journal: journal.clone(),
            },
        );
        let history = responder.history();
        tasks.push(tokio::spawn(responder.run(
            verdict_rx.clone(),
            battery_rx,
            force_rx,
            cancel.clone(),
        )));

        let supervisor = Supervisor::new(
            devices.clone(),
            &config.watchdog,
            SupervisorLinks {
                health_tx,
                bus: bus.clone(),
                alerts: alerts.clone(),
                force_tx: force_tx.clone(),
            },
        );
        tasks.push(tokio::spawn(supervisor.run(cancel.clone())));

        let executor = Executor::new(
            devices.clone(),
            Interlock::standard(&config.thresholds),
            verdict_rx.clone(),
            bus.clone(),
            journal.clone(),
            config.executor.clone(),
        );
        tasks.extend(executor.spawn_workers(cancel.clone()));

        if let Some(rain_rx) = devices.enclosure().rain_interrupt() {
            tasks.push(tokio::spawn(watch_rain_line(
                rain_rx,
                force_tx.clone(),
                alerts.clone(),
                cancel.clone(),
            )));
        }

        if journal.is_some() {
            tasks.push(tokio::spawn(archive_events(
                bus.subscribe_all(),
                journal.clone(),
                cancel.clone(),
            )));
        }

        Ok(Self {
            config,
            bus,
            alerts,
            executor,
            journal,
            verdict_rx,
            hysteresis_rx,
            stage_rx,
            health_rx,
            force_tx,
            history,
            session: Mutex::new(None),
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    // ── Read side ────────────────────────────────────────────────────────────

    pub fn verdict(&self) -> Arc<SafetyVerdict> {
        self.verdict_rx.borrow().clone()
    }

    /// Receiver that sees every published verdict.
    pub fn watch_verdict(&self) -> watch::Receiver<Arc<SafetyVerdict>> {
        self.verdict_rx.clone()
    }

    pub fn stage(&self) -> EmergencyStage {
        *self.stage_rx.borrow()
    }

    pub fn watch_stage(&self) -> watch::Receiver<EmergencyStage> {
        self.stage_rx.clone()
    }

    /// Whether the post-rain holdoff is keeping the roof shut right now.
    pub fn rain_holdoff(&self) -> RainHoldoff {
        rain_holdoff_status(&self.hysteresis_rx.borrow(), Utc::now(), &self.config.thresholds)
    }

    pub fn services(&self) -> HealthMap {
        self.health_rx.borrow().clone()
    }

    pub fn emergency_history(&self) -> Vec<EmergencyEvent> {
        self.history.events()
    }

    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        self.bus.subscribe_to(topic)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn status(&self) -> SiteStatus {
        SiteStatus {
            site_name: self.config.site_name.clone(),
            verdict: self.verdict(),
            stage: self.stage(),
            rain_holdoff: self.rain_holdoff(),
            session: self.session.lock().clone(),
            services: self.services(),
            pending_commands: self.executor.pending().len(),
            queue: self.executor.queue_stats(),
            last_emergency: self.history.last(),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    pub fn submit(&self, request: CommandRequest) -> Result<CommandTicket, VigilError> {
        if self.cancel.is_cancelled() {
            return Err(VigilError::NotRunning("safety core".into()));
        }
        self.executor.submit(request)
    }

    pub fn cancel(&self, id: Uuid) -> bool {
        self.executor.cancel(id)
    }

    pub fn pending(&self) -> Vec<CommandRequest> {
        self.executor.pending()
    }

    /// Push the emergency machine forward, e.g. on an operator's request.
    pub async fn force_stage(
        &self,
        stage: EmergencyStage,
        reason: impl Into<String>,
    ) -> Result<(), VigilError> {
        self.force_tx
            .send(ForcedStage {
                stage,
                reason: reason.into(),
            })
            .await
            .map_err(|_| VigilError::NotRunning("emergency responder".into()))
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// Begin an observing session. Returns the active session's id if one is
    /// already running.
    pub fn start_session(&self, id: Option<String>) -> String {
        let mut session = self.session.lock();
        if let Some(active) = session.as_ref() {
            debug!(session = %active, "session already active");
            return active.clone();
        }
        let id = id.unwrap_or_else(|| Utc::now().format("%Y%m%d_%H%M%S").to_string());
        *session = Some(id.clone());
        drop(session);

        info!(session = %id, "session started");
        record(
            &self.journal,
            JournalKind::Session,
            &SessionRecord {
                session_id: &id,
                active: true,
                report: None,
            },
        );
        self.bus.publish(Event::new(
            SOURCE,
            EventPayload::SessionStarted {
                session_id: id.clone(),
            },
        ));
        id
    }

    pub fn session(&self) -> Option<String> {
        self.session.lock().clone()
    }

    /// End the active session, optionally parking and closing first.
    pub async fn end_session(&self, park: bool, close: bool) -> Result<SafingReport, VigilError> {
        let id = self
            .session
            .lock()
            .take()
            .ok_or_else(|| VigilError::NotRunning("observing session".into()))?;

        let report = self.safe_site(park, close, "session").await;
        info!(session = %id, parked = report.parked, closed = report.closed, "session ended");
        record(
            &self.journal,
            JournalKind::Session,
            &SessionRecord {
                session_id: &id,
                active: false,
                report: Some(report),
            },
        );
        self.bus.publish(Event::new(
            SOURCE,
            EventPayload::SessionEnded {
                session_id: id,
                parked: report.parked,
                closed: report.closed,
            },
        ));
        Ok(report)
    }

    async fn safe_site(&self, park: bool, close: bool, origin: &str) -> SafingReport {
        let mut report = SafingReport::default();
        if park {
            report.parked = self.run_to_completion(CommandKind::Park, origin).await;
        }
        if close {
            report.closed = self.run_to_completion(CommandKind::RoofClose, origin).await;
        }
        report
    }

    async fn run_to_completion(&self, kind: CommandKind, origin: &str) -> bool {
        let command = kind.command_type();
        let request = CommandRequest::new(kind, Priority::Interactive, origin);
        match self.executor.submit(request) {
            Ok(ticket) => match ticket.outcome().await {
                CommandOutcome::Completed => true,
                other => {
                    warn!(%command, outcome = ?other, "safing command did not complete");
                    false
                }
            },
            Err(e) => {
                error!(%command, error = %e, "safing command rejected");
                false
            }
        }
    }

    /// Stop every task. With `safe`, park and close first. Ends any active
    /// session.
    pub async fn shutdown(&self, safe: bool) -> SafingReport {
        let report = if self.session.lock().is_some() {
            self.end_session(safe, safe).await.unwrap_or_default()
        } else if safe {
            self.safe_site(true, true, "shutdown").await
        } else {
            SafingReport::default()
        };
        if safe && !(report.parked && report.closed) {
            self.alerts.raise(
                AlertSeverity::Critical,
                "orchestrator",
                format!(
                    "shutdown left the site unsafe (parked: {}, closed: {})",
                    report.parked, report.closed
                ),
            );
        }

        self.executor.close();
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "task ended abnormally");
            }
        }
        info!(parked = report.parked, closed = report.closed, "safety core stopped");
        report
    }
}

async fn watch_rain_line(
    mut rain_rx: watch::Receiver<bool>,
    force_tx: mpsc::Sender<ForcedStage>,
    alerts: AlertDispatcher,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rain_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if !*rain_rx.borrow_and_update() {
                    continue;
                }
                error!("hardware rain interrupt");
                alerts.raise(AlertSeverity::Emergency, "enclosure", "rain sensor tripped, closing");
                let forced = ForcedStage {
                    stage: EmergencyStage::Close,
                    reason: "hardware rain interrupt".into(),
                };
                if force_tx.send(forced).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn archive_events(
    mut events: TopicReceiver,
    journal: Option<SharedJournal>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => record(&journal, JournalKind::Observation, &event),
                None => break,
            },
        }
    }
}
