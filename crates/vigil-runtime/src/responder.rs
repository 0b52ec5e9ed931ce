//! [`EmergencyResponder`] – executes emergency stage plans against devices.
//!
//! The responder follows the verdict and battery `watch` channels. A plan is
//! run only when the stage changes, never on every cycle. Within a plan each
//! action gets `max_retries` attempts, each attempt bounded by the action's
//! timeout, and the plan as a whole is bounded by the stage timeout.
//!
//! Plans run on their own task so the responder keeps listening while one is
//! in flight. A verdict or forced stage that calls for a more severe stage
//! cancels the running plan and starts the new one straight away; a slow park
//! never holds the roof open once rain arrives. A return to `WARNING` waits
//! for the running plan to finish.
//!
//! When a blocking action exhausts its retries the stage has failed: an
//! `EmergencyStageFailed` event and a `CRITICAL` alert go out and the machine
//! escalates to the next stage with a rushed plan. `SHUTDOWN` has nowhere to
//! escalate to; a failure there is alerted and the stage is kept.
//!
//! ```text
//!   verdict ─┐
//!   battery ─┼──► target_stage ─► transition ─► begin(stage) ─► plan task
//!   force  ──┘                                    │ more severe   │ failed
//!                                                 └─ cancel ◄─────┴──► next stage (rushed)
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use vigil_hal::{AlertDispatcher, DeviceRegistry};
use vigil_kernel::{
    BatteryLadder, EmergencyConfig, StageAction, StagePlan, target_stage, transition,
};
use vigil_memory::JournalKind;
use vigil_middleware::EventBus;
use vigil_types::{
    AlertSeverity, EmergencyStage, EnclosureState, Event, EventPayload, SafetyVerdict,
    VerdictLevel, VigilError,
};

use crate::{SharedJournal, record};

const SOURCE: &str = "vigil-runtime::responder";
const HISTORY_LIMIT: usize = 100;

/// A request from another task to push the machine forward.
#[derive(Debug, Clone)]
pub struct ForcedStage {
    pub stage: EmergencyStage,
    pub reason: String,
}

/// One stage entry and what happened while executing its plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmergencyEvent {
    pub at: DateTime<Utc>,
    pub from: EmergencyStage,
    pub to: EmergencyStage,
    pub reason: String,
    /// Actions that completed.
    pub actions: Vec<StageAction>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponderStatus {
    pub stage: EmergencyStage,
    pub last_event: Option<EmergencyEvent>,
    pub transitions: usize,
    /// A stage plan is executing right now.
    pub plan_running: bool,
}

/// Shared, bounded log of stage entries. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ResponderHistory(Arc<Mutex<VecDeque<EmergencyEvent>>>);

impl ResponderHistory {
    fn push(&self, event: EmergencyEvent) {
        let mut log = self.0.lock();
        if log.len() == HISTORY_LIMIT {
            log.pop_front();
        }
        log.push_back(event);
    }

    pub fn events(&self) -> Vec<EmergencyEvent> {
        self.0.lock().iter().cloned().collect()
    }

    pub fn last(&self) -> Option<EmergencyEvent> {
        self.0.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

pub struct ResponderLinks {
    pub stage_tx: watch::Sender<EmergencyStage>,
    pub bus: EventBus,
    pub alerts: AlertDispatcher,
    pub journal: Option<SharedJournal>,
}

#[derive(Default)]
struct StageReport {
    completed: Vec<StageAction>,
    errors: Vec<String>,
    failed: bool,
}

/// Device access and outputs a plan task needs. Shared with every plan task.
struct PlanRunner {
    devices: DeviceRegistry,
    config: EmergencyConfig,
    history: ResponderHistory,
    links: ResponderLinks,
}

struct RunningPlan {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct EmergencyResponder {
    runner: Arc<PlanRunner>,
    ladder: BatteryLadder,
    running: Option<RunningPlan>,
    /// A return to `WARNING` arrived while a plan was running.
    deferred: bool,
}

impl EmergencyResponder {
    /// `stage` is where the machine resumes, usually the journaled stage.
    /// Resuming does not re-run that stage's plan.
    pub fn new(
        devices: DeviceRegistry,
        config: EmergencyConfig,
        ladder: BatteryLadder,
        stage: EmergencyStage,
        links: ResponderLinks,
    ) -> Self {
        links.stage_tx.send_replace(stage);
        Self {
            runner: Arc::new(PlanRunner {
                devices,
                config,
                history: ResponderHistory::default(),
                links,
            }),
            ladder,
            running: None,
            deferred: false,
        }
    }

    pub fn stage(&self) -> EmergencyStage {
        *self.runner.links.stage_tx.borrow()
    }

    pub fn history(&self) -> ResponderHistory {
        self.runner.history.clone()
    }

    pub fn status(&self) -> ResponderStatus {
        ResponderStatus {
            stage: self.stage(),
            last_event: self.runner.history.last(),
            transitions: self.runner.history.len(),
            plan_running: self.plan_running(),
        }
    }

    /// React to a new verdict and battery level. Returns the stage once any
    /// plan it started has finished.
    pub async fn on_verdict(
        &mut self,
        verdict: &SafetyVerdict,
        battery_pct: Option<f64>,
    ) -> EmergencyStage {
        self.react(verdict, battery_pct).await;
        self.settle().await;
        self.stage()
    }

    /// Push the machine to `stage` if it is ahead of the current one. Returns
    /// the stage once the plan has finished.
    pub async fn force(&mut self, stage: EmergencyStage, reason: impl Into<String>) -> EmergencyStage {
        self.escalate(stage, reason.into()).await;
        self.settle().await;
        self.stage()
    }

    /// Start whatever `verdict` calls for without waiting on the plan.
    async fn react(&mut self, verdict: &SafetyVerdict, battery_pct: Option<f64>) {
        let current = self.stage();
        let target = target_stage(verdict.level(), battery_pct, &self.ladder);
        let next = transition(current, target, verdict.level());
        if next == current {
            return;
        }
        if next < current && self.plan_running() {
            debug!(%current, %next, "plan in flight, return to lower stage deferred");
            self.deferred = true;
            return;
        }
        let reason = match battery_pct {
            Some(pct) if pct <= self.ladder.park_pct => {
                format!("{} (battery {pct:.0}%)", verdict.summary())
            }
            _ => verdict.summary(),
        };
        let rushed = verdict.level() == VerdictLevel::Emergency;
        self.begin(next, reason, rushed).await;
    }

    async fn escalate(&mut self, stage: EmergencyStage, reason: String) {
        let current = self.stage();
        if stage > current {
            self.begin(stage, reason, true).await;
        } else {
            debug!(%current, requested = %stage, "forced stage not ahead, ignored");
        }
    }

    fn plan_running(&self) -> bool {
        self.running.as_ref().is_some_and(|p| !p.handle.is_finished())
    }

    /// Cancel any plan in flight and start the plan for `stage`.
    async fn begin(&mut self, stage: EmergencyStage, reason: String, rushed: bool) {
        let mut preempted = false;
        if let Some(previous) = self.running.take() {
            if !previous.handle.is_finished() {
                info!(to = %stage, "preempting the running stage plan");
                preempted = true;
            }
            previous.cancel.cancel();
            if let Err(e) = previous.handle.await {
                error!(error = %e, "stage plan task ended abnormally");
            }
        }
        self.deferred = false;

        let from = self.stage();
        // The cancelled plan may have escalated past `stage` before it stopped.
        let stage = if preempted { stage.max(from) } else { stage };
        self.runner.announce(from, stage, &reason);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.runner.clone().execute_from(
            from,
            stage,
            reason,
            rushed,
            cancel.clone(),
        ));
        self.running = Some(RunningPlan { cancel, handle });
    }

    /// Wait for the running plan, if any, to finish.
    async fn settle(&mut self) {
        if let Some(plan) = self.running.take() {
            if let Err(e) = plan.handle.await {
                error!(error = %e, "stage plan task ended abnormally");
            }
        }
    }

    /// Follow the verdict, battery and forced-stage channels until `cancel`
    /// fires or the verdict channel closes.
    pub async fn run(
        mut self,
        mut verdict_rx: watch::Receiver<Arc<SafetyVerdict>>,
        battery_rx: watch::Receiver<Option<f64>>,
        mut force_rx: mpsc::Receiver<ForcedStage>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(forced) = force_rx.recv() => {
                    self.escalate(forced.stage, forced.reason).await;
                }
                changed = verdict_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let verdict = verdict_rx.borrow_and_update().clone();
                    let battery = *battery_rx.borrow();
                    self.react(&verdict, battery).await;
                }
                finished = plan_finished(&mut self.running) => {
                    self.running = None;
                    if let Err(e) = finished {
                        error!(error = %e, "stage plan task ended abnormally");
                    }
                    if std::mem::take(&mut self.deferred) {
                        let verdict = verdict_rx.borrow().clone();
                        let battery = *battery_rx.borrow();
                        self.react(&verdict, battery).await;
                    }
                }
            }
        }
        if let Some(plan) = self.running.take() {
            plan.cancel.cancel();
            let _ = plan.handle.await;
        }
        debug!(stage = %self.stage(), "emergency responder stopped");
    }
}

/// Resolves when the running plan's task ends; never resolves without one.
async fn plan_finished(running: &mut Option<RunningPlan>) -> Result<(), tokio::task::JoinError> {
    match running {
        Some(plan) => (&mut plan.handle).await,
        None => std::future::pending().await,
    }
}

impl PlanRunner {
    fn announce(&self, from: EmergencyStage, to: EmergencyStage, reason: &str) {
        if from == to {
            info!(stage = %to, %reason, "restarting emergency stage plan");
            return;
        }
        self.links.stage_tx.send_replace(to);
        record(&self.links.journal, JournalKind::Stage, &to);
        info!(%from, %to, %reason, "emergency stage changed");
        self.links.bus.publish(Event::new(
            SOURCE,
            EventPayload::EmergencyStageChanged {
                from,
                to,
                reason: reason.to_string(),
            },
        ));
    }

    /// Run the plan for `stage`, escalating on failure, until a plan succeeds,
    /// `SHUTDOWN` fails, or `cancel` fires.
    #[instrument(skip(self, reason, cancel))]
    async fn execute_from(
        self: Arc<Self>,
        mut from: EmergencyStage,
        mut stage: EmergencyStage,
        mut reason: String,
        mut rushed: bool,
        cancel: CancellationToken,
    ) {
        loop {
            let plan = StagePlan::for_stage(stage, rushed);
            let mut report = StageReport::default();
            let preempted = tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                bounded = tokio::time::timeout(
                    self.config.stage_timeout(),
                    self.execute(&plan, &reason, &mut report),
                ) => {
                    if bounded.is_err() {
                        report.failed = true;
                        report
                            .errors
                            .push(format!("stage timed out after {}s", self.config.stage_timeout_secs));
                    }
                    false
                }
            };
            if preempted {
                warn!(%stage, "stage plan preempted");
                report.errors.push("preempted by a more severe stage".to_string());
            }

            self.history.push(EmergencyEvent {
                at: Utc::now(),
                from,
                to: stage,
                reason: reason.clone(),
                actions: report.completed.clone(),
                errors: report.errors.clone(),
            });

            if preempted || !report.failed {
                return;
            }

            let details = report.errors.join("; ");
            error!(%stage, %details, "emergency stage failed");
            self.links.bus.publish(Event::new(
                SOURCE,
                EventPayload::EmergencyStageFailed {
                    stage,
                    details: details.clone(),
                },
            ));
            self.links.alerts.raise(
                AlertSeverity::Critical,
                "responder",
                VigilError::EmergencyStageFailed {
                    stage,
                    details: details.clone(),
                }
                .to_string(),
            );

            let Some(next) = stage.next() else {
                return;
            };
            reason = format!("{stage} failed: {details}");
            self.announce(stage, next, &reason);
            from = stage;
            stage = next;
            rushed = true;
        }
    }

    async fn execute(&self, plan: &StagePlan, reason: &str, report: &mut StageReport) {
        for &action in &plan.actions {
            match self.run_action(plan, action, reason).await {
                Ok(()) => report.completed.push(action),
                Err(e) => {
                    report.errors.push(format!("{action:?}: {e}"));
                    if plan.is_blocking(action) {
                        report.failed = true;
                        return;
                    }
                    warn!(?action, error = %e, "non-blocking action failed, continuing");
                }
            }
        }
    }

    async fn run_action(
        &self,
        plan: &StagePlan,
        action: StageAction,
        reason: &str,
    ) -> Result<(), VigilError> {
        let attempts = plan.attempts_for(action, &self.config);
        let timeout = self.config.action_timeout(action);
        let mut last = None;
        for attempt in 1..=attempts {
            let outcome = match tokio::time::timeout(timeout, self.perform(plan.stage, action, reason)).await {
                Ok(result) => result,
                Err(_) => Err(VigilError::fault(
                    format!("{action:?}"),
                    format!("timed out after {}s", timeout.as_secs()),
                )),
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(?action, attempt, attempts, error = %e, "stage action failed");
                    last = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| VigilError::fault(format!("{action:?}"), "no attempts made")))
    }

    async fn perform(
        &self,
        stage: EmergencyStage,
        action: StageAction,
        reason: &str,
    ) -> Result<(), VigilError> {
        match action {
            StageAction::Alert => {
                let severity = match stage {
                    EmergencyStage::Warning => AlertSeverity::Info,
                    EmergencyStage::Park => AlertSeverity::Warning,
                    EmergencyStage::Close => AlertSeverity::Critical,
                    EmergencyStage::Shutdown => AlertSeverity::Emergency,
                };
                if self.links.alerts.raise(severity, "responder", format!("{stage}: {reason}")) {
                    Ok(())
                } else {
                    Err(VigilError::Channel("alert queue unavailable".into()))
                }
            }
            StageAction::StopMount => {
                let mount = self.devices.mount();
                if mount.state().await?.is_parked() {
                    return Ok(());
                }
                mount.stop().await.map(|_| ())
            }
            StageAction::ParkMount => {
                let mount = self.devices.mount();
                if mount.state().await?.is_parked() {
                    return Ok(());
                }
                let state = mount.park().await?;
                if state.is_parked() {
                    Ok(())
                } else {
                    Err(VigilError::fault("mount", format!("park ended {:?}", state.status)))
                }
            }
            StageAction::VerifyParked => {
                if self.devices.mount().is_parked().await? {
                    Ok(())
                } else {
                    Err(VigilError::fault("mount", "not parked"))
                }
            }
            StageAction::CloseEnclosure => {
                let enclosure = self.devices.enclosure();
                if enclosure.state().await? == EnclosureState::Closed {
                    return Ok(());
                }
                enclosure.close().await.map(|_| ())
            }
            StageAction::VerifyClosed => match self.devices.enclosure().state().await? {
                EnclosureState::Closed => Ok(()),
                other => Err(VigilError::fault("enclosure", format!("not closed ({other:?})"))),
            },
            StageAction::CutLoads => self.devices.power().cut_loads().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vigil_hal::sim::{RecordingAlertSink, SimOp, SimSite, SimTiming};
    use vigil_hal::AlertPolicy;
    use vigil_memory::Journal;
    use vigil_middleware::Topic;
    use vigil_types::{MountStatus, Trigger, VerdictReason};

    fn verdict(level: VerdictLevel, trigger: Trigger) -> SafetyVerdict {
        let reasons = if level == VerdictLevel::Safe {
            vec![]
        } else {
            vec![VerdictReason {
                trigger,
                metric: None,
                level,
                message: format!("{trigger:?}"),
                measured: 0.0,
                threshold: 0.0,
            }]
        };
        SafetyVerdict::from_reasons(reasons, Utc::now())
    }

    fn fast_config() -> EmergencyConfig {
        EmergencyConfig {
            retry_delay_secs: 1,
            ..EmergencyConfig::default()
        }
    }

    fn responder(
        site: &SimSite,
        bus: &EventBus,
        sink: &Arc<RecordingAlertSink>,
    ) -> (EmergencyResponder, watch::Receiver<EmergencyStage>) {
        journaled_responder(site, bus, sink, None)
    }

    fn journaled_responder(
        site: &SimSite,
        bus: &EventBus,
        sink: &Arc<RecordingAlertSink>,
        journal: Option<SharedJournal>,
    ) -> (EmergencyResponder, watch::Receiver<EmergencyStage>) {
        let (stage_tx, stage_rx) = watch::channel(EmergencyStage::Warning);
        let policy = AlertPolicy {
            min_interval: Duration::ZERO,
            max_per_hour: 0,
            ..AlertPolicy::default()
        };
        let links = ResponderLinks {
            stage_tx,
            bus: bus.clone(),
            alerts: AlertDispatcher::spawn(vec![sink.clone()], policy),
            journal,
        };
        let responder = EmergencyResponder::new(
            site.registry(),
            fast_config(),
            BatteryLadder::default(),
            EmergencyStage::Warning,
            links,
        );
        (responder, stage_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn battery_ladder_parks_once_and_holds() {
        let site = SimSite::new();
        site.mount.set_status(MountStatus::Tracking);
        let sink = Arc::new(RecordingAlertSink::new());
        let (mut responder, stage_rx) = responder(&site, &EventBus::default(), &sink);

        let safe = verdict(VerdictLevel::Safe, Trigger::WindPark);
        assert_eq!(responder.on_verdict(&safe, Some(50.0)).await, EmergencyStage::Warning);
        assert_eq!(responder.on_verdict(&safe, Some(35.0)).await, EmergencyStage::Park);
        assert!(site.mount.snapshot().is_parked());
        assert_eq!(*stage_rx.borrow(), EmergencyStage::Park);

        // Same stage on the next cycle: no second plan.
        responder.on_verdict(&safe, Some(34.0)).await;
        assert_eq!(site.mount.faults.calls(SimOp::Park), 1);
        assert_eq!(responder.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn battery_above_the_park_level_takes_no_action() {
        let site = SimSite::new();
        site.mount.set_status(MountStatus::Tracking);
        let sink = Arc::new(RecordingAlertSink::new());
        let (mut responder, _) = responder(&site, &EventBus::default(), &sink);

        let safe = verdict(VerdictLevel::Safe, Trigger::WindPark);
        assert_eq!(responder.on_verdict(&safe, Some(45.0)).await, EmergencyStage::Warning);
        assert_eq!(responder.on_verdict(&safe, Some(49.0)).await, EmergencyStage::Warning);
        assert_eq!(site.mount.faults.calls(SimOp::Park), 0);
        assert!(responder.history().is_empty());

        assert_eq!(responder.on_verdict(&safe, Some(30.0)).await, EmergencyStage::Park);
        assert_eq!(site.mount.faults.calls(SimOp::Park), 1);
        assert!(site.mount.snapshot().is_parked());
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_preempts_a_running_park() {
        let site = SimSite::with_timing(SimTiming {
            park: Duration::from_secs(1000),
            ..SimTiming::default()
        });
        site.mount.set_status(MountStatus::Tracking);
        site.enclosure.set_state(EnclosureState::Open);
        let sink = Arc::new(RecordingAlertSink::new());
        let (responder, stage_rx) = responder(&site, &EventBus::default(), &sink);
        let history = responder.history();

        let park = verdict(VerdictLevel::ParkRequired, Trigger::WindPark);
        let (verdict_tx, verdict_rx) = watch::channel(Arc::new(park.clone()));
        let (_battery_tx, battery_rx) = watch::channel(None);
        let (_force_tx, force_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(responder.run(verdict_rx, battery_rx, force_rx, cancel.clone()));

        verdict_tx.send_replace(Arc::new(park));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*stage_rx.borrow(), EmergencyStage::Park);
        assert_eq!(site.enclosure.snapshot(), EnclosureState::Open);

        verdict_tx.send_replace(Arc::new(verdict(VerdictLevel::Emergency, Trigger::Rain)));
        let closed = tokio::time::timeout(Duration::from_secs(90), async {
            while site.enclosure.snapshot() != EnclosureState::Closed {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        assert!(closed.is_ok(), "roof still open while the park was running");
        assert_eq!(*stage_rx.borrow(), EmergencyStage::Close);

        let events = history.events();
        assert_eq!(events[0].to, EmergencyStage::Park);
        assert!(events[0].errors.iter().any(|e| e.contains("preempted")));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn return_to_warning_waits_for_the_running_plan() {
        let site = SimSite::with_timing(SimTiming {
            park: Duration::from_secs(20),
            ..SimTiming::default()
        });
        site.mount.set_status(MountStatus::Tracking);
        let sink = Arc::new(RecordingAlertSink::new());
        let (responder, stage_rx) = responder(&site, &EventBus::default(), &sink);

        let park = verdict(VerdictLevel::ParkRequired, Trigger::WindPark);
        let (verdict_tx, verdict_rx) = watch::channel(Arc::new(park.clone()));
        let (_battery_tx, battery_rx) = watch::channel(None);
        let (_force_tx, force_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(responder.run(verdict_rx, battery_rx, force_rx, cancel.clone()));

        verdict_tx.send_replace(Arc::new(park));
        tokio::time::sleep(Duration::from_secs(1)).await;
        verdict_tx.send_replace(Arc::new(verdict(VerdictLevel::Safe, Trigger::WindPark)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*stage_rx.borrow(), EmergencyStage::Park);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(site.mount.snapshot().is_parked());
        assert_eq!(*stage_rx.borrow(), EmergencyStage::Warning);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn park_failures_are_retried_then_escalate() {
        let site = SimSite::new();
        site.mount.set_status(MountStatus::Tracking);
        site.mount.faults.fail_next(SimOp::Park, 3);
        let bus = EventBus::default();
        let mut failures = bus.subscribe_to(Topic::EmergencyStage);
        let sink = Arc::new(RecordingAlertSink::new());
        let (mut responder, _) = responder(&site, &bus, &sink);

        let park = verdict(VerdictLevel::ParkRequired, Trigger::WindPark);
        let stage = responder.on_verdict(&park, Some(100.0)).await;

        assert_eq!(stage, EmergencyStage::Close);
        // Three attempts in PARK, one rushed attempt in CLOSE which succeeds.
        assert_eq!(site.mount.faults.calls(SimOp::Park), 4);
        assert_eq!(site.enclosure.snapshot(), EnclosureState::Closed);

        let mut saw_failure = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(10), failures.next()).await
        {
            if let EventPayload::EmergencyStageFailed { stage, .. } = event.payload {
                assert_eq!(stage, EmergencyStage::Park);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
        let history = responder.history().events();
        assert_eq!(history.len(), 2);
        assert!(!history[0].errors.is_empty());
        assert!(history[1].errors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rain_rushes_to_close_even_if_mount_will_not_park() {
        let site = SimSite::new();
        site.mount.set_status(MountStatus::Tracking);
        site.enclosure.set_state(EnclosureState::Open);
        site.mount.faults.fail_next(SimOp::Park, 10);
        let sink = Arc::new(RecordingAlertSink::new());
        let (mut responder, _) = responder(&site, &EventBus::default(), &sink);

        let rain = verdict(VerdictLevel::Emergency, Trigger::Rain);
        let stage = responder.on_verdict(&rain, None).await;

        assert_eq!(stage, EmergencyStage::Close);
        assert_eq!(site.mount.faults.calls(SimOp::Park), 1);
        assert_eq!(site.enclosure.snapshot(), EnclosureState::Closed);
        let last = responder.history().last().unwrap();
        assert_eq!(last.errors.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_failure_stays_in_shutdown_and_alerts() {
        let site = SimSite::new();
        site.power.faults.fail_next(SimOp::CutLoads, 10);
        let sink = Arc::new(RecordingAlertSink::new());
        let (mut responder, _) = responder(&site, &EventBus::default(), &sink);

        let safe = verdict(VerdictLevel::Safe, Trigger::WindPark);
        let stage = responder.on_verdict(&safe, Some(15.0)).await;
        assert_eq!(stage, EmergencyStage::Shutdown);

        assert!(sink.wait_for(2, Duration::from_secs(5)).await);
        assert!(
            sink.alerts()
                .iter()
                .any(|a| a.severity == AlertSeverity::Critical && a.message.contains("SHUTDOWN"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn safe_verdict_returns_to_warning_and_force_only_moves_forward() {
        let site = SimSite::new();
        let sink = Arc::new(RecordingAlertSink::new());
        let (mut responder, _) = responder(&site, &EventBus::default(), &sink);

        assert_eq!(
            responder.force(EmergencyStage::Close, "two services failed").await,
            EmergencyStage::Close
        );
        assert_eq!(
            responder.force(EmergencyStage::Park, "late request").await,
            EmergencyStage::Close
        );

        let warning = verdict(VerdictLevel::Warning, Trigger::Cold);
        assert_eq!(responder.on_verdict(&warning, None).await, EmergencyStage::Close);
        let safe = verdict(VerdictLevel::Safe, Trigger::WindPark);
        assert_eq!(responder.on_verdict(&safe, None).await, EmergencyStage::Warning);
        assert_eq!(responder.status().transitions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_changes_are_journaled() {
        let site = SimSite::new();
        let journal = Arc::new(parking_lot::Mutex::new(Journal::open_in_memory().unwrap()));
        let sink = Arc::new(RecordingAlertSink::new());
        let (mut responder, _) =
            journaled_responder(&site, &EventBus::default(), &sink, Some(journal.clone()));

        responder.force(EmergencyStage::Park, "test").await;
        let stage: Option<EmergencyStage> = journal.lock().latest(JournalKind::Stage).unwrap();
        assert_eq!(stage, Some(EmergencyStage::Park));
    }
}
