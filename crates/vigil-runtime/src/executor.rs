//! Command queue and executor.
//!
//! # Dispatch model
//!
//! | Priority | Path |
//! |---|---|
//! | `Emergency` | Bypasses the queue and runs at once, next to whatever is in flight |
//! | `Interactive` | Queued; dispatched by the interactive worker |
//! | `Background` | Queued; dispatched by the background worker, yielding a device while an interactive command for it waits |
//!
//! Commands for the same device never overlap; commands for different devices
//! run in parallel. The interlock is consulted immediately before dispatch
//! with the latest verdict and freshly queried device states, never at
//! submission time.
//!
//! Every command ends in exactly one [`CommandOutcome`], delivered to its
//! [`CommandTicket`], published as `CommandFinished` and journaled.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vigil_hal::DeviceRegistry;
use vigil_kernel::Interlock;
use vigil_memory::JournalKind;
use vigil_middleware::EventBus;
use vigil_types::{
    CommandKind, CommandOutcome, CommandRequest, CommandType, Device, DeviceStates,
    EnclosureState, Event, EventPayload, Priority, ReconciledState, SafetyVerdict, VetoResult,
    VigilError,
};

use crate::{SharedJournal, record};

const SOURCE: &str = "vigil-runtime::executor";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub queue_capacity: usize,
    pub slew_timeout_secs: u64,
    pub park_timeout_secs: u64,
    pub unpark_timeout_secs: u64,
    pub roof_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    /// Added to the exposure time of a capture.
    pub capture_overhead_secs: u64,
    /// Bound on one state query.
    pub device_timeout_secs: u64,
    /// How long a cancelled motion may take to report a stopped state.
    pub stop_confirm_timeout_secs: u64,
    /// Park attempt made by an emergency close before the roof moves.
    pub emergency_park_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            slew_timeout_secs: 120,
            park_timeout_secs: 120,
            unpark_timeout_secs: 30,
            roof_timeout_secs: 60,
            stop_timeout_secs: 10,
            capture_overhead_secs: 30,
            device_timeout_secs: 10,
            stop_confirm_timeout_secs: 30,
            emergency_park_timeout_secs: 30,
        }
    }
}

impl ExecutorConfig {
    /// Deadline for executing `kind` once it has passed the interlock.
    pub fn timeout_for(&self, kind: &CommandKind) -> Duration {
        match kind {
            CommandKind::Slew(_) => Duration::from_secs(self.slew_timeout_secs),
            CommandKind::Park => Duration::from_secs(self.park_timeout_secs),
            CommandKind::Unpark => Duration::from_secs(self.unpark_timeout_secs),
            CommandKind::RoofOpen | CommandKind::RoofClose => {
                Duration::from_secs(self.roof_timeout_secs)
            }
            CommandKind::Stop | CommandKind::EmergencyStop => {
                Duration::from_secs(self.stop_timeout_secs)
            }
            CommandKind::EmergencyClose => {
                Duration::from_secs(self.emergency_park_timeout_secs + self.roof_timeout_secs)
            }
            CommandKind::Capture { exposure_secs } => {
                Duration::from_secs_f64(exposure_secs.max(0.0))
                    + Duration::from_secs(self.capture_overhead_secs)
            }
        }
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_secs(self.device_timeout_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Queue
// ─────────────────────────────────────────────────────────────────────────────

/// A queued command and the channel its outcome is delivered on.
#[derive(Debug)]
pub struct QueuedCommand {
    pub request: CommandRequest,
    reply: oneshot::Sender<CommandOutcome>,
}

impl QueuedCommand {
    pub fn new(request: CommandRequest) -> (Self, CommandTicket) {
        let (reply, outcome) = oneshot::channel();
        let ticket = CommandTicket {
            id: request.id,
            command: request.command_type(),
            outcome,
        };
        (Self { request, reply }, ticket)
    }

    fn resolve(self, outcome: CommandOutcome) {
        // The submitter may have dropped its ticket.
        let _ = self.reply.send(outcome);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub cancelled: u64,
}

/// Bounded priority queue, FIFO within a priority.
#[derive(Debug)]
pub struct CommandQueue {
    capacity: usize,
    next_seq: u64,
    entries: BTreeMap<(Reverse<Priority>, u64), QueuedCommand>,
    stats: QueueStats,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: 0,
            entries: BTreeMap::new(),
            stats: QueueStats::default(),
        }
    }

    pub fn push(&mut self, command: QueuedCommand) -> Result<(), VigilError> {
        if self.entries.len() >= self.capacity {
            self.stats.dropped += 1;
            return Err(VigilError::QueueFull {
                capacity: self.capacity,
            });
        }
        let key = (Reverse(command.request.priority), self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, command);
        self.stats.enqueued += 1;
        Ok(())
    }

    /// Oldest command of `tier` whose device is not in `busy`. A background
    /// command is held back while an interactive one for its device waits.
    pub fn take_next(&mut self, tier: Priority, busy: &HashSet<Device>) -> Option<QueuedCommand> {
        let waiting_interactive: HashSet<Device> = self
            .entries
            .values()
            .filter(|c| c.request.priority == Priority::Interactive)
            .map(|c| c.request.device())
            .collect();
        let key = self
            .entries
            .iter()
            .find(|(_, c)| {
                let device = c.request.device();
                c.request.priority == tier
                    && !busy.contains(&device)
                    && (tier != Priority::Background || !waiting_interactive.contains(&device))
            })
            .map(|(key, _)| *key)?;
        self.stats.dispatched += 1;
        self.entries.remove(&key)
    }

    pub fn remove(&mut self, id: Uuid) -> Option<QueuedCommand> {
        let key = self
            .entries
            .iter()
            .find(|(_, c)| c.request.id == id)
            .map(|(key, _)| *key)?;
        self.stats.cancelled += 1;
        self.entries.remove(&key)
    }

    /// Queued requests in dispatch order.
    pub fn pending(&self) -> Vec<CommandRequest> {
        self.entries.values().map(|c| c.request.clone()).collect()
    }

    pub fn drain(&mut self) -> Vec<QueuedCommand> {
        self.stats.cancelled += self.entries.len() as u64;
        std::mem::take(&mut self.entries).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tickets
// ─────────────────────────────────────────────────────────────────────────────

/// Handle returned by [`Executor::submit`].
#[derive(Debug)]
pub struct CommandTicket {
    pub id: Uuid,
    pub command: CommandType,
    outcome: oneshot::Receiver<CommandOutcome>,
}

impl CommandTicket {
    /// Wait for the command to finish.
    pub async fn outcome(self) -> CommandOutcome {
        self.outcome.await.unwrap_or_else(|_| CommandOutcome::Failed {
            error: "executor stopped before the command finished".into(),
        })
    }
}

#[derive(Serialize)]
struct CommandRecord<'a> {
    command: &'a CommandRequest,
    outcome: &'a CommandOutcome,
}

// ─────────────────────────────────────────────────────────────────────────────
// Executor
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct DispatchState {
    queue: Option<CommandQueue>,
    busy: HashSet<Device>,
    in_flight: HashMap<Uuid, CancellationToken>,
}

struct Shared {
    state: Mutex<DispatchState>,
    wake: Notify,
    devices: DeviceRegistry,
    interlock: Interlock,
    verdict_rx: watch::Receiver<Arc<SafetyVerdict>>,
    bus: EventBus,
    journal: Option<SharedJournal>,
    config: ExecutorConfig,
}

/// Cloneable handle to the dispatch machinery.
#[derive(Clone)]
pub struct Executor {
    shared: Arc<Shared>,
}

impl Executor {
    pub fn new(
        devices: DeviceRegistry,
        interlock: Interlock,
        verdict_rx: watch::Receiver<Arc<SafetyVerdict>>,
        bus: EventBus,
        journal: Option<SharedJournal>,
        config: ExecutorConfig,
    ) -> Self {
        let state = DispatchState {
            queue: Some(CommandQueue::new(config.queue_capacity)),
            ..DispatchState::default()
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                wake: Notify::new(),
                devices,
                interlock,
                verdict_rx,
                bus,
                journal,
                config,
            }),
        }
    }

    /// Start the interactive and background workers.
    pub fn spawn_workers(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        [Priority::Interactive, Priority::Background]
            .into_iter()
            .map(|tier| {
                let exec = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { exec.worker(tier, cancel).await })
            })
            .collect()
    }

    async fn worker(self, tier: Priority, cancel: CancellationToken) {
        debug!(?tier, "executor worker started");
        loop {
            let notified = self.shared.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((command, token)) = self.claim(tier) {
                let exec = self.clone();
                tokio::spawn(async move { exec.run_claimed(command, token).await });
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut notified => {}
            }
        }
        debug!(?tier, "executor worker stopped");
    }

    fn claim(&self, tier: Priority) -> Option<(QueuedCommand, CancellationToken)> {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        let command = state.queue.as_mut()?.take_next(tier, &state.busy)?;
        let token = CancellationToken::new();
        state.busy.insert(command.request.device());
        state.in_flight.insert(command.request.id, token.clone());
        Some((command, token))
    }

    async fn run_claimed(self, command: QueuedCommand, token: CancellationToken) {
        let outcome = self.execute(&command.request, &token).await;
        {
            let mut state = self.shared.state.lock();
            state.busy.remove(&command.request.device());
            state.in_flight.remove(&command.request.id);
        }
        self.shared.wake.notify_waiters();
        self.finish(command, outcome);
    }

    /// Submit a command. Emergency commands run immediately; everything else
    /// is queued.
    pub fn submit(&self, mut request: CommandRequest) -> Result<CommandTicket, VigilError> {
        let kind = request.command_type();
        if matches!(kind, CommandType::EmergencyStop | CommandType::EmergencyClose) {
            request.priority = Priority::Emergency;
        }

        let (command, ticket) = QueuedCommand::new(request);
        if command.request.priority == Priority::Emergency {
            if kind == CommandType::EmergencyStop {
                self.cancel_all();
            }
            info!(command = %kind, id = %command.request.id, "emergency command bypasses the queue");
            let exec = self.clone();
            tokio::spawn(async move {
                let token = CancellationToken::new();
                let outcome = exec.execute(&command.request, &token).await;
                exec.finish(command, outcome);
            });
            return Ok(ticket);
        }

        {
            let mut state = self.shared.state.lock();
            let queue = state
                .queue
                .as_mut()
                .ok_or_else(|| VigilError::NotRunning("command executor".into()))?;
            queue.push(command)?;
        }
        debug!(command = %kind, id = %ticket.id, "command queued");
        self.shared.wake.notify_waiters();
        Ok(ticket)
    }

    /// Cancel a queued or in-flight command. Returns `false` when `id` is not
    /// known, including when it already finished.
    pub fn cancel(&self, id: Uuid) -> bool {
        let (queued, token) = {
            let mut state = self.shared.state.lock();
            let queued = state.queue.as_mut().and_then(|q| q.remove(id));
            let token = state.in_flight.get(&id).cloned();
            (queued, token)
        };
        if let Some(command) = queued {
            info!(%id, "queued command cancelled");
            self.finish(command, CommandOutcome::Cancelled);
            return true;
        }
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything queued and in flight.
    pub fn cancel_all(&self) -> usize {
        let (drained, tokens) = {
            let mut state = self.shared.state.lock();
            let drained = state.queue.as_mut().map(CommandQueue::drain).unwrap_or_default();
            let tokens: Vec<_> = state.in_flight.values().cloned().collect();
            (drained, tokens)
        };
        let count = drained.len() + tokens.len();
        for command in drained {
            self.finish(command, CommandOutcome::Cancelled);
        }
        for token in tokens {
            token.cancel();
        }
        if count > 0 {
            warn!(count, "all pending commands cancelled");
        }
        count
    }

    /// Refuse further submissions and cancel what is left in the queue.
    pub fn close(&self) {
        let drained = {
            let mut state = self.shared.state.lock();
            state.queue.take().map(|mut q| q.drain()).unwrap_or_default()
        };
        for command in drained {
            self.finish(command, CommandOutcome::Cancelled);
        }
        self.shared.wake.notify_waiters();
    }

    pub fn pending(&self) -> Vec<CommandRequest> {
        let state = self.shared.state.lock();
        state.queue.as_ref().map(CommandQueue::pending).unwrap_or_default()
    }

    pub fn queue_stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        state.queue.as_ref().map(CommandQueue::stats).unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    fn finish(&self, command: QueuedCommand, outcome: CommandOutcome) {
        let request = &command.request;
        info!(command = %request.command_type(), id = %request.id, ?outcome, "command finished");
        record(
            &self.shared.journal,
            JournalKind::Command,
            &CommandRecord {
                command: request,
                outcome: &outcome,
            },
        );
        self.shared.bus.publish(Event::new(
            SOURCE,
            EventPayload::CommandFinished {
                command_id: request.id,
                command: request.command_type(),
                outcome: outcome.clone(),
            },
        ));
        command.resolve(outcome);
    }

    // ── Execution ────────────────────────────────────────────────────────────

    async fn device_states(&self) -> DeviceStates {
        let timeout = self.shared.config.device_timeout();
        let devices = &self.shared.devices;
        let mount = match tokio::time::timeout(timeout, devices.mount().state()).await {
            Ok(Ok(state)) => Some(state),
            Ok(Err(e)) => {
                warn!(error = %e, "mount state unavailable");
                None
            }
            Err(_) => None,
        };
        let enclosure = match tokio::time::timeout(timeout, devices.enclosure().state()).await {
            Ok(Ok(state)) => state,
            _ => EnclosureState::Unknown,
        };
        DeviceStates { mount, enclosure }
    }

    #[instrument(skip(self, request, token), fields(command = %request.command_type(), id = %request.id))]
    async fn execute(&self, request: &CommandRequest, token: &CancellationToken) -> CommandOutcome {
        let states = self.device_states().await;
        let verdict = self.shared.verdict_rx.borrow().clone();
        if let VetoResult::Vetoed(veto) = self.shared.interlock.check(request, &verdict, &states) {
            self.shared.bus.publish(Event::new(
                SOURCE,
                EventPayload::CommandVetoed {
                    command: request.clone(),
                    veto: veto.clone(),
                },
            ));
            return CommandOutcome::Vetoed { reason: veto.reason };
        }

        let limit = self.shared.config.timeout_for(&request.kind);
        let device = request.device();
        tokio::select! {
            biased;
            _ = token.cancelled() => match self.halt(device).await {
                Ok(()) => CommandOutcome::Cancelled,
                Err(e) => CommandOutcome::Failed {
                    error: format!("cancelled but stop not confirmed: {e}"),
                },
            },
            result = tokio::time::timeout(limit, self.perform(&request.kind)) => match result {
                Ok(Ok(())) => CommandOutcome::Completed,
                Ok(Err(e)) => CommandOutcome::Failed { error: e.to_string() },
                Err(_) => {
                    let after_secs = limit.as_secs();
                    let error = VigilError::CommandTimeout {
                        command: request.command_type(),
                        after_secs,
                    };
                    warn!(%error, "stopping motion after timeout");
                    if let Err(e) = self.halt(device).await {
                        warn!(error = %e, "stop after timeout not confirmed");
                    }
                    CommandOutcome::TimedOut {
                        after_secs,
                        state: self.reconcile(device).await,
                    }
                }
            },
        }
    }

    async fn perform(&self, kind: &CommandKind) -> Result<(), VigilError> {
        let devices = &self.shared.devices;
        match kind {
            CommandKind::Slew(target) => devices.mount().slew(target.coords).await.map(|_| ()),
            CommandKind::Park => devices.mount().park().await.map(|_| ()),
            CommandKind::Unpark => devices.mount().unpark().await.map(|_| ()),
            CommandKind::Stop => devices.mount().stop().await.map(|_| ()),
            CommandKind::RoofOpen => devices.enclosure().open().await.map(|_| ()),
            CommandKind::RoofClose => devices.enclosure().close().await.map(|_| ()),
            CommandKind::Capture { exposure_secs } => {
                let camera = devices
                    .camera()
                    .ok_or_else(|| VigilError::unreachable("camera", "no camera configured"))?;
                camera
                    .expose(Duration::from_secs_f64(exposure_secs.max(0.0)))
                    .await
                    .map(|_| ())
            }
            CommandKind::EmergencyStop => self.emergency_stop().await,
            CommandKind::EmergencyClose => self.emergency_close().await,
        }
    }

    /// Stop every moving device. All stops are attempted even if one fails.
    async fn emergency_stop(&self) -> Result<(), VigilError> {
        let devices = &self.shared.devices;
        let mount = devices.mount();
        let enclosure = devices.enclosure();
        let (mount_result, enclosure_result) = tokio::join!(mount.stop(), enclosure.stop());
        if let Some(camera) = devices.camera()
            && let Err(e) = camera.abort().await
        {
            warn!(error = %e, "camera abort failed during emergency stop");
        }
        mount_result?;
        enclosure_result?;
        Ok(())
    }

    /// One bounded park attempt, then close whatever the mount did.
    async fn emergency_close(&self) -> Result<(), VigilError> {
        let devices = &self.shared.devices;
        let park_limit = Duration::from_secs(self.shared.config.emergency_park_timeout_secs);
        match tokio::time::timeout(park_limit, devices.mount().park()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "park failed, closing anyway"),
            Err(_) => warn!("park timed out, closing anyway"),
        }
        devices.enclosure().close().await.map(|_| ())
    }

    /// Stop `device` and wait until it reports a state at rest.
    async fn halt(&self, device: Device) -> Result<(), VigilError> {
        let devices = &self.shared.devices;
        let confirm = Duration::from_secs(self.shared.config.stop_confirm_timeout_secs);
        let confirmed = async {
            match device {
                Device::Mount => {
                    let mount = devices.mount();
                    let mut state = mount.stop().await?;
                    while !state.is_at_rest() {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        state = mount.state().await?;
                    }
                    Ok::<(), VigilError>(())
                }
                Device::Enclosure => {
                    let enclosure = devices.enclosure();
                    let mut state = enclosure.stop().await?;
                    while state.is_moving() {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        state = enclosure.state().await?;
                    }
                    Ok(())
                }
                Device::Camera => match devices.camera() {
                    Some(camera) => camera.abort().await,
                    None => Ok(()),
                },
            }
        };
        tokio::time::timeout(confirm, confirmed)
            .await
            .map_err(|_| VigilError::fault(format!("{device:?}"), "no stopped state reported"))?
    }

    /// Query `device` after a stop so the outcome reports where it ended up.
    async fn reconcile(&self, device: Device) -> Option<ReconciledState> {
        let timeout = self.shared.config.device_timeout();
        let devices = &self.shared.devices;
        match device {
            Device::Mount => tokio::time::timeout(timeout, devices.mount().state())
                .await
                .ok()
                .and_then(Result::ok)
                .map(|state| ReconciledState::Mount { state }),
            Device::Enclosure => tokio::time::timeout(timeout, devices.enclosure().state())
                .await
                .ok()
                .and_then(Result::ok)
                .map(|state| ReconciledState::Enclosure { state }),
            Device::Camera => {
                let camera = devices.camera()?;
                let reachable = matches!(
                    tokio::time::timeout(timeout, camera.ping()).await,
                    Ok(Ok(()))
                );
                Some(ReconciledState::Camera { reachable })
            }
        }
    }
}
