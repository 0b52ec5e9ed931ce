//! `vigil-runtime` – the running safety core.
//!
//! Ties the pure decision logic in `vigil-kernel` to real devices from
//! `vigil-hal`, the event bus and the journal.
//!
//! # Modules
//!
//! - [`monitor`] – [`ConditionMonitor`]: polls sensors, keeps last-known-good
//!   readings and publishes a fresh [`SafetyVerdict`][vigil_types::SafetyVerdict]
//!   every cycle.
//! - [`responder`] – [`EmergencyResponder`]: walks the
//!   `WARNING → PARK → CLOSE → SHUTDOWN` ladder with bounded retries and
//!   escalates when a stage cannot be completed.
//! - [`supervisor`] – [`Supervisor`]: pings every device service, runs the
//!   watchdog recovery chain and forces a close when safety services die.
//! - [`executor`] – [`Executor`]: priority command queue with per-device
//!   mutual exclusion, dispatch-time interlocks, timeouts and cancellation.
//! - [`orchestrator`] – [`Orchestrator`]: owns the tasks above, restores
//!   state from the journal and runs observing sessions and shutdown.
//! - [`telemetry`] – [`init_tracing`]: global `tracing` subscriber with an
//!   optional OTLP span exporter.
//!
//! # Journal
//!
//! Every task that persists state shares one [`SharedJournal`]. Journal
//! failures are logged and never stop a safety action.

pub mod executor;
pub mod monitor;
pub mod orchestrator;
pub mod responder;
pub mod supervisor;
pub mod telemetry;

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;
use vigil_memory::{Journal, JournalKind};

pub use executor::{CommandQueue, CommandTicket, Executor, ExecutorConfig, QueueStats};
pub use monitor::ConditionMonitor;
pub use orchestrator::{Orchestrator, OrchestratorConfig, SafingReport, SiteStatus};
pub use responder::{EmergencyEvent, EmergencyResponder, ForcedStage};
pub use supervisor::{HealthMap, Supervisor};
pub use telemetry::{LogFormat, TracerProviderGuard, init_tracing};

pub type SharedJournal = Arc<parking_lot::Mutex<Journal>>;

pub(crate) fn record<T: Serialize>(journal: &Option<SharedJournal>, kind: JournalKind, payload: &T) {
    let Some(journal) = journal else {
        return;
    };
    if let Err(e) = journal.lock().append(kind, payload) {
        warn!(kind = kind.as_str(), error = %e, "journal append failed");
    }
}
