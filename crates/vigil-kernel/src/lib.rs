//! `vigil-kernel` – Safety decisions
//!
//! Everything in this crate is synchronous and free of I/O: it decides, the
//! runtime acts. Each piece can be driven in tests with hand-built snapshots
//! and injected time.
//!
//! # Modules
//!
//! - [`evaluator`] – [`evaluate`][evaluator::evaluate]: sensor snapshot plus
//!   hysteresis state in, [`SafetyVerdict`][vigil_types::SafetyVerdict] and
//!   next hysteresis state out.
//! - [`interlock`] – [`Interlock`][interlock::Interlock]: the veto rule engine
//!   every command passes through immediately before dispatch.
//! - [`emergency`] – the emergency stage machine: target stage, transition
//!   function and per-stage action plans.
//! - [`watchdog`] – [`ServiceWatchdog`][watchdog::ServiceWatchdog]: heartbeat
//!   tracking and recovery scheduling with exponential backoff.

pub mod emergency;
pub mod evaluator;
pub mod interlock;
pub mod watchdog;

pub use emergency::{
    BatteryLadder, EmergencyConfig, StageAction, StagePlan, target_stage, transition,
};
pub use evaluator::{RainHoldoff, evaluate, rain_holdoff_status};
pub use interlock::{Interlock, InterlockContext, Rule};
pub use watchdog::{
    RecoveryAction, ServicePolicy, ServiceWatchdog, WatchdogAction, WatchdogConfig,
};
