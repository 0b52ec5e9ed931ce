//! `vigil-types` – shared vocabulary of the observatory safety core.
//!
//! | Module | Contents |
//! |---|---|
//! | [`sensor`] | [`Metric`], [`Reading`], [`SensorSnapshot`] |
//! | [`verdict`] | [`VerdictLevel`], [`SafetyVerdict`], [`ThresholdSet`], [`HysteresisState`] |
//! | [`command`] | [`CommandRequest`], [`CommandKind`], [`Priority`], [`VetoResult`], [`CommandOutcome`] |
//! | [`device`] | [`MountState`], [`EnclosureState`], [`DeviceStates`], [`ServiceKind`] |
//! | [`event`] | [`Event`], [`EventPayload`], [`EmergencyStage`], [`AlertSeverity`] |
//! | [`error`] | [`VigilError`] |

pub mod command;
pub mod device;
pub mod error;
pub mod event;
pub mod sensor;
pub mod verdict;

pub use command::{
    CommandKind, CommandOutcome, CommandRequest, CommandType, Device, EquatorialCoords, Priority,
    SlewTarget, Veto, VetoResult,
};
pub use device::{
    DeviceStates, EnclosureState, MountState, MountStatus, ReconciledState, ServiceKind,
    ServiceState,
};
pub use error::VigilError;
pub use event::{AlertSeverity, EmergencyStage, Event, EventPayload};
pub use sensor::{Metric, Reading, SensorSnapshot, SnapshotBuilder};
pub use verdict::{
    HysteresisState, Latch, RainTracker, RecoveryTracker, SafetyVerdict, ThresholdSet, Trigger,
    VerdictLevel, VerdictReason,
};
