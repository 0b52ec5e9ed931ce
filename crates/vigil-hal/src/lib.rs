//! `vigil-hal` – collaborator boundary.
//!
//! One trait per device role. The safety core only ever talks to devices
//! through these traits; wire protocols live in the drivers behind them.
//!
//! | Module | Role |
//! |---|---|
//! | [`device`] | [`Device`]: connect / ping / reset, shared by every role |
//! | [`mount`] | [`Mount`] |
//! | [`enclosure`] | [`Enclosure`], including the hardware rain line |
//! | [`weather`] | [`WeatherStation`], [`WeatherReading`] |
//! | [`power`] | [`PowerSupply`] |
//! | [`camera`] | [`Camera`] |
//! | [`ephemeris`] | [`Ephemeris`] |
//! | [`alert`] | [`AlertSink`], [`AlertDispatcher`] |
//! | [`registry`] | [`DeviceRegistry`] |
//! | [`sim`] | Simulated site with fault injection |

pub mod alert;
pub mod camera;
pub mod device;
pub mod enclosure;
pub mod ephemeris;
pub mod mount;
pub mod power;
pub mod registry;
pub mod sim;
pub mod weather;

pub use alert::{Alert, AlertDispatcher, AlertPolicy, AlertSink, LogAlertSink};
pub use camera::{Camera, Exposure};
pub use device::Device;
pub use enclosure::Enclosure;
pub use ephemeris::Ephemeris;
pub use mount::Mount;
pub use power::PowerSupply;
pub use registry::DeviceRegistry;
pub use weather::{WeatherReading, WeatherStation};
