//! Solar position source.

use async_trait::async_trait;
use vigil_types::VigilError;

use crate::device::Device;

#[async_trait]
pub trait Ephemeris: Device {
    /// Current altitude of the Sun above the horizon in degrees.
    async fn sun_altitude_deg(&self) -> Result<f64, VigilError>;
}
