//! UPS / battery monitor role.

use std::time::Duration;

use async_trait::async_trait;
use vigil_types::VigilError;

use crate::device::Device;

#[async_trait]
pub trait PowerSupply: Device {
    async fn battery_percent(&self) -> Result<f64, VigilError>;

    /// Estimated runtime left on battery.
    async fn runtime_estimate(&self) -> Result<Duration, VigilError>;

    /// Switch off non-essential loads ahead of a full shutdown.
    async fn cut_loads(&self) -> Result<(), VigilError>;
}
