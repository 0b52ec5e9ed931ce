//! Imaging camera role.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vigil_types::VigilError;

use crate::device::Device;

/// Metadata of a finished exposure. Pixel data stays with the camera driver.
#[derive(Debug, Clone, PartialEq)]
pub struct Exposure {
    pub duration: Duration,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait Camera: Device {
    /// Resolves when the exposure has been read out.
    async fn expose(&self, duration: Duration) -> Result<Exposure, VigilError>;

    async fn abort(&self) -> Result<(), VigilError>;
}
