//! Roll-off roof / dome enclosure role.

use async_trait::async_trait;
use tokio::sync::watch;
use vigil_types::{EnclosureState, VigilError};

use crate::device::Device;

#[async_trait]
pub trait Enclosure: Device {
    async fn state(&self) -> Result<EnclosureState, VigilError>;

    /// Resolves once the enclosure reports fully open.
    async fn open(&self) -> Result<EnclosureState, VigilError>;

    /// Resolves once the enclosure reports fully closed.
    async fn close(&self) -> Result<EnclosureState, VigilError>;

    async fn stop(&self) -> Result<EnclosureState, VigilError>;

    /// 0 when closed, 100 when fully open.
    async fn position_percent(&self) -> Result<f64, VigilError>;

    /// Hardware rain line. Flips to `true` the moment the rain sensor wired to
    /// the enclosure controller trips, independently of software polling.
    fn rain_interrupt(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}
