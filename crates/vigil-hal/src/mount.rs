//! Telescope mount role.

use async_trait::async_trait;
use vigil_types::{EquatorialCoords, MountState, VigilError};

use crate::device::Device;

/// A telescope mount. Every motion call resolves once the mount reports the
/// motion finished and returns the resulting state.
///
/// Dropping a pending [`slew`][Self::slew] future does not stop the mount;
/// callers that abandon a slew must call [`stop`][Self::stop].
#[async_trait]
pub trait Mount: Device {
    async fn state(&self) -> Result<MountState, VigilError>;

    async fn slew(&self, target: EquatorialCoords) -> Result<MountState, VigilError>;

    async fn park(&self) -> Result<MountState, VigilError>;

    async fn unpark(&self) -> Result<MountState, VigilError>;

    /// Halt all motion.
    async fn stop(&self) -> Result<MountState, VigilError>;

    async fn is_parked(&self) -> Result<bool, VigilError> {
        Ok(self.state().await?.is_parked())
    }
}
