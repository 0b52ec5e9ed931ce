//! Base [`Device`] trait shared by every collaborator role.

use async_trait::async_trait;
use vigil_types::VigilError;

/// Connection-level capabilities every device driver exposes. The watchdog
/// drives these; role traits such as [`Mount`][crate::mount::Mount] add the
/// device-specific operations.
#[async_trait]
pub trait Device: Send + Sync {
    /// Stable identifier, e.g. `"mount"`.
    fn name(&self) -> &str;

    /// (Re)establish the connection to the device.
    async fn connect(&self) -> Result<(), VigilError>;

    /// Cheap liveness check used as the watchdog heartbeat.
    async fn ping(&self) -> Result<(), VigilError>;

    /// Harder recovery than [`connect`][Self::connect]. Drivers without a
    /// distinct reset path reconnect.
    async fn reset(&self) -> Result<(), VigilError> {
        self.connect().await
    }
}
