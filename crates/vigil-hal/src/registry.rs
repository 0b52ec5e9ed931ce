//! [`DeviceRegistry`] – binds each logical service to its live driver.
//!
//! The executor and emergency responder reach devices through their role
//! handles ([`DeviceRegistry::mount`], [`DeviceRegistry::enclosure`], ...);
//! the watchdog reaches the same drivers through the role-agnostic
//! [`Device`] view returned by [`DeviceRegistry::device`].

use std::collections::BTreeMap;
use std::sync::Arc;

use vigil_types::ServiceKind;

use crate::camera::Camera;
use crate::device::Device;
use crate::enclosure::Enclosure;
use crate::ephemeris::Ephemeris;
use crate::mount::Mount;
use crate::power::PowerSupply;
use crate::weather::WeatherStation;

/// Live driver handles for one observatory.
///
/// # Example
///
/// ```
/// use vigil_hal::registry::DeviceRegistry;
/// use vigil_hal::sim::SimSite;
/// use vigil_types::ServiceKind;
///
/// let site = SimSite::new();
/// let registry: DeviceRegistry = site.registry();
///
/// assert!(registry.device(ServiceKind::Mount).is_some());
/// assert_eq!(registry.services().len(), 6);
/// ```
#[derive(Clone)]
pub struct DeviceRegistry {
    mount: Arc<dyn Mount>,
    enclosure: Arc<dyn Enclosure>,
    weather: Arc<dyn WeatherStation>,
    power: Arc<dyn PowerSupply>,
    ephemeris: Arc<dyn Ephemeris>,
    camera: Option<Arc<dyn Camera>>,
    devices: BTreeMap<ServiceKind, Arc<dyn Device>>,
}

impl DeviceRegistry {
    /// Build a registry from the devices every site must have.
    pub fn new<M, E, W, P, S>(
        mount: Arc<M>,
        enclosure: Arc<E>,
        weather: Arc<W>,
        power: Arc<P>,
        ephemeris: Arc<S>,
    ) -> Self
    where
        M: Mount + 'static,
        E: Enclosure + 'static,
        W: WeatherStation + 'static,
        P: PowerSupply + 'static,
        S: Ephemeris + 'static,
    {
        let mut devices: BTreeMap<ServiceKind, Arc<dyn Device>> = BTreeMap::new();
        devices.insert(ServiceKind::Mount, mount.clone());
        devices.insert(ServiceKind::Enclosure, enclosure.clone());
        devices.insert(ServiceKind::Weather, weather.clone());
        devices.insert(ServiceKind::Power, power.clone());
        devices.insert(ServiceKind::Ephemeris, ephemeris.clone());
        Self {
            mount,
            enclosure,
            weather,
            power,
            ephemeris,
            camera: None,
            devices,
        }
    }

    /// Attach an imaging camera. Replaces any previous camera.
    pub fn with_camera<C: Camera + 'static>(mut self, camera: Arc<C>) -> Self {
        self.devices.insert(ServiceKind::Camera, camera.clone());
        self.camera = Some(camera);
        self
    }

    pub fn mount(&self) -> Arc<dyn Mount> {
        self.mount.clone()
    }

    pub fn enclosure(&self) -> Arc<dyn Enclosure> {
        self.enclosure.clone()
    }

    pub fn weather(&self) -> Arc<dyn WeatherStation> {
        self.weather.clone()
    }

    pub fn power(&self) -> Arc<dyn PowerSupply> {
        self.power.clone()
    }

    pub fn ephemeris(&self) -> Arc<dyn Ephemeris> {
        self.ephemeris.clone()
    }

    pub fn camera(&self) -> Option<Arc<dyn Camera>> {
        self.camera.clone()
    }

    /// Role-agnostic view of the driver bound to `service`.
    pub fn device(&self, service: ServiceKind) -> Option<Arc<dyn Device>> {
        self.devices.get(&service).cloned()
    }

    /// Services with a bound driver, in stable order.
    pub fn services(&self) -> Vec<ServiceKind> {
        self.devices.keys().copied().collect()
    }
}
