//! In-process simulated observatory for tests and hardware-free runs.
//!
//! Every simulator records how often each operation was called and accepts
//! injected faults through its [`FaultInjector`], so the safety core can be
//! driven through link loss, failed parks and stale weather without hardware.
//!
//! | Simulator | Behaviour |
//! |---|---|
//! | [`SimMount`] | Starts parked. Slews and parks take [`SimTiming`] durations; `stop()` mid-slew leaves it between start and target. |
//! | [`SimEnclosure`] | Starts closed. Exposes a rain interrupt line via [`SimEnclosure::trigger_rain`]. |
//! | [`SimWeather`] | Clear night; readings are re-stamped on every poll unless frozen. |
//! | [`SimPower`] | 100 % battery; records `cut_loads`. |
//! | [`SimEphemeris`] | Sun at −30°. |
//! | [`SimCamera`] | Exposures sleep for their duration. |
//! | [`RecordingAlertSink`] | Stores alerts; can be made to fail. |
//!
//! # Example
//!
//! ```rust
//! use vigil_hal::mount::Mount;
//! use vigil_hal::sim::{SimOp, SimSite};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let site = SimSite::new();
//! site.mount.faults.fail_next(SimOp::Unpark, 1);
//!
//! assert!(site.mount.unpark().await.is_err());
//! assert!(site.mount.unpark().await.is_ok());
//! assert_eq!(site.mount.faults.calls(SimOp::Unpark), 2);
//! # });
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use vigil_types::{EnclosureState, EquatorialCoords, MountState, MountStatus, VigilError};

use crate::alert::{Alert, AlertSink};
use crate::camera::{Camera, Exposure};
use crate::device::Device;
use crate::enclosure::Enclosure;
use crate::ephemeris::Ephemeris;
use crate::mount::Mount;
use crate::power::PowerSupply;
use crate::registry::DeviceRegistry;
use crate::weather::{WeatherReading, WeatherStation};

// ────────────────────────────────────────────────────────────────────────────
// Fault injection
// ────────────────────────────────────────────────────────────────────────────

/// Operations a simulator can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Connect,
    Ping,
    State,
    Slew,
    Park,
    Unpark,
    Stop,
    Open,
    Close,
    Read,
    Expose,
    CutLoads,
}

#[derive(Default)]
struct FaultState {
    offline: bool,
    fail_next: HashMap<SimOp, u32>,
    calls: HashMap<SimOp, u32>,
}

/// Per-device call counters and scripted failures.
#[derive(Default)]
pub struct FaultInjector {
    device: String,
    state: Mutex<FaultState>,
}

impl FaultInjector {
    fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            state: Mutex::new(FaultState::default()),
        }
    }

    /// While offline every operation fails with `DeviceUnreachable`.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Fail the next `count` calls of `op` with a device fault.
    pub fn fail_next(&self, op: SimOp, count: u32) {
        self.state.lock().fail_next.insert(op, count);
    }

    /// Number of times `op` has been invoked, failed calls included.
    pub fn calls(&self, op: SimOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    fn enter(&self, op: SimOp) -> Result<(), VigilError> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_default() += 1;
        if state.offline {
            return Err(VigilError::unreachable(&self.device, "simulated link down"));
        }
        if let Some(remaining) = state.fail_next.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(VigilError::fault(
                &self.device,
                format!("simulated {op:?} failure"),
            ));
        }
        Ok(())
    }
}

/// Travel times used by the motion simulators.
#[derive(Debug, Clone, Copy)]
pub struct SimTiming {
    pub slew: Duration,
    pub park: Duration,
    pub roof: Duration,
}

impl Default for SimTiming {
    fn default() -> Self {
        Self {
            slew: Duration::from_millis(200),
            park: Duration::from_millis(100),
            roof: Duration::from_millis(100),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Mount
// ────────────────────────────────────────────────────────────────────────────

const PARK_POSITION: EquatorialCoords = EquatorialCoords {
    ra_hours: 0.0,
    dec_deg: 90.0,
};

struct MountSim {
    status: MountStatus,
    position: EquatorialCoords,
    slew_from: EquatorialCoords,
    slew_to: Option<EquatorialCoords>,
}

pub struct SimMount {
    pub faults: FaultInjector,
    timing: SimTiming,
    inner: Mutex<MountSim>,
}

impl SimMount {
    pub fn new(timing: SimTiming) -> Self {
        Self {
            faults: FaultInjector::new("mount"),
            timing,
            inner: Mutex::new(MountSim {
                status: MountStatus::Parked,
                position: PARK_POSITION,
                slew_from: PARK_POSITION,
                slew_to: None,
            }),
        }
    }

    /// Current state without going through fault injection.
    pub fn snapshot(&self) -> MountState {
        let inner = self.inner.lock();
        MountState {
            status: inner.status,
            position: Some(inner.position),
        }
    }

    /// Force the simulated status, e.g. to start a test unparked.
    pub fn set_status(&self, status: MountStatus) {
        self.inner.lock().status = status;
    }
}

#[async_trait]
impl Device for SimMount {
    fn name(&self) -> &str {
        "mount"
    }

    async fn connect(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Connect)
    }

    async fn ping(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Ping)
    }
}

#[async_trait]
impl Mount for SimMount {
    async fn state(&self) -> Result<MountState, VigilError> {
        self.faults.enter(SimOp::State)?;
        Ok(self.snapshot())
    }

    async fn slew(&self, target: EquatorialCoords) -> Result<MountState, VigilError> {
        self.faults.enter(SimOp::Slew)?;
        {
            let mut inner = self.inner.lock();
            if inner.status == MountStatus::Parked {
                return Err(VigilError::fault("mount", "cannot slew while parked"));
            }
            inner.status = MountStatus::Slewing;
            inner.slew_from = inner.position;
            inner.slew_to = Some(target);
        }
        tokio::time::sleep(self.timing.slew).await;
        let mut inner = self.inner.lock();
        if inner.status != MountStatus::Slewing {
            return Err(VigilError::fault("mount", "slew interrupted"));
        }
        inner.status = MountStatus::Tracking;
        inner.position = target;
        inner.slew_to = None;
        Ok(MountState {
            status: inner.status,
            position: Some(inner.position),
        })
    }

    async fn park(&self) -> Result<MountState, VigilError> {
        self.faults.enter(SimOp::Park)?;
        {
            let mut inner = self.inner.lock();
            if inner.status == MountStatus::Parked {
                return Ok(MountState {
                    status: inner.status,
                    position: Some(inner.position),
                });
            }
            inner.status = MountStatus::Parking;
        }
        tokio::time::sleep(self.timing.park).await;
        let mut inner = self.inner.lock();
        if inner.status != MountStatus::Parking {
            return Err(VigilError::fault("mount", "park interrupted"));
        }
        inner.status = MountStatus::Parked;
        inner.position = PARK_POSITION;
        Ok(MountState {
            status: inner.status,
            position: Some(inner.position),
        })
    }

    async fn unpark(&self) -> Result<MountState, VigilError> {
        self.faults.enter(SimOp::Unpark)?;
        let mut inner = self.inner.lock();
        if inner.status == MountStatus::Parked {
            inner.status = MountStatus::Tracking;
        }
        Ok(MountState {
            status: inner.status,
            position: Some(inner.position),
        })
    }

    async fn stop(&self) -> Result<MountState, VigilError> {
        self.faults.enter(SimOp::Stop)?;
        let mut inner = self.inner.lock();
        if let (MountStatus::Slewing, Some(to)) = (inner.status, inner.slew_to) {
            let from = inner.slew_from;
            inner.position = EquatorialCoords {
                ra_hours: (from.ra_hours + to.ra_hours) / 2.0,
                dec_deg: (from.dec_deg + to.dec_deg) / 2.0,
            };
            inner.slew_to = None;
        }
        if inner.status != MountStatus::Parked {
            inner.status = MountStatus::Stopped;
        }
        Ok(MountState {
            status: inner.status,
            position: Some(inner.position),
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Enclosure
// ────────────────────────────────────────────────────────────────────────────

pub struct SimEnclosure {
    pub faults: FaultInjector,
    timing: SimTiming,
    state: Mutex<EnclosureState>,
    rain_line: watch::Sender<bool>,
}

impl SimEnclosure {
    pub fn new(timing: SimTiming) -> Self {
        let (rain_line, _) = watch::channel(false);
        Self {
            faults: FaultInjector::new("enclosure"),
            timing,
            state: Mutex::new(EnclosureState::Closed),
            rain_line,
        }
    }

    pub fn snapshot(&self) -> EnclosureState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: EnclosureState) {
        *self.state.lock() = state;
    }

    /// Drive the hardware rain line.
    pub fn trigger_rain(&self, raining: bool) {
        self.rain_line.send_replace(raining);
    }

    async fn travel(
        &self,
        moving: EnclosureState,
        done: EnclosureState,
    ) -> Result<EnclosureState, VigilError> {
        {
            let mut state = self.state.lock();
            if *state == done {
                return Ok(done);
            }
            *state = moving;
        }
        tokio::time::sleep(self.timing.roof).await;
        let mut state = self.state.lock();
        if *state != moving {
            return Err(VigilError::fault("enclosure", "travel interrupted"));
        }
        *state = done;
        Ok(done)
    }
}

#[async_trait]
impl Device for SimEnclosure {
    fn name(&self) -> &str {
        "enclosure"
    }

    async fn connect(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Connect)
    }

    async fn ping(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Ping)
    }
}

#[async_trait]
impl Enclosure for SimEnclosure {
    async fn state(&self) -> Result<EnclosureState, VigilError> {
        self.faults.enter(SimOp::State)?;
        Ok(self.snapshot())
    }

    async fn open(&self) -> Result<EnclosureState, VigilError> {
        self.faults.enter(SimOp::Open)?;
        self.travel(EnclosureState::Opening, EnclosureState::Open).await
    }

    async fn close(&self) -> Result<EnclosureState, VigilError> {
        self.faults.enter(SimOp::Close)?;
        self.travel(EnclosureState::Closing, EnclosureState::Closed).await
    }

    async fn stop(&self) -> Result<EnclosureState, VigilError> {
        self.faults.enter(SimOp::Stop)?;
        let mut state = self.state.lock();
        if state.is_moving() {
            *state = EnclosureState::Stopped;
        }
        Ok(*state)
    }

    async fn position_percent(&self) -> Result<f64, VigilError> {
        self.faults.enter(SimOp::State)?;
        Ok(match self.snapshot() {
            EnclosureState::Open => 100.0,
            EnclosureState::Closed => 0.0,
            _ => 50.0,
        })
    }

    fn rain_interrupt(&self) -> Option<watch::Receiver<bool>> {
        Some(self.rain_line.subscribe())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Weather
// ────────────────────────────────────────────────────────────────────────────

pub struct SimWeather {
    pub faults: FaultInjector,
    reading: Mutex<Option<WeatherReading>>,
    frozen: AtomicBool,
}

impl SimWeather {
    pub fn new() -> Self {
        Self {
            faults: FaultInjector::new("weather"),
            reading: Mutex::new(Some(WeatherReading::clear_night(Utc::now()))),
            frozen: AtomicBool::new(false),
        }
    }

    /// Edit the current conditions in place.
    pub fn update(&self, edit: impl FnOnce(&mut WeatherReading)) {
        let mut reading = self.reading.lock();
        let current = reading.get_or_insert_with(|| WeatherReading::clear_night(Utc::now()));
        edit(current);
    }

    /// Make the station report "no data".
    pub fn clear(&self) {
        *self.reading.lock() = None;
    }

    /// Stop re-stamping readings so they age into staleness.
    pub fn freeze(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::SeqCst);
    }
}

impl Default for SimWeather {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for SimWeather {
    fn name(&self) -> &str {
        "weather"
    }

    async fn connect(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Connect)
    }

    async fn ping(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Ping)
    }
}

#[async_trait]
impl WeatherStation for SimWeather {
    async fn reading(&self) -> Result<Option<WeatherReading>, VigilError> {
        self.faults.enter(SimOp::Read)?;
        let mut reading = self.reading.lock();
        if !self.frozen.load(Ordering::SeqCst)
            && let Some(r) = reading.as_mut()
        {
            r.captured_at = Utc::now();
        }
        Ok(reading.clone())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Power
// ────────────────────────────────────────────────────────────────────────────

pub struct SimPower {
    pub faults: FaultInjector,
    battery: Mutex<f64>,
    loads_cut: AtomicBool,
}

impl SimPower {
    pub fn new() -> Self {
        Self {
            faults: FaultInjector::new("power"),
            battery: Mutex::new(100.0),
            loads_cut: AtomicBool::new(false),
        }
    }

    pub fn set_battery(&self, percent: f64) {
        *self.battery.lock() = percent;
    }

    pub fn loads_cut(&self) -> bool {
        self.loads_cut.load(Ordering::SeqCst)
    }
}

impl Default for SimPower {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for SimPower {
    fn name(&self) -> &str {
        "power"
    }

    async fn connect(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Connect)
    }

    async fn ping(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Ping)
    }
}

#[async_trait]
impl PowerSupply for SimPower {
    async fn battery_percent(&self) -> Result<f64, VigilError> {
        self.faults.enter(SimOp::Read)?;
        Ok(*self.battery.lock())
    }

    async fn runtime_estimate(&self) -> Result<Duration, VigilError> {
        self.faults.enter(SimOp::Read)?;
        // Two hours at full charge.
        let minutes = *self.battery.lock() * 1.2;
        Ok(Duration::from_secs_f64(minutes.max(0.0) * 60.0))
    }

    async fn cut_loads(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::CutLoads)?;
        self.loads_cut.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Ephemeris
// ────────────────────────────────────────────────────────────────────────────

pub struct SimEphemeris {
    pub faults: FaultInjector,
    sun_altitude: Mutex<f64>,
}

impl SimEphemeris {
    pub fn new() -> Self {
        Self {
            faults: FaultInjector::new("ephemeris"),
            sun_altitude: Mutex::new(-30.0),
        }
    }

    pub fn set_sun_altitude(&self, degrees: f64) {
        *self.sun_altitude.lock() = degrees;
    }
}

impl Default for SimEphemeris {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for SimEphemeris {
    fn name(&self) -> &str {
        "ephemeris"
    }

    async fn connect(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Connect)
    }

    async fn ping(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Ping)
    }
}

#[async_trait]
impl Ephemeris for SimEphemeris {
    async fn sun_altitude_deg(&self) -> Result<f64, VigilError> {
        self.faults.enter(SimOp::Read)?;
        Ok(*self.sun_altitude.lock())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Camera
// ────────────────────────────────────────────────────────────────────────────

pub struct SimCamera {
    pub faults: FaultInjector,
}

impl SimCamera {
    pub fn new() -> Self {
        Self {
            faults: FaultInjector::new("camera"),
        }
    }
}

impl Default for SimCamera {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Device for SimCamera {
    fn name(&self) -> &str {
        "camera"
    }

    async fn connect(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Connect)
    }

    async fn ping(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Ping)
    }
}

#[async_trait]
impl Camera for SimCamera {
    async fn expose(&self, duration: Duration) -> Result<Exposure, VigilError> {
        self.faults.enter(SimOp::Expose)?;
        tokio::time::sleep(duration).await;
        Ok(Exposure {
            duration,
            completed_at: Utc::now(),
        })
    }

    async fn abort(&self) -> Result<(), VigilError> {
        self.faults.enter(SimOp::Stop)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Alert sink
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
    failing: AtomicBool,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    /// Poll until at least `count` alerts arrived or `timeout` elapsed.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.alerts.lock().len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, alert: &Alert) -> Result<(), VigilError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(VigilError::unreachable("alerts", "simulated delivery failure"));
        }
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Whole site
// ────────────────────────────────────────────────────────────────────────────

/// A complete simulated observatory with typed handles for test control.
pub struct SimSite {
    pub mount: Arc<SimMount>,
    pub enclosure: Arc<SimEnclosure>,
    pub weather: Arc<SimWeather>,
    pub power: Arc<SimPower>,
    pub ephemeris: Arc<SimEphemeris>,
    pub camera: Arc<SimCamera>,
}

impl SimSite {
    pub fn new() -> Self {
        Self::with_timing(SimTiming::default())
    }

    pub fn with_timing(timing: SimTiming) -> Self {
        Self {
            mount: Arc::new(SimMount::new(timing)),
            enclosure: Arc::new(SimEnclosure::new(timing)),
            weather: Arc::new(SimWeather::new()),
            power: Arc::new(SimPower::new()),
            ephemeris: Arc::new(SimEphemeris::new()),
            camera: Arc::new(SimCamera::new()),
        }
    }

    /// Registry over all six simulators.
    pub fn registry(&self) -> DeviceRegistry {
        DeviceRegistry::new(
            self.mount.clone(),
            self.enclosure.clone(),
            self.weather.clone(),
            self.power.clone(),
            self.ephemeris.clone(),
        )
        .with_camera(self.camera.clone())
    }
}

impl Default for SimSite {
    fn default() -> Self {
        Self::new()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> EquatorialCoords {
        EquatorialCoords {
            ra_hours: 6.0,
            dec_deg: 30.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mount_refuses_to_slew_while_parked() {
        let mount = SimMount::new(SimTiming::default());
        assert!(mount.slew(target()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slew_reaches_target_and_tracks() -> Result<(), VigilError> {
        let mount = SimMount::new(SimTiming::default());
        mount.unpark().await?;
        let state = mount.slew(target()).await?;
        assert_eq!(state.status, MountStatus::Tracking);
        assert_eq!(state.position, Some(target()));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_slew_leaves_mount_between_positions() -> Result<(), VigilError> {
        let mount = Arc::new(SimMount::new(SimTiming {
            slew: Duration::from_secs(10),
            ..SimTiming::default()
        }));
        mount.unpark().await?;

        let slewing = mount.clone();
        let handle = tokio::spawn(async move { slewing.slew(target()).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(mount.snapshot().status, MountStatus::Slewing);

        let stopped = mount.stop().await?;
        assert_eq!(stopped.status, MountStatus::Stopped);
        let position = stopped.position.ok_or_else(|| VigilError::fault("test", "no position"))?;
        assert_ne!(position, target());
        assert_ne!(position, PARK_POSITION);

        let slew_result = handle.await.map_err(|e| VigilError::fault("test", e.to_string()))?;
        assert!(slew_result.is_err(), "interrupted slew must report failure");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn offline_device_is_unreachable() {
        let power = SimPower::new();
        power.faults.set_offline(true);
        assert!(matches!(
            power.battery_percent().await,
            Err(VigilError::DeviceUnreachable { .. })
        ));
        power.faults.set_offline(false);
        assert!(power.ping().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn enclosure_opens_and_closes() -> Result<(), VigilError> {
        let enclosure = SimEnclosure::new(SimTiming::default());
        assert_eq!(enclosure.open().await?, EnclosureState::Open);
        assert_eq!(enclosure.position_percent().await?, 100.0);
        assert_eq!(enclosure.close().await?, EnclosureState::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn rain_line_notifies_subscribers() -> Result<(), Box<dyn std::error::Error>> {
        let enclosure = SimEnclosure::new(SimTiming::default());
        let mut line = enclosure.rain_interrupt().ok_or("no rain line")?;
        enclosure.trigger_rain(true);
        line.changed().await?;
        assert!(*line.borrow());
        Ok(())
    }

    #[tokio::test]
    async fn frozen_weather_keeps_its_timestamp() -> Result<(), VigilError> {
        let weather = SimWeather::new();
        let stamp = Utc::now() - chrono::Duration::minutes(10);
        weather.update(|r| r.captured_at = stamp);
        weather.freeze(true);
        let reading = weather.reading().await?;
        assert_eq!(reading.map(|r| r.captured_at), Some(stamp));

        weather.clear();
        assert!(weather.reading().await?.is_none());
        Ok(())
    }
}
