//! Process-scoped workstation context.
//!
//! Owns the stage connection manager, the polling scheduler and the actuator
//! protocol, and exposes the operations a presentation layer calls:
//! `probe_tick`, `stream_tick`, `toggle_actuator` and `current_identity`.
//!
//! # Example
//!
//! ```no_run
//! use autopattern_daq::config::Settings;
//! use autopattern_daq::workstation::{HardwareSet, Workstation};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let settings = Settings::load()?;
//! let hardware = HardwareSet::from_settings(&settings)?;
//! let station = Workstation::init(settings, hardware).await?;
//!
//! station.start_polling().await;
//! let mut telemetry = station.subscribe_telemetry();
//! telemetry.changed().await?;
//! println!("x = {} mm", telemetry.borrow().x);
//!
//! station.toggle_actuator(true).await?;
//! station.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::actuator::ActuatorCommandProtocol;
use crate::config::{HardwareMode, Settings};
use crate::error::{AppResult, DaqError};
use crate::hardware::mock::{MockActuatorDriver, MockStageBus};
use crate::hardware::{ActuatorDriver, StageBus, StageTransport};
use crate::scheduler::{PollingPolicy, PollingScheduler, SchedulerHandle};
use crate::stage::{
    ConnectionState, PositionSample, StageConnection, StageConnectionManager, StageDetails,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

/// Identity reported by the simulated stage controller.
pub const MOCK_STAGE_IDENTITY: &str = "ESP300 Version 3.08 09/09/02 (simulated)";

/// Feature that compiles in the flip mount driver.
pub const ACTUATOR_FEATURE: &str = "instrument_thorlabs";

/// Device backends the workstation talks to.
#[derive(Clone)]
pub struct HardwareSet {
    /// Stage controller bus
    pub stage_bus: Arc<dyn StageBus>,
    /// Flip mount driver; `None` when the driver was compiled out
    pub actuator: Option<Arc<dyn ActuatorDriver>>,
}

impl HardwareSet {
    /// Pick drivers according to `application.mode`.
    ///
    /// A missing stage transport is fatal. A missing flip mount driver only
    /// fails `toggle_actuator`, so stage telemetry still runs.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        match settings.application.mode {
            HardwareMode::Mock => Ok(Self::simulated(settings)),
            HardwareMode::Hardware => {
                let actuator = hardware_actuator(settings);
                if actuator.is_none() {
                    warn!(
                        "Flip mount driver not compiled in; build with --features {} to toggle it",
                        ACTUATOR_FEATURE
                    );
                }
                Ok(Self {
                    stage_bus: hardware_stage_bus(settings)?,
                    actuator,
                })
            }
        }
    }

    /// Simulated stage that answers immediately, and a recording flip mount.
    pub fn simulated(settings: &Settings) -> Self {
        let stage = MockStageBus::with_identity(MOCK_STAGE_IDENTITY);
        stage.set_positions(12.5, 7.25, 1.0);
        Self {
            stage_bus: Arc::new(stage),
            actuator: Some(Arc::new(MockActuatorDriver::new(
                settings.actuator.serial.clone(),
            ))),
        }
    }
}

fn hardware_stage_bus(settings: &Settings) -> AppResult<Arc<dyn StageBus>> {
    match StageTransport::for_endpoint(&settings.stage.endpoint) {
        StageTransport::Serial => serial_stage_bus(settings),
        StageTransport::Visa => visa_stage_bus(settings),
    }
}

#[cfg(feature = "instrument_newport")]
fn serial_stage_bus(settings: &Settings) -> AppResult<Arc<dyn StageBus>> {
    Ok(Arc::new(crate::hardware::esp300::Esp300Bus::new(
        settings.stage.io_timeout(),
    )))
}

#[cfg(not(feature = "instrument_newport"))]
fn serial_stage_bus(_settings: &Settings) -> AppResult<Arc<dyn StageBus>> {
    Err(DaqError::FeatureNotEnabled("instrument_newport".to_string()))
}

#[cfg(all(feature = "instrument_newport", feature = "instrument_visa"))]
fn visa_stage_bus(settings: &Settings) -> AppResult<Arc<dyn StageBus>> {
    Ok(Arc::new(crate::hardware::esp300_visa::VisaEsp300Bus::new(
        settings.stage.io_timeout(),
    )))
}

#[cfg(not(feature = "instrument_visa"))]
fn visa_stage_bus(_settings: &Settings) -> AppResult<Arc<dyn StageBus>> {
    Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
}

#[cfg(all(feature = "instrument_visa", not(feature = "instrument_newport")))]
fn visa_stage_bus(_settings: &Settings) -> AppResult<Arc<dyn StageBus>> {
    Err(DaqError::FeatureNotEnabled("instrument_newport".to_string()))
}

#[cfg(feature = "instrument_thorlabs")]
fn hardware_actuator(settings: &Settings) -> Option<Arc<dyn ActuatorDriver>> {
    Some(Arc::new(crate::hardware::mff101::Mff101Driver::new(
        Duration::from_millis(settings.actuator.io_timeout_ms),
    )))
}

#[cfg(not(feature = "instrument_thorlabs"))]
fn hardware_actuator(_settings: &Settings) -> Option<Arc<dyn ActuatorDriver>> {
    None
}

/// The device control and telemetry core for one operator session.
pub struct Workstation {
    settings: Settings,
    manager: Arc<StageConnectionManager>,
    scheduler: Arc<PollingScheduler>,
    actuator: Option<ActuatorCommandProtocol>,
    polling: Mutex<Option<SchedulerHandle>>,
}

impl Workstation {
    /// Validate settings, build the components and try a first stage open.
    ///
    /// An unreachable stage is not an error; the probe timer keeps trying.
    pub async fn init(settings: Settings, hardware: HardwareSet) -> AppResult<Self> {
        settings.validate()?;

        let manager = Arc::new(StageConnectionManager::new(
            hardware.stage_bus,
            StageConnection::from_config(&settings.stage),
            settings.polling.reconnect,
            settings.stage.io_timeout(),
        ));
        manager.connect().await;

        let scheduler = Arc::new(PollingScheduler::new(
            Arc::clone(&manager),
            settings.polling.policy(),
        ));
        let actuator = hardware
            .actuator
            .map(|driver| ActuatorCommandProtocol::new(driver, &settings.actuator));

        info!(
            "{} initialised (stage {}, flip mount {})",
            settings.application.name,
            settings.stage.endpoint,
            actuator
                .as_ref()
                .map_or("unavailable", ActuatorCommandProtocol::serial)
        );

        Ok(Self {
            settings,
            manager,
            scheduler,
            actuator,
            polling: Mutex::new(None),
        })
    }

    /// Settings this workstation was built with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run one probe-timer firing.
    pub async fn probe_tick(&self) -> ConnectionState {
        self.scheduler.probe_tick().await
    }

    /// Run one stream-timer firing.
    pub async fn stream_tick(&self) -> PositionSample {
        self.scheduler.stream_tick().await
    }

    /// Drive the flip mount; true engages.
    pub async fn toggle_actuator(&self, desired: bool) -> AppResult<String> {
        match &self.actuator {
            Some(actuator) => actuator.toggle(desired).await,
            None => Err(DaqError::FeatureNotEnabled(ACTUATOR_FEATURE.to_string())),
        }
    }

    /// Controller identity while established.
    pub async fn current_identity(&self) -> Option<String> {
        self.manager.current_identity().await
    }

    /// Controller snapshot for display.
    pub async fn details(&self) -> StageDetails {
        self.manager.details().await
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Interval until the next probe.
    pub fn probe_interval(&self) -> Duration {
        self.scheduler.probe_interval()
    }

    /// Configured timer intervals.
    pub fn polling_policy(&self) -> PollingPolicy {
        self.scheduler.policy()
    }

    /// Latest sample published by the stream timer.
    pub fn latest_sample(&self) -> PositionSample {
        self.scheduler.latest_sample()
    }

    /// Subscribe to published samples.
    pub fn subscribe_telemetry(&self) -> watch::Receiver<PositionSample> {
        self.scheduler.subscribe_telemetry()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    /// Start the probe and stream timers. Returns false if already running.
    pub async fn start_polling(&self) -> bool {
        let mut polling = self.polling.lock().await;
        if polling.is_some() {
            return false;
        }
        *polling = Some(self.scheduler.spawn());
        true
    }

    /// Whether the timers are running.
    pub async fn is_polling(&self) -> bool {
        self.polling.lock().await.is_some()
    }

    /// Stop the timers and close the stage link.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.polling.lock().await.take() {
            handle.shutdown().await;
        }
        self.manager.disconnect().await;
        info!("{} shut down", self.settings.application.name);
    }
}
