//! Stage connection manager.
//!
//! Owns the one logical link to the multi-axis motion controller, answers
//! identity and position queries and tracks [`ConnectionState`].
//!
//! Faults on this path never escalate: a failed probe is a negative result and
//! a failed position read yields a zeroed sample. The link is dropped after a
//! fault so the next tick reopens it.

use crate::error::{AppResult, DaqError};
use crate::hardware::{bounded, StageBus, StageLink};
use crate::scheduler::ReconnectPolicy;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

/// Stage axes, mapped to controller axis numbers 1..=3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Controller axis 1
    X,
    /// Controller axis 2
    Y,
    /// Controller axis 3
    Z,
}

impl Axis {
    /// All axes in controller order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// 1-based axis number used on the controller wire protocol.
    pub fn controller_number(self) -> u8 {
        match self {
            Axis::X => 1,
            Axis::Y => 2,
            Axis::Z => 3,
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        };
        f.write_str(name)
    }
}

/// Connection health as seen by the probe timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// No probe has succeeded (or, with [`ReconnectPolicy::Reprobe`], the last one failed)
    #[default]
    Disconnected,
    /// A probe is in flight and no connection has been confirmed yet
    Probing,
    /// The controller answered a probe
    Established,
}

impl ConnectionState {
    /// Whether position queries go to hardware.
    pub fn is_established(self) -> bool {
        self == ConnectionState::Established
    }
}

/// One telemetry reading. Each sample supersedes the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionSample {
    /// X position in mm
    pub x: f64,
    /// Y position in mm
    pub y: f64,
    /// Z position in mm
    pub z: f64,
    /// Seconds since the Unix epoch when the sample was taken
    pub timestamp_seconds: f64,
}

impl PositionSample {
    /// Zeroed sample at the given time.
    pub fn zeroed(timestamp_seconds: f64) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            timestamp_seconds,
        }
    }

    /// Zeroed sample stamped now.
    pub fn zeroed_now() -> Self {
        Self::zeroed(unix_seconds(Utc::now()))
    }

    /// True when all axes read zero.
    pub fn is_zero(&self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }
}

/// Seconds since the Unix epoch with microsecond resolution.
pub fn unix_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Link parameters and cached identity of the stage controller.
///
/// Created once at startup and owned by [`StageConnectionManager`] for the
/// lifetime of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConnection {
    /// Bus address of the controller (serial device path)
    pub endpoint: String,
    /// Data bits per character
    pub data_bits: u8,
    /// Baud rate
    pub baud_rate: u32,
    /// Stop bits
    pub stop_bits: u8,
    /// Terminator expected after each response
    pub read_terminator: String,
    /// Terminator appended to each command
    pub write_terminator: String,
    /// Identity reported by the first successful probe
    pub identity: Option<String>,
    /// When the first probe succeeded
    pub established_at: Option<DateTime<Utc>>,
}

impl StageConnection {
    /// Build from the stage section of the settings.
    pub fn from_config(config: &crate::config::StageConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            data_bits: config.data_bits,
            baud_rate: config.baud_rate,
            stop_bits: config.stop_bits,
            read_terminator: config.read_terminator.clone(),
            write_terminator: config.write_terminator.clone(),
            identity: None,
            established_at: None,
        }
    }
}

/// Snapshot of the controller for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageDetails {
    /// Current connection state
    pub state: ConnectionState,
    /// Identity if established
    pub identity: Option<String>,
    /// Controller bus address
    pub endpoint: String,
    /// When the connection was first confirmed
    pub established_at: Option<DateTime<Utc>>,
}

/// Maintains the controller link and answers identity/position queries.
pub struct StageConnectionManager {
    bus: Arc<dyn StageBus>,
    connection: RwLock<StageConnection>,
    link: Mutex<Option<Box<dyn StageLink>>>,
    state: watch::Sender<ConnectionState>,
    reconnect: ReconnectPolicy,
    io_timeout: Duration,
}

impl StageConnectionManager {
    /// Create a manager in the `Disconnected` state. No I/O happens here.
    pub fn new(
        bus: Arc<dyn StageBus>,
        connection: StageConnection,
        reconnect: ReconnectPolicy,
        io_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            bus,
            connection: RwLock::new(connection),
            link: Mutex::new(None),
            state,
            reconnect,
            io_timeout,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Try to open the link ahead of the first probe. Failure is logged only.
    pub async fn connect(&self) {
        let mut link = self.link.lock().await;
        if link.is_some() {
            return;
        }
        match self.open_link().await {
            Ok(opened) => *link = Some(opened),
            Err(e) => debug!("Stage link not available yet: {}", e),
        }
    }

    /// Drop the link. State and cached identity are kept.
    pub async fn disconnect(&self) {
        if self.link.lock().await.take().is_some() {
            info!("Stage link closed");
        }
    }

    /// Read the controller identity.
    ///
    /// Returns `true` and caches the identity when the controller answered
    /// with a non-empty string. Never fails: bus faults are a `false` result.
    pub async fn probe_connection(&self) -> bool {
        let was_established = self.state().is_established();
        if !was_established {
            self.state.send_replace(ConnectionState::Probing);
        }

        let outcome = self.read_identity().await;
        match outcome {
            Ok(Some(identity)) => {
                self.record_identity(identity, was_established).await;
                true
            }
            Ok(None) => {
                debug!("Stage probe: controller returned no identity");
                self.on_probe_failed(was_established);
                false
            }
            Err(e) => {
                debug!("Stage probe failed: {}", e);
                self.on_probe_failed(was_established);
                false
            }
        }
    }

    /// Cached identity while established.
    pub async fn current_identity(&self) -> Option<String> {
        if !self.state().is_established() {
            return None;
        }
        self.connection.read().await.identity.clone()
    }

    /// Current position, or a zeroed sample when not established or on a bus fault.
    pub async fn current_position(&self) -> PositionSample {
        if !self.state().is_established() {
            return PositionSample::zeroed_now();
        }

        match self.read_position().await {
            Ok(sample) => {
                trace!(
                    "Stage position x={} y={} z={}",
                    sample.x,
                    sample.y,
                    sample.z
                );
                sample
            }
            Err(e) => {
                warn!("Stage position read failed, reporting zero: {}", e);
                PositionSample::zeroed_now()
            }
        }
    }

    /// Snapshot for display.
    pub async fn details(&self) -> StageDetails {
        let state = self.state();
        let connection = self.connection.read().await;
        StageDetails {
            state,
            identity: if state.is_established() {
                connection.identity.clone()
            } else {
                None
            },
            endpoint: connection.endpoint.clone(),
            established_at: connection.established_at,
        }
    }

    async fn open_link(&self) -> AppResult<Box<dyn StageLink>> {
        let connection = self.connection.read().await.clone();
        bounded("stage_open", self.io_timeout, self.bus.open(&connection))
            .await?
            .map_err(|e| {
                DaqError::ConnectionUnavailable(format!(
                    "cannot open {}: {:#}",
                    connection.endpoint, e
                ))
            })
    }

    async fn read_identity(&self) -> AppResult<Option<String>> {
        let mut guard = self.link.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_link().await?);
        }
        let Some(link) = guard.as_mut() else {
            return Err(DaqError::ConnectionUnavailable("no stage link".to_string()));
        };

        let result = match bounded("read_identity", self.io_timeout, link.read_identity()).await
        {
            Ok(Ok(identity)) => Ok(identity
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())),
            Ok(Err(e)) => Err(DaqError::ConnectionUnavailable(format!(
                "identity query failed: {e:#}"
            ))),
            Err(timeout) => Err(timeout),
        };

        if result.is_err() {
            *guard = None;
        }
        result
    }

    async fn read_position(&self) -> AppResult<PositionSample> {
        let mut guard = self.link.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_link().await?);
        }
        let Some(link) = guard.as_mut() else {
            return Err(DaqError::ConnectionUnavailable("no stage link".to_string()));
        };

        let mut values = [0.0_f64; 3];
        for (slot, axis) in values.iter_mut().zip(Axis::ALL) {
            let read = bounded(
                "read_axis_position",
                self.io_timeout,
                link.read_axis_position(axis),
            )
            .await;
            match read {
                Ok(Ok(value)) => *slot = value,
                Ok(Err(e)) => {
                    *guard = None;
                    return Err(DaqError::ConnectionUnavailable(format!(
                        "axis {axis} position query failed: {e:#}"
                    )));
                }
                Err(timeout) => {
                    *guard = None;
                    return Err(timeout);
                }
            }
        }

        Ok(PositionSample {
            x: values[0],
            y: values[1],
            z: values[2],
            timestamp_seconds: unix_seconds(Utc::now()),
        })
    }

    async fn record_identity(&self, identity: String, was_established: bool) {
        let mut connection = self.connection.write().await;
        if !was_established {
            let now = Utc::now();
            info!(
                "Stage controller on {} established: {}",
                connection.endpoint, identity
            );
            connection.established_at = Some(now);
        } else if connection.identity.as_deref() != Some(identity.as_str()) {
            info!("Stage controller identity changed: {}", identity);
        }
        connection.identity = Some(identity);
        drop(connection);

        self.state.send_replace(ConnectionState::Established);
    }

    fn on_probe_failed(&self, was_established: bool) {
        if !was_established {
            self.state.send_replace(ConnectionState::Disconnected);
            return;
        }
        match self.reconnect {
            ReconnectPolicy::Latch => {
                debug!("Keepalive probe failed; connection stays established");
            }
            ReconnectPolicy::Reprobe => {
                warn!("Keepalive probe failed; stage connection lost");
                self.state.send_replace(ConnectionState::Disconnected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::hardware::mock::MockStageBus;

    fn manager(bus: &MockStageBus, reconnect: ReconnectPolicy) -> StageConnectionManager {
        StageConnectionManager::new(
            Arc::new(bus.clone()),
            StageConnection::from_config(&StageConfig::default()),
            reconnect,
            Duration::from_millis(200),
        )
    }

    #[test]
    fn test_axis_numbers() {
        let numbers: Vec<u8> = Axis::ALL.iter().map(|a| a.controller_number()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(Axis::Z.to_string(), "z");
    }

    #[tokio::test]
    async fn test_disconnected_position_is_zero() {
        let bus = MockStageBus::new();
        bus.set_positions(1.0, 2.0, 3.0);
        let manager = manager(&bus, ReconnectPolicy::Latch);

        let sample = manager.current_position().await;
        assert!(sample.is_zero());
        assert!(sample.timestamp_seconds > 0.0);
        assert_eq!(bus.position_queries(), 0);
    }

    #[tokio::test]
    async fn test_probe_caches_identity() {
        let bus = MockStageBus::new();
        bus.push_identity(Some("ESP300 Version 3.08"));
        let manager = manager(&bus, ReconnectPolicy::Latch);

        assert_eq!(manager.current_identity().await, None);
        assert!(manager.probe_connection().await);
        assert_eq!(manager.state(), ConnectionState::Established);
        assert_eq!(
            manager.current_identity().await.as_deref(),
            Some("ESP300 Version 3.08")
        );
        assert!(manager.details().await.established_at.is_some());
    }

    #[tokio::test]
    async fn test_blank_identity_is_negative_probe() {
        let bus = MockStageBus::new();
        bus.push_identity(Some("   "));
        let manager = manager(&bus, ReconnectPolicy::Latch);

        assert!(!manager.probe_connection().await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_probe_on_dead_bus_does_not_fail() {
        let bus = MockStageBus::new();
        bus.set_open_fails(true);
        let manager = manager(&bus, ReconnectPolicy::Latch);

        assert!(!manager.probe_connection().await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(bus.open_count(), 1);

        // Next probe reopens
        bus.set_open_fails(false);
        bus.push_identity(Some("ESP300"));
        assert!(manager.probe_connection().await);
        assert_eq!(bus.open_count(), 2);
    }

    #[tokio::test]
    async fn test_established_position_reads_all_axes() {
        let bus = MockStageBus::new();
        bus.push_identity(Some("ESP300"));
        bus.set_positions(12.5, -3.25, 0.75);
        let manager = manager(&bus, ReconnectPolicy::Latch);
        manager.probe_connection().await;

        let sample = manager.current_position().await;
        assert_eq!((sample.x, sample.y, sample.z), (12.5, -3.25, 0.75));
        assert_eq!(bus.position_queries(), 3);
    }

    #[tokio::test]
    async fn test_position_fault_degrades_to_zero_and_reopens() {
        let bus = MockStageBus::new();
        bus.push_identity(Some("ESP300"));
        bus.set_positions(1.0, 1.0, 1.0);
        let manager = manager(&bus, ReconnectPolicy::Latch);
        manager.probe_connection().await;

        bus.set_position_fails(true);
        let sample = manager.current_position().await;
        assert!(sample.is_zero());
        assert_eq!(manager.state(), ConnectionState::Established);

        bus.set_position_fails(false);
        let sample = manager.current_position().await;
        assert_eq!(sample.x, 1.0);
        assert_eq!(bus.open_count(), 2);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_position_fault_is_logged() {
        let bus = MockStageBus::with_identity("ESP300");
        bus.set_position_fails(true);
        let manager = manager(&bus, ReconnectPolicy::Latch);
        manager.probe_connection().await;

        assert!(manager.current_position().await.is_zero());
        assert!(logs_contain("Stage position read failed"));
    }

    #[tokio::test]
    async fn test_hung_bus_is_bounded() {
        let bus = MockStageBus::new();
        bus.push_identity(Some("ESP300"));
        let manager = manager(&bus, ReconnectPolicy::Latch);
        manager.probe_connection().await;

        bus.set_response_delay(Duration::from_secs(5));
        let started = std::time::Instant::now();
        let sample = manager.current_position().await;
        assert!(sample.is_zero());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_latch_keeps_established_after_failed_probe() {
        let bus = MockStageBus::new();
        bus.push_identity(Some("ESP300"));
        bus.push_identity(None);
        let manager = manager(&bus, ReconnectPolicy::Latch);

        assert!(manager.probe_connection().await);
        assert!(!manager.probe_connection().await);
        assert_eq!(manager.state(), ConnectionState::Established);
        assert_eq!(manager.current_identity().await.as_deref(), Some("ESP300"));
    }

    #[tokio::test]
    async fn test_reprobe_reverts_after_failed_probe() {
        let bus = MockStageBus::new();
        bus.push_identity(Some("ESP300"));
        bus.push_identity(None);
        let manager = manager(&bus, ReconnectPolicy::Reprobe);

        assert!(manager.probe_connection().await);
        assert!(!manager.probe_connection().await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.current_identity().await, None);
    }
}
