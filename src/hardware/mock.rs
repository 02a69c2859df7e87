//! Mock Hardware Implementations
//!
//! Simulated devices for tests and for running the workstation without the
//! bench attached. All delays use `tokio::time::sleep` so hardware-call
//! timeouts can cancel them.
//!
//! # Available Mocks
//!
//! - `MockStageBus` - ESP300-like controller with scripted identity answers,
//!   fixed axis positions and fault injection
//! - `MockActuatorDriver` - flip mount that records every call with a
//!   timestamp and tracks how many handles are open at once

use crate::hardware::capabilities::{
    ActuatorDriver, ActuatorLink, DataCharacteristics, StageBus, StageLink,
};
use crate::stage::{Axis, StageConnection};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::sleep;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockStageBus - Simulated Stage Controller
// =============================================================================

#[derive(Debug, Default)]
struct StageSim {
    identities: VecDeque<Option<String>>,
    fallback_identity: Option<String>,
    positions: [f64; 3],
    open_fails: bool,
    position_fails: bool,
    response_delay: Duration,
}

#[derive(Debug, Default)]
struct StageShared {
    sim: Mutex<StageSim>,
    opens: AtomicUsize,
    identity_queries: AtomicUsize,
    position_queries: AtomicUsize,
}

/// Simulated stage controller bus.
///
/// Identity answers are consumed from a script in order; once the script is
/// empty every probe gets the fallback identity (`None` unless set).
///
/// # Example
///
/// ```rust,ignore
/// let bus = MockStageBus::new();
/// bus.push_identity(None);
/// bus.push_identity(Some("ESP300"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockStageBus {
    shared: Arc<StageShared>,
}

impl MockStageBus {
    /// Controller that never answers a probe until scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller that always answers with `identity`.
    pub fn with_identity(identity: impl Into<String>) -> Self {
        let bus = Self::new();
        lock(&bus.shared.sim).fallback_identity = Some(identity.into());
        bus
    }

    /// Queue the answer for the next unanswered probe.
    pub fn push_identity(&self, identity: Option<&str>) {
        lock(&self.shared.sim)
            .identities
            .push_back(identity.map(str::to_string));
    }

    /// Answer used once the script is exhausted.
    pub fn set_fallback_identity(&self, identity: Option<&str>) {
        lock(&self.shared.sim).fallback_identity = identity.map(str::to_string);
    }

    /// Set the x/y/z positions in mm.
    pub fn set_positions(&self, x: f64, y: f64, z: f64) {
        lock(&self.shared.sim).positions = [x, y, z];
    }

    /// Make `open` fail.
    pub fn set_open_fails(&self, fails: bool) {
        lock(&self.shared.sim).open_fails = fails;
    }

    /// Make position queries fail.
    pub fn set_position_fails(&self, fails: bool) {
        lock(&self.shared.sim).position_fails = fails;
    }

    /// Delay every query by `delay`.
    pub fn set_response_delay(&self, delay: Duration) {
        lock(&self.shared.sim).response_delay = delay;
    }

    /// Number of open attempts, including failed ones.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Number of identity queries served.
    pub fn identity_queries(&self) -> usize {
        self.shared.identity_queries.load(Ordering::SeqCst)
    }

    /// Number of single-axis position queries served.
    pub fn position_queries(&self) -> usize {
        self.shared.position_queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageBus for MockStageBus {
    async fn open(&self, connection: &StageConnection) -> Result<Box<dyn StageLink>> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        if lock(&self.shared.sim).open_fails {
            bail!("MockStageBus: no controller on {}", connection.endpoint);
        }
        Ok(Box::new(MockStageLink {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MockStageLink {
    shared: Arc<StageShared>,
}

impl MockStageLink {
    async fn respond_delay(&self) {
        let delay = lock(&self.shared.sim).response_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }
}

#[async_trait]
impl StageLink for MockStageLink {
    async fn read_identity(&mut self) -> Result<Option<String>> {
        self.respond_delay().await;
        self.shared.identity_queries.fetch_add(1, Ordering::SeqCst);
        let mut sim = lock(&self.shared.sim);
        let answer = match sim.identities.pop_front() {
            Some(scripted) => scripted,
            None => sim.fallback_identity.clone(),
        };
        Ok(answer)
    }

    async fn read_axis_position(&mut self, axis: Axis) -> Result<f64> {
        self.respond_delay().await;
        self.shared.position_queries.fetch_add(1, Ordering::SeqCst);
        let sim = lock(&self.shared.sim);
        if sim.position_fails {
            bail!("MockStageBus: axis {} not responding", axis);
        }
        Ok(sim.positions[usize::from(axis.controller_number() - 1)])
    }
}

// =============================================================================
// MockActuatorDriver - Recording Flip Mount
// =============================================================================

/// Actuator primitive, used to target fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorOp {
    /// `open_by_serial`
    Open,
    /// `set_baud_rate`
    SetBaudRate,
    /// `set_data_characteristics`
    SetDataCharacteristics,
    /// `purge`
    Purge,
    /// `reset_device`
    ResetDevice,
    /// `set_flow_control_rts_cts`
    SetFlowControl,
    /// `set_rts`
    SetRts,
    /// `write`
    Write,
    /// `close`
    Close,
}

/// One recorded actuator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActuatorEvent {
    /// Handle opened for this serial
    Open(String),
    /// Baud rate set
    SetBaudRate(u32),
    /// Framing set
    SetDataCharacteristics(DataCharacteristics),
    /// Buffers purged
    Purge,
    /// Device reset
    ResetDevice,
    /// RTS/CTS flow control enabled
    SetFlowControl,
    /// RTS asserted
    SetRts,
    /// Bytes written
    Write(Vec<u8>),
    /// Handle closed
    Close,
}

impl ActuatorEvent {
    /// The primitive this event came from.
    pub fn op(&self) -> ActuatorOp {
        match self {
            ActuatorEvent::Open(_) => ActuatorOp::Open,
            ActuatorEvent::SetBaudRate(_) => ActuatorOp::SetBaudRate,
            ActuatorEvent::SetDataCharacteristics(_) => ActuatorOp::SetDataCharacteristics,
            ActuatorEvent::Purge => ActuatorOp::Purge,
            ActuatorEvent::ResetDevice => ActuatorOp::ResetDevice,
            ActuatorEvent::SetFlowControl => ActuatorOp::SetFlowControl,
            ActuatorEvent::SetRts => ActuatorOp::SetRts,
            ActuatorEvent::Write(_) => ActuatorOp::Write,
            ActuatorEvent::Close => ActuatorOp::Close,
        }
    }
}

/// A recorded call and when it happened.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// What was called
    pub event: ActuatorEvent,
    /// When the call completed
    pub at: Instant,
}

#[derive(Debug, Default)]
struct ActuatorSim {
    serial: String,
    events: Vec<RecordedEvent>,
    fail_on: Option<ActuatorOp>,
    hang_on: Option<ActuatorOp>,
    call_delay: Duration,
}

#[derive(Debug, Default)]
struct ActuatorShared {
    sim: Mutex<ActuatorSim>,
    open_handles: AtomicUsize,
    max_open_handles: AtomicUsize,
}

/// Recording flip mount driver.
#[derive(Debug, Clone)]
pub struct MockActuatorDriver {
    shared: Arc<ActuatorShared>,
}

impl MockActuatorDriver {
    /// Device that answers to `serial`.
    pub fn new(serial: impl Into<String>) -> Self {
        let shared = ActuatorShared::default();
        lock(&shared.sim).serial = serial.into();
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Make the given primitive return an error.
    pub fn fail_on(&self, op: ActuatorOp) {
        lock(&self.shared.sim).fail_on = Some(op);
    }

    /// Make the given primitive never return.
    pub fn hang_on(&self, op: ActuatorOp) {
        lock(&self.shared.sim).hang_on = Some(op);
    }

    /// Remove injected faults.
    pub fn clear_faults(&self) {
        let mut sim = lock(&self.shared.sim);
        sim.fail_on = None;
        sim.hang_on = None;
    }

    /// Add a delay to every primitive.
    pub fn set_call_delay(&self, delay: Duration) {
        lock(&self.shared.sim).call_delay = delay;
    }

    /// Everything recorded so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.shared.sim).events.clone()
    }

    /// Recorded primitives without timestamps.
    pub fn ops(&self) -> Vec<ActuatorOp> {
        lock(&self.shared.sim)
            .events
            .iter()
            .map(|recorded| recorded.event.op())
            .collect()
    }

    /// Every frame written, in order.
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.shared.sim)
            .events
            .iter()
            .filter_map(|recorded| match &recorded.event {
                ActuatorEvent::Write(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    /// Count of recorded calls to `op`.
    pub fn count(&self, op: ActuatorOp) -> usize {
        self.ops().into_iter().filter(|o| *o == op).count()
    }

    /// Handles currently open.
    pub fn open_handles(&self) -> usize {
        self.shared.open_handles.load(Ordering::SeqCst)
    }

    /// Largest number of handles that were ever open together.
    pub fn max_open_handles(&self) -> usize {
        self.shared.max_open_handles.load(Ordering::SeqCst)
    }

    /// Open/close instants of each handle, in order.
    pub fn handle_intervals(&self) -> Vec<(Instant, Instant)> {
        let mut intervals = Vec::new();
        let mut opened = None;
        for recorded in lock(&self.shared.sim).events.iter() {
            match recorded.event {
                ActuatorEvent::Open(_) => opened = Some(recorded.at),
                ActuatorEvent::Close => {
                    if let Some(start) = opened.take() {
                        intervals.push((start, recorded.at));
                    }
                }
                _ => {}
            }
        }
        intervals
    }

    async fn enter(shared: &ActuatorShared, op: ActuatorOp) -> Result<()> {
        let (delay, hang, fail) = {
            let sim = lock(&shared.sim);
            (
                sim.call_delay,
                sim.hang_on == Some(op),
                sim.fail_on == Some(op),
            )
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            return Err(anyhow!("MockActuator: injected fault in {:?}", op));
        }
        Ok(())
    }

    fn record(shared: &ActuatorShared, event: ActuatorEvent) {
        lock(&shared.sim).events.push(RecordedEvent {
            event,
            at: Instant::now(),
        });
    }
}

#[async_trait]
impl ActuatorDriver for MockActuatorDriver {
    async fn open_by_serial(&self, serial: &str) -> Result<Box<dyn ActuatorLink>> {
        Self::enter(&self.shared, ActuatorOp::Open).await?;
        let known = lock(&self.shared.sim).serial.clone();
        if serial != known {
            bail!("MockActuator: no device with serial {}", serial);
        }

        let open = self.shared.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_open_handles.fetch_max(open, Ordering::SeqCst);
        Self::record(&self.shared, ActuatorEvent::Open(serial.to_string()));

        Ok(Box::new(MockActuatorLink {
            shared: Arc::clone(&self.shared),
            closed: false,
        }))
    }
}

struct MockActuatorLink {
    shared: Arc<ActuatorShared>,
    closed: bool,
}

impl MockActuatorLink {
    async fn call(&self, op: ActuatorOp, event: ActuatorEvent) -> Result<()> {
        if self.closed {
            bail!("MockActuator: {:?} on closed handle", op);
        }
        MockActuatorDriver::enter(&self.shared, op).await?;
        MockActuatorDriver::record(&self.shared, event);
        Ok(())
    }
}

#[async_trait]
impl ActuatorLink for MockActuatorLink {
    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.call(ActuatorOp::SetBaudRate, ActuatorEvent::SetBaudRate(baud_rate))
            .await
    }

    async fn set_data_characteristics(&mut self, framing: DataCharacteristics) -> Result<()> {
        self.call(
            ActuatorOp::SetDataCharacteristics,
            ActuatorEvent::SetDataCharacteristics(framing),
        )
        .await
    }

    async fn purge(&mut self) -> Result<()> {
        self.call(ActuatorOp::Purge, ActuatorEvent::Purge).await
    }

    async fn reset_device(&mut self) -> Result<()> {
        self.call(ActuatorOp::ResetDevice, ActuatorEvent::ResetDevice)
            .await
    }

    async fn set_flow_control_rts_cts(&mut self) -> Result<()> {
        self.call(ActuatorOp::SetFlowControl, ActuatorEvent::SetFlowControl)
            .await
    }

    async fn set_rts(&mut self) -> Result<()> {
        self.call(ActuatorOp::SetRts, ActuatorEvent::SetRts).await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.call(ActuatorOp::Write, ActuatorEvent::Write(bytes.to_vec()))
            .await
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            bail!("MockActuator: handle closed twice");
        }
        self.closed = true;
        self.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
        MockActuatorDriver::record(&self.shared, ActuatorEvent::Close);
        MockActuatorDriver::enter(&self.shared, ActuatorOp::Close).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;

    #[tokio::test]
    async fn test_stage_script_then_fallback() {
        let bus = MockStageBus::new();
        bus.push_identity(Some("first"));
        bus.set_fallback_identity(Some("steady"));

        let connection = StageConnection::from_config(&StageConfig::default());
        let mut link = bus.open(&connection).await.unwrap();
        assert_eq!(link.read_identity().await.unwrap().as_deref(), Some("first"));
        assert_eq!(link.read_identity().await.unwrap().as_deref(), Some("steady"));
        assert_eq!(bus.identity_queries(), 2);
    }

    #[tokio::test]
    async fn test_stage_positions_per_axis() {
        let bus = MockStageBus::with_identity("ESP300");
        bus.set_positions(1.5, 2.5, 3.5);
        let connection = StageConnection::from_config(&StageConfig::default());
        let mut link = bus.open(&connection).await.unwrap();
        assert_eq!(link.read_axis_position(Axis::Y).await.unwrap(), 2.5);
        assert_eq!(link.read_axis_position(Axis::Z).await.unwrap(), 3.5);
    }

    #[tokio::test]
    async fn test_actuator_records_calls() {
        let driver = MockActuatorDriver::new("37000805");
        let mut link = driver.open_by_serial("37000805").await.unwrap();
        assert_eq!(driver.open_handles(), 1);

        link.set_baud_rate(115_200).await.unwrap();
        link.write(&[0x6A, 0x04]).await.unwrap();
        link.close().await.unwrap();

        assert_eq!(
            driver.ops(),
            vec![
                ActuatorOp::Open,
                ActuatorOp::SetBaudRate,
                ActuatorOp::Write,
                ActuatorOp::Close
            ]
        );
        assert_eq!(driver.written_frames(), vec![vec![0x6A, 0x04]]);
        assert_eq!(driver.open_handles(), 0);
        assert_eq!(driver.handle_intervals().len(), 1);
    }

    #[tokio::test]
    async fn test_actuator_unknown_serial() {
        let driver = MockActuatorDriver::new("37000805");
        assert!(driver.open_by_serial("00000000").await.is_err());
        assert_eq!(driver.open_handles(), 0);
        assert!(driver.events().is_empty());
    }

    #[tokio::test]
    async fn test_actuator_double_close_is_rejected() {
        let driver = MockActuatorDriver::new("37000805");
        let mut link = driver.open_by_serial("37000805").await.unwrap();
        link.close().await.unwrap();
        assert!(link.close().await.is_err());
        assert_eq!(driver.count(ActuatorOp::Close), 1);
    }
}
