//! Flip mount actuator command protocol.
//!
//! Drives a Thorlabs MFF101 bistable flip mount with one vendor opcode frame
//! per toggle. Every toggle runs the same sequence on a freshly opened handle:
//!
//! ```text
//! open -> baud 115200 -> 8N1 -> settle -> purge -> settle -> reset
//!      -> RTS/CTS flow control -> assert RTS -> write frame -> close
//! ```
//!
//! The two settle delays are separate waits; the firmware needs the purge to
//! finish before reset. No acknowledgement is read back.
//!
//! Only one handle may exist at a time, so toggles are serialized through an
//! async mutex. A toggle that cannot get the device within the acquire
//! timeout fails with [`DaqError::ActuatorBusy`].

use crate::config::ActuatorConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::{bounded, ActuatorDriver, ActuatorLink, DataCharacteristics};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// MGMSG_MOT_MOVE_JOG, channel 1, direction 1 ("up"), destination 0x21, source 0x01.
pub const ENGAGE_FRAME: [u8; 6] = [0x6A, 0x04, 0x00, 0x01, 0x21, 0x01];

/// MGMSG_MOT_MOVE_JOG, channel 1, direction 2 ("down"), destination 0x21, source 0x01.
pub const DISENGAGE_FRAME: [u8; 6] = [0x6A, 0x04, 0x00, 0x02, 0x21, 0x01];

/// Requested flip mount position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipState {
    /// Up; laser path open
    Engaged,
    /// Down
    Disengaged,
}

impl FlipState {
    /// Opcode frame that requests this position.
    pub fn frame(self) -> &'static [u8; 6] {
        match self {
            FlipState::Engaged => &ENGAGE_FRAME,
            FlipState::Disengaged => &DISENGAGE_FRAME,
        }
    }

    /// The boolean the presentation layer uses.
    pub fn is_engaged(self) -> bool {
        self == FlipState::Engaged
    }
}

impl From<bool> for FlipState {
    fn from(desired: bool) -> Self {
        if desired {
            FlipState::Engaged
        } else {
            FlipState::Disengaged
        }
    }
}

impl fmt::Display for FlipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlipState::Engaged => f.write_str("engaged"),
            FlipState::Disengaged => f.write_str("disengaged"),
        }
    }
}

/// One toggle request. Lives only for the duration of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActuatorSession {
    /// Hardware serial of the device
    pub target_serial: String,
    /// Requested position
    pub desired_state: FlipState,
}

impl ActuatorSession {
    /// New session for `serial`.
    pub fn new(target_serial: impl Into<String>, desired_state: FlipState) -> Self {
        Self {
            target_serial: target_serial.into(),
            desired_state,
        }
    }

    /// Message returned to the caller after the frame was sent.
    pub fn confirmation(&self) -> String {
        format!(
            "The laser is on: {} (flip mount {})",
            self.desired_state.is_engaged(),
            self.desired_state
        )
    }
}

/// Delays and bounds used by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorTiming {
    /// Each of the two settle delays
    pub settle: Duration,
    /// Bound on each USB call
    pub io_timeout: Duration,
    /// How long a toggle waits for a concurrent one
    pub acquire_timeout: Duration,
}

impl From<&ActuatorConfig> for ActuatorTiming {
    fn from(config: &ActuatorConfig) -> Self {
        Self {
            settle: Duration::from_millis(config.settle_ms),
            io_timeout: Duration::from_millis(config.io_timeout_ms),
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
        }
    }
}

/// Sends toggle frames to the flip mount.
pub struct ActuatorCommandProtocol {
    driver: Arc<dyn ActuatorDriver>,
    serial: String,
    baud_rate: u32,
    timing: ActuatorTiming,
    device: Arc<Mutex<()>>,
}

impl ActuatorCommandProtocol {
    /// Protocol for the device described by `config`.
    pub fn new(driver: Arc<dyn ActuatorDriver>, config: &ActuatorConfig) -> Self {
        Self {
            driver,
            serial: config.serial.clone(),
            baud_rate: config.baud_rate,
            timing: ActuatorTiming::from(config),
            device: Arc::new(Mutex::new(())),
        }
    }

    /// Hardware serial this protocol targets.
    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Drive the flip mount to `desired` (true = engaged).
    ///
    /// Blocks the caller for the whole sequence, at least two settle delays.
    /// The handle is closed on every path once it was opened. Returns a
    /// confirmation message; the physical position is not verified.
    pub async fn toggle(&self, desired: bool) -> AppResult<String> {
        let device = tokio::time::timeout(
            self.timing.acquire_timeout,
            Arc::clone(&self.device).lock_owned(),
        )
        .await
        .map_err(|_| DaqError::ActuatorBusy(self.timing.acquire_timeout))?;

        let session = ActuatorSession::new(self.serial.clone(), FlipState::from(desired));
        info!(
            "Flip mount {}: requesting {}",
            session.target_serial, session.desired_state
        );

        self.run(&session, device).await?;

        info!("Flip mount {} {}", session.target_serial, session.desired_state);
        Ok(session.confirmation())
    }

    async fn run(&self, session: &ActuatorSession, device: OwnedMutexGuard<()>) -> AppResult<()> {
        let mut handle = self.open(session, device).await?;

        let outcome = self.drive(&mut handle, session).await;
        let released = handle.close(self.timing.io_timeout).await;

        match (outcome, released) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(close_err)) => Err(close_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                warn!("Flip mount close after failure also failed: {}", close_err);
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        session: &ActuatorSession,
        device: OwnedMutexGuard<()>,
    ) -> AppResult<SessionHandle> {
        let serial = &session.target_serial;
        let link = bounded(
            "open_by_serial",
            self.timing.io_timeout,
            self.driver.open_by_serial(serial),
        )
        .await?
        .map_err(|e| DaqError::HandleOpenFailed {
            serial: serial.clone(),
            reason: format!("{e:#}"),
        })?;
        debug!("Flip mount {} handle open", serial);
        Ok(SessionHandle {
            link: Some(link),
            device: Some(device),
        })
    }

    async fn drive(&self, handle: &mut SessionHandle, session: &ActuatorSession) -> AppResult<()> {
        let io = self.timing.io_timeout;

        setup_step("set_baud_rate", io, handle.link()?.set_baud_rate(self.baud_rate)).await?;
        setup_step(
            "set_data_characteristics",
            io,
            handle
                .link()?
                .set_data_characteristics(DataCharacteristics::EIGHT_N_ONE),
        )
        .await?;

        sleep(self.timing.settle).await;
        setup_step("purge", io, handle.link()?.purge()).await?;
        sleep(self.timing.settle).await;

        setup_step("reset_device", io, handle.link()?.reset_device()).await?;
        setup_step(
            "set_flow_control_rts_cts",
            io,
            handle.link()?.set_flow_control_rts_cts(),
        )
        .await?;
        setup_step("set_rts", io, handle.link()?.set_rts()).await?;
        debug!("Flip mount link configured");

        let frame = session.desired_state.frame();
        bounded("write", io, handle.link()?.write(frame))
            .await?
            .map_err(|e| DaqError::ProtocolWriteFailed(format!("{e:#}")))?;
        debug!("Flip mount frame sent: {:02X?}", frame);
        Ok(())
    }
}

async fn setup_step<F>(step: &'static str, limit: Duration, call: F) -> AppResult<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    bounded(step, limit, call)
        .await?
        .map_err(|e| DaqError::LinkConfiguration {
            step,
            reason: format!("{e:#}"),
        })
}

/// Open actuator handle owned by one session, together with the device lock.
///
/// The lock is released only once the handle is closed. `close` does that
/// explicitly. If the close call times out, or the session future is dropped
/// before `close` (caller cancelled), the handle and the lock move to a
/// background task that finishes the close first.
struct SessionHandle {
    link: Option<Box<dyn ActuatorLink>>,
    device: Option<OwnedMutexGuard<()>>,
}

impl SessionHandle {
    fn link(&mut self) -> AppResult<&mut (dyn ActuatorLink + 'static)> {
        self.link
            .as_deref_mut()
            .ok_or_else(|| DaqError::LinkConfiguration {
                step: "handle",
                reason: "handle already released".to_string(),
            })
    }

    async fn close(&mut self, limit: Duration) -> AppResult<()> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };
        match bounded("close", limit, link.close()).await {
            Ok(closed) => {
                self.device.take();
                debug!("Flip mount handle closed");
                closed.map_err(|e| DaqError::LinkConfiguration {
                    step: "close",
                    reason: format!("{e:#}"),
                })
            }
            Err(timeout) => {
                warn!("Flip mount close timed out; device stays locked until it completes");
                release_in_background(link, self.device.take());
                Err(timeout)
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            warn!("Flip mount session dropped with handle open; closing in background");
            release_in_background(link, self.device.take());
        }
    }
}

/// Close `link` on a background task, then release the device lock.
///
/// A close that was interrupted may already have released the handle; the
/// retry then fails and is only logged.
fn release_in_background(mut link: Box<dyn ActuatorLink>, device: Option<OwnedMutexGuard<()>>) {
    if let Ok(runtime) = tokio::runtime::Handle::try_current() {
        runtime.spawn(async move {
            if let Err(e) = link.close().await {
                debug!("Background flip mount close: {:#}", e);
            }
            drop(device);
        });
    }
}
