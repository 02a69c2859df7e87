//! Custom error types for the workstation core.
//!
//! `DaqError` is the single error type surfaced by the core. Hardware drivers
//! report faults through `anyhow::Error`; the stage manager and the actuator
//! protocol translate those into the kinds below.
//!
//! ## Propagation
//!
//! - **Stage path**: `ConnectionUnavailable` and `HardwareTimeout` raised while
//!   probing or reading positions never leave the tick that observed them. The
//!   manager logs them and degrades to a negative probe or a zeroed sample.
//! - **Actuator path**: `HandleOpenFailed`, `LinkConfiguration`,
//!   `ProtocolWriteFailed`, `HardwareTimeout` and `ActuatorBusy` always reach
//!   the caller of `toggle_actuator`.
//! - **Startup**: `Config` and `Configuration` come out of settings loading and
//!   validation; `FeatureNotEnabled` when a hardware driver was compiled out.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors raised by the device control and telemetry core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The stage controller could not be reached.
    #[error("Stage connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// The actuator USB handle could not be acquired.
    #[error("Failed to open actuator '{serial}': {reason}")]
    HandleOpenFailed {
        /// Hardware serial identifier that was requested
        serial: String,
        /// Driver-reported cause
        reason: String,
    },

    /// A link setup step (baud, framing, purge, reset, flow control, RTS) failed.
    #[error("Actuator link configuration failed at '{step}': {reason}")]
    LinkConfiguration {
        /// Name of the failing step
        step: &'static str,
        /// Driver-reported cause
        reason: String,
    },

    /// The opcode frame was not fully written to the actuator.
    #[error("Actuator protocol write failed: {0}")]
    ProtocolWriteFailed(String),

    /// A hardware call did not complete within its bound.
    #[error("Hardware call '{operation}' timed out after {timeout:?}")]
    HardwareTimeout {
        /// Name of the hardware call
        operation: &'static str,
        /// Bound that was exceeded
        timeout: Duration,
    },

    /// Another toggle held the actuator for longer than the acquire timeout.
    #[error("Actuator busy: another toggle did not finish within {0:?}")]
    ActuatorBusy(Duration),

    /// Settings could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A driver required by the settings was not compiled in.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}
