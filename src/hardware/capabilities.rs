//! Hardware capability traits.
//!
//! The core only talks to devices through these traits. Real drivers live in
//! [`crate::hardware::esp300`] and [`crate::hardware::mff101`]; simulated ones
//! in [`crate::hardware::mock`].
//!
//! Drivers report faults as `anyhow::Error`. Callers in the core decide
//! whether a fault is absorbed (stage path) or surfaced (actuator path).

use crate::stage::{Axis, StageConnection};
use anyhow::Result;
use async_trait::async_trait;

/// Opens links to a polled multi-axis stage controller.
#[async_trait]
pub trait StageBus: Send + Sync {
    /// Open a link using the connection's endpoint, framing and terminators.
    async fn open(&self, connection: &StageConnection) -> Result<Box<dyn StageLink>>;
}

/// An open link to the stage controller.
#[async_trait]
pub trait StageLink: Send + Sync {
    /// Read the controller identity string.
    ///
    /// `Ok(None)` means the controller answered with nothing usable.
    async fn read_identity(&mut self) -> Result<Option<String>>;

    /// Read the current position of one axis in controller units (mm).
    async fn read_axis_position(&mut self, axis: Axis) -> Result<f64>;
}

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Character framing of a serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataCharacteristics {
    /// Data bits per character
    pub data_bits: u8,
    /// Stop bits per character
    pub stop_bits: u8,
    /// Parity mode
    pub parity: Parity,
}

impl DataCharacteristics {
    /// 8 data bits, no parity, 1 stop bit.
    pub const EIGHT_N_ONE: Self = Self {
        data_bits: 8,
        stop_bits: 1,
        parity: Parity::None,
    };
}

/// Opens handles to a one-shot USB actuator by hardware serial.
#[async_trait]
pub trait ActuatorDriver: Send + Sync {
    /// Acquire the device handle. Only one handle may be open at a time.
    async fn open_by_serial(&self, serial: &str) -> Result<Box<dyn ActuatorLink>>;
}

/// An open actuator handle exposing the vendor D2XX-style primitives.
#[async_trait]
pub trait ActuatorLink: Send {
    /// Set the link baud rate.
    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Set data bits, stop bits and parity.
    async fn set_data_characteristics(&mut self, framing: DataCharacteristics) -> Result<()>;

    /// Discard buffered RX and TX data.
    async fn purge(&mut self) -> Result<()>;

    /// Reset the device.
    async fn reset_device(&mut self) -> Result<()>;

    /// Enable RTS/CTS hardware flow control, no XON/XOFF characters.
    async fn set_flow_control_rts_cts(&mut self) -> Result<()>;

    /// Assert RTS.
    async fn set_rts(&mut self) -> Result<()>;

    /// Write all bytes.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Release the handle. Called exactly once per opened handle.
    async fn close(&mut self) -> Result<()>;
}
