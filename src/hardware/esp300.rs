//! Newport ESP300 motion controller over RS-232.
//!
//! Serial I/O runs on Tokio's blocking pool, as the `serialport` crate is
//! synchronous. Each query clears stale input, writes the command plus the
//! write terminator, then reads until the read terminator arrives.
//!
//! Protocol:
//! - `VE?` - controller firmware/version string, used as the identity probe
//! - `<n>TP` - actual position of axis `n` (1-3)

use crate::hardware::{StageBus, StageLink};
use crate::stage::{Axis, StageConnection};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Identity query.
pub const IDENTITY_COMMAND: &str = "VE?";

/// Position query for one axis.
pub fn position_command(axis: Axis) -> String {
    format!("{}TP", axis.controller_number())
}

/// Parse a `TP` response into millimetres.
pub fn parse_position(response: &str) -> Result<f64> {
    let value = response.trim();
    value
        .parse::<f64>()
        .with_context(|| format!("Invalid position response: {:?}", value))
}

/// Identity from a `VE?` response; blank means no usable answer.
pub fn identity_from_response(response: &str) -> Option<String> {
    let identity = response.trim();
    if identity.is_empty() {
        None
    } else {
        Some(identity.to_string())
    }
}

fn data_bits(bits: u8) -> Result<DataBits> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        other => bail!("Unsupported data bits: {}", other),
    }
}

fn stop_bits(bits: u8) -> Result<StopBits> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        other => bail!("Unsupported stop bits: {}", other),
    }
}

/// Opens ESP300 links on a serial device path.
#[derive(Debug, Clone)]
pub struct Esp300Bus {
    timeout: Duration,
}

impl Esp300Bus {
    /// Create a bus whose reads give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl StageBus for Esp300Bus {
    async fn open(&self, connection: &StageConnection) -> Result<Box<dyn StageLink>> {
        let endpoint = connection.endpoint.clone();
        let baud_rate = connection.baud_rate;
        let data = data_bits(connection.data_bits)?;
        let stop = stop_bits(connection.stop_bits)?;
        let timeout = self.timeout;

        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&endpoint, baud_rate)
                .data_bits(data)
                .stop_bits(stop)
                .parity(serialport::Parity::None)
                .flow_control(FlowControl::Hardware)
                .timeout(timeout)
                .open()
                .with_context(|| format!("Failed to open serial port {}", endpoint))
        })
        .await??;

        debug!(
            "Opened ESP300 link on {} at {} baud",
            connection.endpoint, baud_rate
        );

        Ok(Box::new(Esp300Link {
            port: Arc::new(Mutex::new(port)),
            write_terminator: connection.write_terminator.clone(),
            read_terminator: connection.read_terminator.clone(),
        }))
    }
}

/// An open ESP300 serial link.
pub struct Esp300Link {
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    write_terminator: String,
    read_terminator: String,
}

impl Esp300Link {
    async fn query(&self, command: &str) -> Result<String> {
        let frame = format!("{}{}", command, self.write_terminator);
        let terminator = self.read_terminator.clone();
        let port = Arc::clone(&self.port);

        let response = tokio::task::spawn_blocking(move || {
            let mut port = port.blocking_lock();
            port.clear(ClearBuffer::Input)?;
            port.write_all(frame.as_bytes())?;
            port.flush()?;
            read_until(&mut **port, &terminator)
        })
        .await??;

        debug!("ESP300 {} -> {:?}", command, response);
        Ok(response)
    }
}

fn read_until(port: &mut dyn SerialPort, terminator: &str) -> Result<String> {
    let mut response = String::new();
    let mut buf = [0u8; 256];

    loop {
        match port.read(&mut buf) {
            Ok(n) if n > 0 => {
                response.push_str(&String::from_utf8_lossy(&buf[..n]));
                if terminator.is_empty() || response.ends_with(terminator) {
                    break;
                }
            }
            Ok(_) => break,
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                return Err(anyhow!("Timed out waiting for response ({:?} so far)", response));
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(response.trim().to_string())
}

#[async_trait]
impl StageLink for Esp300Link {
    async fn read_identity(&mut self) -> Result<Option<String>> {
        let response = self.query(IDENTITY_COMMAND).await?;
        Ok(identity_from_response(&response))
    }

    async fn read_axis_position(&mut self, axis: Axis) -> Result<f64> {
        let response = self.query(&position_command(axis)).await?;
        parse_position(&response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_commands_use_controller_numbers() {
        assert_eq!(position_command(Axis::X), "1TP");
        assert_eq!(position_command(Axis::Y), "2TP");
        assert_eq!(position_command(Axis::Z), "3TP");
    }

    #[test]
    fn test_parse_position() {
        assert_eq!(parse_position("12.3456\r\n").unwrap(), 12.3456);
        assert_eq!(parse_position(" -0.5 ").unwrap(), -0.5);
        assert!(parse_position("").is_err());
        assert!(parse_position("ERR").is_err());
    }

    #[test]
    fn test_identity_from_response() {
        assert_eq!(
            identity_from_response("ESP300 Version 3.08 09/09/02\r\n").as_deref(),
            Some("ESP300 Version 3.08 09/09/02")
        );
        assert_eq!(identity_from_response("  \r\n"), None);
    }

    #[test]
    fn test_framing_conversion() {
        assert_eq!(data_bits(8).unwrap(), DataBits::Eight);
        assert_eq!(stop_bits(1).unwrap(), StopBits::One);
        assert!(data_bits(9).is_err());
        assert!(stop_bits(3).is_err());
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let bus = Esp300Bus::new(Duration::from_millis(100));
        let mut connection = StageConnection::from_config(&crate::config::StageConfig::default());
        connection.endpoint = "/dev/autopattern-no-such-port".to_string();
        assert!(bus.open(&connection).await.is_err());
    }
}
