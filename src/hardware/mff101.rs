//! Thorlabs MFF101 motorized flip mount over the FTDI D2XX driver.
//!
//! The mount enumerates as an FTDI device addressed by its hardware serial.
//! D2XX calls are blocking, so each one runs on Tokio's blocking pool with
//! the handle behind a mutex.

use crate::hardware::{ActuatorDriver, ActuatorLink, DataCharacteristics, Parity};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use libftd2xx::{BitsPerWord, Ftdi, FtdiCommon, StopBits};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Opens MFF101 handles by serial number.
#[derive(Debug, Clone)]
pub struct Mff101Driver {
    io_timeout: Duration,
}

impl Mff101Driver {
    /// Create a driver; `io_timeout` bounds D2XX reads and writes.
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }
}

#[async_trait]
impl ActuatorDriver for Mff101Driver {
    async fn open_by_serial(&self, serial: &str) -> Result<Box<dyn ActuatorLink>> {
        let serial = serial.to_string();
        let timeout = self.io_timeout;

        let device = tokio::task::spawn_blocking(move || -> Result<Ftdi> {
            let mut device = Ftdi::with_serial_number(&serial)
                .map_err(|e| anyhow!("FT_OpenEx({}) failed: {:?}", serial, e))?;
            device
                .set_timeouts(timeout, timeout)
                .map_err(|e| anyhow!("FT_SetTimeouts failed: {:?}", e))?;
            if let Ok(info) = device.device_info() {
                debug!("Opened MFF101 {} ({:?})", serial, info);
            }
            Ok(device)
        })
        .await??;

        Ok(Box::new(Mff101Link {
            device: Arc::new(Mutex::new(Some(device))),
        }))
    }
}

/// An open MFF101 handle.
pub struct Mff101Link {
    device: Arc<Mutex<Option<Ftdi>>>,
}

impl Mff101Link {
    async fn call<T, F>(&self, name: &'static str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Ftdi) -> Result<T> + Send + 'static,
    {
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || {
            let mut guard = device.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.as_mut() {
                Some(ftdi) => op(ftdi),
                None => bail!("{} on a closed handle", name),
            }
        })
        .await?
    }
}

fn ft_fault(call: &'static str, status: impl std::fmt::Debug) -> anyhow::Error {
    anyhow!("{} failed: {:?}", call, status)
}

fn bits_per_word(bits: u8) -> Result<BitsPerWord> {
    match bits {
        7 => Ok(BitsPerWord::Bits7),
        8 => Ok(BitsPerWord::Bits8),
        other => bail!("Unsupported data bits: {}", other),
    }
}

fn ft_stop_bits(bits: u8) -> Result<StopBits> {
    match bits {
        1 => Ok(StopBits::Bits1),
        2 => Ok(StopBits::Bits2),
        other => bail!("Unsupported stop bits: {}", other),
    }
}

fn ft_parity(parity: Parity) -> libftd2xx::Parity {
    match parity {
        Parity::None => libftd2xx::Parity::No,
        Parity::Even => libftd2xx::Parity::Even,
        Parity::Odd => libftd2xx::Parity::Odd,
    }
}

#[async_trait]
impl ActuatorLink for Mff101Link {
    async fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.call("set_baud_rate", move |ftdi| {
            ftdi.set_baud_rate(baud_rate)
                .map_err(|e| ft_fault("FT_SetBaudRate", e))
        })
        .await
    }

    async fn set_data_characteristics(&mut self, framing: DataCharacteristics) -> Result<()> {
        let bits = bits_per_word(framing.data_bits)?;
        let stop = ft_stop_bits(framing.stop_bits)?;
        let parity = ft_parity(framing.parity);
        self.call("set_data_characteristics", move |ftdi| {
            ftdi.set_data_characteristics(bits, stop, parity)
                .map_err(|e| ft_fault("FT_SetDataCharacteristics", e))
        })
        .await
    }

    async fn purge(&mut self) -> Result<()> {
        self.call("purge", |ftdi| {
            ftdi.purge_all().map_err(|e| ft_fault("FT_Purge", e))
        })
        .await
    }

    async fn reset_device(&mut self) -> Result<()> {
        self.call("reset_device", |ftdi| {
            ftdi.reset().map_err(|e| ft_fault("FT_ResetDevice", e))
        })
        .await
    }

    async fn set_flow_control_rts_cts(&mut self) -> Result<()> {
        self.call("set_flow_control", |ftdi| {
            ftdi.set_flow_control_rts_cts()
                .map_err(|e| ft_fault("FT_SetFlowControl", e))
        })
        .await
    }

    async fn set_rts(&mut self) -> Result<()> {
        self.call("set_rts", |ftdi| ftdi.set_rts().map_err(|e| ft_fault("FT_SetRts", e)))
            .await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let frame = bytes.to_vec();
        self.call("write", move |ftdi| {
            ftdi.write_all(&frame).map_err(|e| ft_fault("FT_Write", e))
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        let device = Arc::clone(&self.device);
        tokio::task::spawn_blocking(move || {
            let mut guard = device.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.take() {
                // Dropping the handle issues FT_Close
                Some(ftdi) => {
                    drop(ftdi);
                    Ok(())
                }
                None => bail!("Handle already closed"),
            }
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_conversion() {
        assert!(matches!(bits_per_word(8).unwrap(), BitsPerWord::Bits8));
        assert!(matches!(ft_stop_bits(1).unwrap(), StopBits::Bits1));
        assert!(matches!(ft_parity(Parity::None), libftd2xx::Parity::No));
        assert!(bits_per_word(5).is_err());
    }
}
