//! Newport ESP300 motion controller over GPIB through a VISA library.
//!
//! Same command set as the RS-232 driver in [`super::esp300`]; only the
//! transport differs. VISA calls are blocking and run on Tokio's blocking
//! pool. The resource manager session is kept alongside the instrument,
//! since closing it closes every session opened from it.

use crate::hardware::esp300::{
    identity_from_response, parse_position, position_command, IDENTITY_COMMAND,
};
use crate::hardware::{StageBus, StageLink};
use crate::stage::{Axis, StageConnection};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use visa_rs::prelude::*;

/// Opens ESP300 links on a VISA resource (e.g., "GPIB0::3::INSTR").
#[derive(Debug, Clone)]
pub struct VisaEsp300Bus {
    open_timeout: Duration,
}

impl VisaEsp300Bus {
    /// Create a bus; `open_timeout` bounds opening the resource.
    pub fn new(open_timeout: Duration) -> Self {
        Self { open_timeout }
    }
}

// Field order matters: the instrument closes before its resource manager.
struct VisaSession {
    instrument: Instrument,
    _rm: DefaultRM,
}

#[async_trait]
impl StageBus for VisaEsp300Bus {
    async fn open(&self, connection: &StageConnection) -> Result<Box<dyn StageLink>> {
        let endpoint = connection.endpoint.clone();
        let open_timeout = self.open_timeout;

        let session = tokio::task::spawn_blocking(move || -> Result<VisaSession> {
            let rm = DefaultRM::new()
                .map_err(|e| anyhow!("Failed to create VISA resource manager: {:?}", e))?;
            let resource = CString::new(endpoint.as_str())
                .with_context(|| format!("Invalid VISA resource {:?}", endpoint))?;
            let instrument = rm
                .open(&resource.into(), AccessMode::NO_LOCK, open_timeout)
                .map_err(|e| anyhow!("Failed to open VISA resource {}: {:?}", endpoint, e))?;
            Ok(VisaSession {
                instrument,
                _rm: rm,
            })
        })
        .await??;

        debug!("Opened ESP300 VISA session on {}", connection.endpoint);

        Ok(Box::new(VisaEsp300Link {
            session: Arc::new(Mutex::new(session)),
            write_terminator: connection.write_terminator.clone(),
            read_terminator: connection.read_terminator.clone(),
        }))
    }
}

/// An open ESP300 VISA session.
pub struct VisaEsp300Link {
    session: Arc<Mutex<VisaSession>>,
    write_terminator: String,
    read_terminator: String,
}

impl VisaEsp300Link {
    async fn query(&self, command: &str) -> Result<String> {
        let frame = format!("{}{}", command, self.write_terminator);
        let terminator = self.read_terminator.clone();
        let session = Arc::clone(&self.session);
        let command_for_log = command.to_string();

        let response = tokio::task::spawn_blocking(move || {
            let mut session = session.blocking_lock();
            session
                .instrument
                .write_all(frame.as_bytes())
                .with_context(|| format!("VISA write failed for {}", command_for_log))?;
            read_message(&mut session.instrument, &terminator)
        })
        .await??;

        debug!("ESP300 (VISA) {} -> {:?}", command, response);
        Ok(response)
    }
}

/// Read one response. GPIB reads end on EOI, which shows up as a short read.
fn read_message(source: &mut impl Read, terminator: &str) -> Result<String> {
    let mut response = String::new();
    let mut buf = [0u8; 256];

    loop {
        let n = source.read(&mut buf).context("VISA read failed")?;
        response.push_str(&String::from_utf8_lossy(&buf[..n]));
        if n < buf.len() || terminator.is_empty() || response.ends_with(terminator) {
            break;
        }
    }

    Ok(response.trim().to_string())
}

#[async_trait]
impl StageLink for VisaEsp300Link {
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
    use std::io::Cursor;

    #[test]
    fn test_read_message_stops_at_terminator() {
        let mut source = Cursor::new(b"ESP300 Version 3.08\r\n".to_vec());
        assert_eq!(
            read_message(&mut source, "\r\n").unwrap(),
            "ESP300 Version 3.08"
        );
    }

    #[test]
    fn test_read_message_spans_full_buffers() {
        let mut long = vec![b'7'; 300];
        long.extend_from_slice(b"\r\n");
        let mut source = Cursor::new(long);
        assert_eq!(read_message(&mut source, "\r\n").unwrap().len(), 300);
    }

    #[test]
    fn test_read_message_without_terminator_ends_on_short_read() {
        let mut source = Cursor::new(b"1.25".to_vec());
        assert_eq!(read_message(&mut source, "\r\n").unwrap(), "1.25");
    }
}
