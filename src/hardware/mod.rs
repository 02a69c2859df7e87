//! Hardware layer: capability traits, device drivers and simulated devices.
//!
//! - [`capabilities`] - `StageBus`/`StageLink` and `ActuatorDriver`/`ActuatorLink`
//! - [`esp300`] - Newport ESP300 over RS-232 (`instrument_newport`)
//! - [`esp300_visa`] - Newport ESP300 over GPIB/VISA (`instrument_newport` + `instrument_visa`)
//! - [`mff101`] - Thorlabs MFF101 flip mount over FTDI D2XX (`instrument_thorlabs`)
//! - [`mock`] - simulated stage and recording actuator

pub mod capabilities;
#[cfg(feature = "instrument_newport")]
pub mod esp300;
#[cfg(all(feature = "instrument_newport", feature = "instrument_visa"))]
pub mod esp300_visa;
#[cfg(feature = "instrument_thorlabs")]
pub mod mff101;
pub mod mock;

pub use capabilities::{
    ActuatorDriver, ActuatorLink, DataCharacteristics, Parity, StageBus, StageLink,
};

use crate::error::DaqError;
use std::future::Future;
use std::time::Duration;

/// How a stage endpoint is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageTransport {
    /// Serial device path (`/dev/ttyUSB0`, `COM3`)
    Serial,
    /// VISA resource string (`GPIB0::3::INSTR`)
    Visa,
}

impl StageTransport {
    /// VISA resource strings end in `::INSTR`; anything else is a serial device.
    pub fn for_endpoint(endpoint: &str) -> Self {
        if endpoint.trim().to_ascii_uppercase().ends_with("::INSTR") {
            Self::Visa
        } else {
            Self::Serial
        }
    }
}

/// Run one hardware call with an upper time bound.
///
/// The outer `Result` carries the timeout, the inner one the driver's own fault.
pub async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    call: F,
) -> Result<anyhow::Result<T>, DaqError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| DaqError::HardwareTimeout {
            operation,
            timeout: limit,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_follows_endpoint_form() {
        assert_eq!(StageTransport::for_endpoint("GPIB0::3::INSTR"), StageTransport::Visa);
        assert_eq!(StageTransport::for_endpoint("gpib1::12::instr"), StageTransport::Visa);
        assert_eq!(
            StageTransport::for_endpoint("TCPIP0::192.168.1.20::inst0::INSTR"),
            StageTransport::Visa
        );
        assert_eq!(StageTransport::for_endpoint("/dev/ttyUSB0"), StageTransport::Serial);
        assert_eq!(StageTransport::for_endpoint("COM3"), StageTransport::Serial);
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let ok = bounded("noop", Duration::from_millis(100), async { Ok(7) }).await;
        assert_eq!(ok.unwrap().unwrap(), 7);

        let fault: Result<anyhow::Result<()>, DaqError> =
            bounded("noop", Duration::from_millis(100), async {
                Err(anyhow::anyhow!("bus fault"))
            })
            .await;
        assert!(fault.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result = bounded("slow_call", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(DaqError::HardwareTimeout {
                operation: "slow_call",
                ..
            })
        ));
    }
}
