//! Workstation settings loaded with Figment.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults (every field has one)
//! 2. TOML file (default: `config/workstation.toml`)
//! 3. Environment variables prefixed with `AUTOPATTERN_`, nested keys joined by `__`
//!
//! ```text
//! AUTOPATTERN_APPLICATION__LOG_LEVEL=debug
//! AUTOPATTERN_STAGE__ENDPOINT=/dev/ttyUSB1
//! AUTOPATTERN_POLLING__RECONNECT=reprobe
//! ```

use crate::error::{AppResult, DaqError};
use crate::scheduler::{PollingPolicy, ReconnectPolicy};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/workstation.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "AUTOPATTERN_";

/// Fixed hardware serial of the MFF101 flip mount.
pub const ACTUATOR_SERIAL: &str = "37000805";

/// The only baud rate the actuator firmware accepts.
pub const ACTUATOR_BAUD_RATE: u32 = 115_200;

/// Shortest settle delay the actuator firmware tolerates.
pub const MIN_SETTLE_MS: u64 = 50;

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Stage controller link
    pub stage: StageConfig,
    /// Probe and stream timer intervals
    pub polling: PollingConfig,
    /// Flip mount actuator
    pub actuator: ActuatorConfig,
}

/// Whether to talk to real devices or simulated ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// Real ESP300 and MFF101 drivers
    #[default]
    Hardware,
    /// In-process simulated devices
    Mock,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Device backend
    pub mode: HardwareMode,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "AutoPatterning Setup".to_string(),
            log_level: "info".to_string(),
            mode: HardwareMode::Hardware,
        }
    }
}

/// ESP300 link parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Controller address: a VISA resource ("GPIB0::3::INSTR") or a serial
    /// device ("/dev/ttyUSB0", "COM3")
    pub endpoint: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Terminator expected at the end of each response
    pub read_terminator: String,
    /// Terminator appended to each command
    pub write_terminator: String,
    /// Bound on each bus call in milliseconds
    pub io_timeout_ms: u64,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            endpoint: "GPIB0::3::INSTR".to_string(),
            baud_rate: 19_200,
            data_bits: 8,
            stop_bits: 1,
            read_terminator: "\r\n".to_string(),
            write_terminator: "\r".to_string(),
            io_timeout_ms: 2_000,
        }
    }
}

impl StageConfig {
    /// Bound on each bus call.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Timer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Probe interval while no connection has been confirmed
    pub probe_fast_ms: u64,
    /// Probe interval once the controller answered
    pub probe_keepalive_ms: u64,
    /// Telemetry stream interval
    pub stream_ms: u64,
    /// What a failed keepalive probe does
    pub reconnect: ReconnectPolicy,
}

impl Default for PollingConfig {
    fn default() -> Self {
        let policy = PollingPolicy::default();
        Self {
            probe_fast_ms: policy.probe_fast.as_millis() as u64,
            probe_keepalive_ms: policy.probe_keepalive.as_millis() as u64,
            stream_ms: policy.stream.as_millis() as u64,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl PollingConfig {
    /// Timer intervals as a policy.
    pub fn policy(&self) -> PollingPolicy {
        PollingPolicy {
            probe_fast: Duration::from_millis(self.probe_fast_ms),
            probe_keepalive: Duration::from_millis(self.probe_keepalive_ms),
            stream: Duration::from_millis(self.stream_ms),
        }
    }
}

/// MFF101 flip mount configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    /// FTDI serial number of the device
    pub serial: String,
    /// Link baud rate
    pub baud_rate: u32,
    /// Settle delay used twice during link setup
    pub settle_ms: u64,
    /// Bound on each USB call in milliseconds
    pub io_timeout_ms: u64,
    /// How long a toggle waits for a concurrent toggle to release the device
    pub acquire_timeout_ms: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            serial: ACTUATOR_SERIAL.to_string(),
            baud_rate: ACTUATOR_BAUD_RATE,
            settle_ms: 50,
            io_timeout_ms: 1_000,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] plus environment overrides.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific TOML file plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check semantic constraints that parsing cannot express.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.stage.endpoint.trim().is_empty() {
            return Err(DaqError::Configuration(
                "stage.endpoint must not be empty".to_string(),
            ));
        }
        if !(5..=8).contains(&self.stage.data_bits) {
            return Err(DaqError::Configuration(format!(
                "Invalid stage.data_bits {}. Must be 5-8",
                self.stage.data_bits
            )));
        }
        if !(1..=2).contains(&self.stage.stop_bits) {
            return Err(DaqError::Configuration(format!(
                "Invalid stage.stop_bits {}. Must be 1 or 2",
                self.stage.stop_bits
            )));
        }
        if self.stage.io_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "stage.io_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.stage.read_terminator.is_empty() {
            return Err(DaqError::Configuration(
                "stage.read_terminator must not be empty".to_string(),
            ));
        }

        let polling = &self.polling;
        for (name, value) in [
            ("probe_fast_ms", polling.probe_fast_ms),
            ("probe_keepalive_ms", polling.probe_keepalive_ms),
            ("stream_ms", polling.stream_ms),
        ] {
            if value == 0 {
                return Err(DaqError::Configuration(format!(
                    "polling.{name} must be greater than zero"
                )));
            }
        }
        if polling.probe_keepalive_ms < polling.probe_fast_ms {
            return Err(DaqError::Configuration(format!(
                "polling.probe_keepalive_ms ({}) is shorter than polling.probe_fast_ms ({})",
                polling.probe_keepalive_ms, polling.probe_fast_ms
            )));
        }

        if self.actuator.serial.trim().is_empty() {
            return Err(DaqError::Configuration(
                "actuator.serial must not be empty".to_string(),
            ));
        }
        if self.actuator.baud_rate != ACTUATOR_BAUD_RATE {
            return Err(DaqError::Configuration(format!(
                "actuator.baud_rate must be {ACTUATOR_BAUD_RATE}, got {}",
                self.actuator.baud_rate
            )));
        }
        if self.actuator.settle_ms < MIN_SETTLE_MS {
            return Err(DaqError::Configuration(format!(
                "actuator.settle_ms must be at least {MIN_SETTLE_MS}, got {}",
                self.actuator.settle_ms
            )));
        }
        if self.actuator.io_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "actuator.io_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_match_hardware_constants() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.polling.probe_fast_ms, 1_000);
        assert_eq!(settings.polling.probe_keepalive_ms, 3_600_000);
        assert_eq!(settings.polling.stream_ms, 500);
        assert_eq!(settings.polling.reconnect, ReconnectPolicy::Latch);
        assert_eq!(settings.actuator.serial, "37000805");
        assert_eq!(settings.actuator.settle_ms, 50);
        assert_eq!(settings.stage.baud_rate, 19_200);
        assert_eq!(settings.stage.read_terminator, "\r\n");
        assert_eq!(settings.stage.write_terminator, "\r");
    }

    #[test]
    #[serial]
    fn test_load_partial_file_keeps_defaults() {
        let file = write_config(
            r#"
[stage]
endpoint = "/dev/ttyUSB1"

[polling]
reconnect = "reprobe"
"#,
        );
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.stage.endpoint, "/dev/ttyUSB1");
        assert_eq!(settings.stage.baud_rate, 19_200);
        assert_eq!(settings.polling.reconnect, ReconnectPolicy::Reprobe);
        assert_eq!(settings.polling.stream_ms, 500);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[application]\nlog_level = \"warn\"\n");
        std::env::set_var("AUTOPATTERN_APPLICATION__LOG_LEVEL", "debug");
        std::env::set_var("AUTOPATTERN_APPLICATION__MODE", "mock");
        let result = Settings::load_from(file.path());
        std::env::remove_var("AUTOPATTERN_APPLICATION__LOG_LEVEL");
        std::env::remove_var("AUTOPATTERN_APPLICATION__MODE");

        let settings = result.unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.application.mode, HardwareMode::Mock);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_keepalive_shorter_than_fast_probe_is_rejected() {
        let mut settings = Settings::default();
        settings.polling.probe_keepalive_ms = 10;
        assert!(matches!(
            settings.validate(),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_stream_interval_is_rejected() {
        let mut settings = Settings::default();
        settings.polling.stream_ms = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("stream_ms"));
    }

    #[test]
    fn test_actuator_baud_is_fixed() {
        let mut settings = Settings::default();
        settings.actuator.baud_rate = 9_600;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settle_delay_has_a_floor() {
        let mut settings = Settings::default();
        settings.actuator.settle_ms = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("settle_ms"));

        settings.actuator.settle_ms = MIN_SETTLE_MS - 1;
        assert!(settings.validate().is_err());

        settings.actuator.settle_ms = 80;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_zero_stage_timeout_is_rejected() {
        let mut settings = Settings::default();
        settings.stage.io_timeout_ms = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("stage.io_timeout_ms"));
    }

    #[test]
    fn test_stage_framing_bounds() {
        let mut settings = Settings::default();
        settings.stage.data_bits = 9;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.stage.stop_bits = 0;
        assert!(settings.validate().is_err());
    }
}
