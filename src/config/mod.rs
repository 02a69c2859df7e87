//! Configuration management using Figment.
//!
//! # Example
//!
//! ```no_run
//! use autopattern_daq::config::Settings;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load from the default location
//!     let settings = Settings::load()?;
//!
//!     // Or from a custom location
//!     let settings = Settings::load_from("custom/path.toml")?;
//!
//!     println!("Stage endpoint: {}", settings.stage.endpoint);
//!     println!("Stream interval: {} ms", settings.polling.stream_ms);
//!     Ok(())
//! }
//! ```

pub mod settings;

pub use settings::{
    ActuatorConfig, ApplicationConfig, HardwareMode, PollingConfig, Settings, StageConfig,
    ACTUATOR_BAUD_RATE, ACTUATOR_SERIAL, DEFAULT_CONFIG_PATH, ENV_PREFIX,
};
