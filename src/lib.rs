pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;

pub use adapters::SystemConnector;
pub use config::DeviceConfig;
pub use core::session::{Session, SessionOptions};
pub use domain::model::{
    ClassLabel, MeasurementReport, NetworkConfig, SerialConfig, TelemetryResult, TransportConfig,
};
pub use utils::error::{DeviceError, Result};
