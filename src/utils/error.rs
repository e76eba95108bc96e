use crate::domain::model::TelemetryResult;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No serial device found")]
    NoDeviceFound,

    #[error("Failed to connect to {target}: {source}")]
    ConnectFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("Failed to send payload: {source}")]
    SendFailed {
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to load image {path}: {source}")]
    ImageLoadFailed {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("A measurement is already in progress")]
    Busy,

    #[error("No definitive result from device within the response window")]
    Timeout { partial: TelemetryResult },

    #[error("Device link closed")]
    LinkClosed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },
}

/// Status category the boundary layer renders (one per error kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NoDevice,
    Connection,
    ConnectTimeout,
    Transmission,
    ImageInput,
    Busy,
    NoResponse,
    Configuration,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl DeviceError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DeviceError::NoDeviceFound => ErrorCategory::NoDevice,
            DeviceError::ConnectFailed { .. } | DeviceError::LinkClosed => {
                ErrorCategory::Connection
            }
            DeviceError::ConnectTimeout { .. } => ErrorCategory::ConnectTimeout,
            DeviceError::SendFailed { .. } => ErrorCategory::Transmission,
            DeviceError::ImageLoadFailed { .. } => ErrorCategory::ImageInput,
            DeviceError::Busy => ErrorCategory::Busy,
            DeviceError::Timeout { .. } => ErrorCategory::NoResponse,
            DeviceError::ConfigError { .. }
            | DeviceError::InvalidConfigValueError { .. } => ErrorCategory::Configuration,
            DeviceError::IoError(_) => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DeviceError::Busy => ErrorSeverity::Low,
            DeviceError::Timeout { .. } | DeviceError::ConnectTimeout { .. } => {
                ErrorSeverity::Medium
            }
            DeviceError::IoError(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::High,
        }
    }

    /// 是否為裝置無回應 (連線與傳送成功，但沒有結果)
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Timeout { .. })
    }

    /// Telemetry that arrived before the window expired, if any.
    pub fn partial_telemetry(&self) -> Option<&TelemetryResult> {
        match self {
            DeviceError::Timeout { partial } => Some(partial),
            _ => None,
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            DeviceError::NoDeviceFound => "ESP32 not found on any serial port".to_string(),
            DeviceError::ConnectFailed { target, .. } => format!("Could not connect to {}", target),
            DeviceError::ConnectTimeout { target, .. } => {
                format!("Connection to {} timed out", target)
            }
            DeviceError::SendFailed { .. } => "Failed to send image to device".to_string(),
            DeviceError::ImageLoadFailed { path, .. } => format!("Failed to load image: {}", path),
            DeviceError::Busy => "Still processing the previous image".to_string(),
            DeviceError::Timeout { .. } => "No response from ESP32".to_string(),
            DeviceError::LinkClosed => "Device link was closed".to_string(),
            DeviceError::IoError(e) => format!("System error: {}", e),
            DeviceError::ConfigError { message } => format!("Configuration problem: {}", message),
            DeviceError::InvalidConfigValueError { field, reason, .. } => {
                format!("Invalid setting '{}': {}", field, reason)
            }
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::NoDevice => "Plug in the board and check the USB cable, or pin a port with --port",
            ErrorCategory::Connection => "Check that the port is not used by another program, then reconnect",
            ErrorCategory::ConnectTimeout => "Verify the device IP address and that it is on the same network",
            ErrorCategory::Transmission => "Reconnect the device and try again",
            ErrorCategory::ImageInput => "Use a readable JPEG, PNG or BMP file",
            ErrorCategory::Busy => "Wait for the current measurement to finish",
            ErrorCategory::NoResponse => "Make sure the firmware is running and the image size matches",
            ErrorCategory::Configuration => "Fix the configuration file or command line flags",
            ErrorCategory::System => "Check file permissions and available resources",
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
