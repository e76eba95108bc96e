use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Side length of the square grid the firmware expects.
pub const DEFAULT_IMAGE_SIDE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassLabel {
    #[serde(rename = "TIGER")]
    Tiger,
    #[serde(rename = "NOT_TIGER")]
    NotTiger,
}

impl ClassLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassLabel::Tiger => "TIGER",
            ClassLabel::NotTiger => "NOT_TIGER",
        }
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassLabel {
    type Err = ();

    // exact token match, the device never sends lowercase
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TIGER" => Ok(ClassLabel::Tiger),
            "NOT_TIGER" => Ok(ClassLabel::NotTiger),
            _ => Err(()),
        }
    }
}

/// Row-major grid of signed 8-bit intensities, exactly `side * side` long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    side: u32,
    values: Vec<i8>,
}

impl ImagePayload {
    pub(crate) fn new(side: u32, values: Vec<i8>) -> Self {
        debug_assert_eq!(values.len(), (side * side) as usize);
        Self { side, values }
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn values(&self) -> &[i8] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Wire form: raw two's-complement bytes, no header or framing.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().map(|v| *v as u8).collect()
    }
}

/// Telemetry reported by the device after one inference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryResult {
    pub rx_micros: Option<u64>,
    pub infer_micros: Option<u64>,
    pub total_micros: Option<u64>,
    pub predicted_class: Option<ClassLabel>,
    pub confidence_percent: Option<u8>,
}

impl TelemetryResult {
    pub fn is_complete(&self) -> bool {
        self.predicted_class.is_some()
    }

    pub fn has_any_timing(&self) -> bool {
        self.rx_micros.is_some() || self.infer_micros.is_some() || self.total_micros.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccuracySnapshot {
    /// Percentage, `None` until something has been recorded.
    pub ratio: Option<f64>,
    pub total: u64,
    pub correct: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Network,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => f.write_str("UART"),
            TransportKind::Network => f.write_str("Wi-Fi"),
        }
    }
}

/// Orchestrator state, published to the boundary layer on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Idle,
    Quantizing,
    Transmitting,
    AwaitingResponse,
    Complete,
    TimedOut,
    Failed,
}

impl SessionPhase {
    pub fn status_text(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "Ready",
            SessionPhase::Quantizing => "Processing...",
            SessionPhase::Transmitting => "Sending...",
            SessionPhase::AwaitingResponse => "Waiting for response...",
            SessionPhase::Complete => "Complete",
            SessionPhase::TimedOut => "No response from ESP32",
            SessionPhase::Failed => "Failed",
        }
    }
}

/// Result of one successful send/measure cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurementReport {
    pub image_name: String,
    pub transport: TransportKind,
    pub telemetry: TelemetryResult,
    /// Host-side connect + send time, network variant only.
    pub tx_millis: Option<f64>,
    pub ground_truth: Option<ClassLabel>,
    pub correct: Option<bool>,
    pub accuracy: AccuracySnapshot,
    pub completed_at: DateTime<Utc>,
}

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_TCP_PORT: u16 = 3333;

/// Serial link settings. `port: None` probes every port the OS reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Cap on each single read or write; the response window still bounds
    /// the whole wait.
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// Where the device writes its telemetry when the image went over Wi-Fi.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyChannel {
    #[default]
    Socket,
    Serial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub reply_channel: ReplyChannel,
}

impl NetworkConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.50".to_string(),
            port: DEFAULT_TCP_PORT,
            connect_timeout: Duration::from_secs(5),
            reply_channel: ReplyChannel::Socket,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Serial(SerialConfig),
    Network(NetworkConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Serial(_) => TransportKind::Serial,
            TransportConfig::Network(_) => TransportKind::Network,
        }
    }
}
