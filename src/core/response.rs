//! Device response parsing.
//!
//! The firmware prints one fact per line, in any order:
//!
//! ```text
//! RX_us:<uint>
//! INFER_us:<uint>
//! TOTAL_us:<uint>
//! RESULT:<TIGER|NOT_TIGER>:<confidence>
//! ```
//!
//! `RESULT` is definitive and ends the wait. Anything else the device prints
//! (boot chatter, debug output, half-written lines) is dropped.

use crate::domain::model::{ClassLabel, TelemetryResult};
use crate::domain::ports::Transport;
use std::time::Duration;
use tokio::time::Instant;

/// Total time the device gets to answer one request.
pub const RESPONSE_WINDOW: Duration = Duration::from_secs(3);

const RX_PREFIX: &str = "RX_us:";
const INFER_PREFIX: &str = "INFER_us:";
const TOTAL_PREFIX: &str = "TOTAL_us:";
const RESULT_PREFIX: &str = "RESULT:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    Waiting,
    Accumulating,
    Complete,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Complete(TelemetryResult),
    Expired(TelemetryResult),
}

impl ResponseOutcome {
    pub fn telemetry(&self) -> &TelemetryResult {
        match self {
            ResponseOutcome::Complete(t) | ResponseOutcome::Expired(t) => t,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ResponseOutcome::Complete(_))
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryParser {
    telemetry: TelemetryResult,
    state: ParserState,
}

impl Default for TelemetryParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryParser {
    pub fn new() -> Self {
        Self {
            telemetry: TelemetryResult::default(),
            state: ParserState::Waiting,
        }
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    pub fn telemetry(&self) -> &TelemetryResult {
        &self.telemetry
    }

    /// Applies one line. Lines after a terminal state are ignored.
    pub fn feed(&mut self, raw: &str) -> ParserState {
        if matches!(self.state, ParserState::Complete | ParserState::Expired) {
            return self.state;
        }

        let line = raw.trim();
        if line.is_empty() {
            return self.state;
        }

        let accepted = if line.starts_with(RX_PREFIX) {
            set_timing(&mut self.telemetry.rx_micros, line)
        } else if line.starts_with(INFER_PREFIX) {
            set_timing(&mut self.telemetry.infer_micros, line)
        } else if line.starts_with(TOTAL_PREFIX) {
            set_timing(&mut self.telemetry.total_micros, line)
        } else if line.starts_with(RESULT_PREFIX) {
            match parse_result(line) {
                Some((class, confidence)) => {
                    self.telemetry.predicted_class = Some(class);
                    self.telemetry.confidence_percent = Some(confidence);
                    self.state = ParserState::Complete;
                    return self.state;
                }
                None => false,
            }
        } else {
            false
        };

        if accepted {
            self.state = ParserState::Accumulating;
        } else {
            tracing::trace!("Ignoring device line: {:?}", line);
        }
        self.state
    }

    /// Marks the window as elapsed. No-op once complete.
    pub fn expire(&mut self) {
        if self.state != ParserState::Complete {
            self.state = ParserState::Expired;
        }
    }

    pub fn into_outcome(self) -> ResponseOutcome {
        match self.state {
            ParserState::Complete => ResponseOutcome::Complete(self.telemetry),
            _ => ResponseOutcome::Expired(self.telemetry),
        }
    }
}

// `KEY:<value>`; only the first field after the key counts.
fn set_timing(slot: &mut Option<u64>, line: &str) -> bool {
    match line.split(':').nth(1).map(str::trim).and_then(|v| v.parse().ok()) {
        Some(value) => {
            *slot = Some(value);
            true
        }
        None => false,
    }
}

fn parse_result(line: &str) -> Option<(ClassLabel, u8)> {
    let mut fields = line.split(':').skip(1);
    let class = fields.next()?.trim().parse::<ClassLabel>().ok()?;
    let confidence = fields.next()?.trim().parse::<u8>().ok()?;
    (confidence <= 100).then_some((class, confidence))
}

/// Reads lines until a `RESULT` arrives or `window` runs out.
///
/// Every read is capped by what is left of the window. A link error ends
/// the wait early and is reported like an expired window.
pub async fn read_telemetry(transport: &mut dyn Transport, window: Duration) -> ResponseOutcome {
    let deadline = Instant::now() + window;
    let mut parser = TelemetryParser::new();
    let mut lines = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match transport.read_line(remaining).await {
            Ok(Some(line)) => {
                lines += 1;
                if parser.feed(&line) == ParserState::Complete {
                    tracing::debug!("Definitive result after {} line(s)", lines);
                    break;
                }
            }
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Read from {} failed: {}", transport.endpoint(), e);
                break;
            }
        }
    }

    parser.expire();
    parser.into_outcome()
}
