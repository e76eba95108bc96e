//! Send/measure orchestration.
//!
//! One `Session` owns the serial handle, the accuracy counters and the
//! single-request lock. Every cycle walks
//! `Idle → Quantizing → Transmitting → AwaitingResponse → Complete | TimedOut | Failed → Idle`,
//! and a request arriving while a cycle is in flight gets `Busy`.
//!
//! A held serial handle is flushed of leftover input before each frame goes
//! out, so late lines from an earlier cycle never answer a new request.

use crate::core::accuracy::{AccuracyTracker, FileNameLabelPolicy};
use crate::core::quantizer::Quantizer;
use crate::core::response::{read_telemetry, ResponseOutcome, RESPONSE_WINDOW};
use crate::domain::model::{
    AccuracySnapshot, MeasurementReport, NetworkConfig, ReplyChannel, SerialConfig,
    SessionPhase, TransportConfig, DEFAULT_IMAGE_SIDE,
};
use crate::domain::ports::{CloseHandle, Connector, LabelPolicy, Transport};
use crate::utils::error::{DeviceError, Result};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

// one full cycle is seven transitions
const PHASE_BACKLOG: usize = 32;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub response_window: Duration,
    pub image_side: u32,
    /// Serial settings used when Wi-Fi replies come back over UART.
    pub reply_serial: SerialConfig,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            response_window: RESPONSE_WINDOW,
            image_side: DEFAULT_IMAGE_SIDE,
            reply_serial: SerialConfig::default(),
        }
    }
}

#[derive(Default)]
struct CycleState {
    serial: Option<Box<dyn Transport>>,
}

/// Current phase plus the stream of every transition.
struct PhaseBus {
    current: watch::Sender<SessionPhase>,
    transitions: broadcast::Sender<SessionPhase>,
}

impl PhaseBus {
    fn new() -> Self {
        let (current, _) = watch::channel(SessionPhase::Idle);
        let (transitions, _) = broadcast::channel(PHASE_BACKLOG);
        Self {
            current,
            transitions,
        }
    }

    fn set(&self, phase: SessionPhase) {
        tracing::debug!("Session phase → {:?}", phase);
        self.current.send_replace(phase);
        // no subscribers is fine
        let _ = self.transitions.send(phase);
    }
}

pub struct Session<C: Connector, L: LabelPolicy = FileNameLabelPolicy> {
    connector: C,
    label_policy: L,
    quantizer: Quantizer,
    response_window: Duration,
    reply_serial: SerialConfig,
    cycle: tokio::sync::Mutex<CycleState>,
    accuracy: Mutex<AccuracyTracker>,
    phase: PhaseBus,
    active_link: Mutex<Option<CloseHandle>>,
}

/// Puts the session back to `Idle` however the cycle ends, including drop.
struct IdleOnDrop<'a>(&'a PhaseBus);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set(SessionPhase::Idle);
    }
}

/// Keeps a link reachable from `abort()` until dropped.
struct ActiveLink<'a>(&'a Mutex<Option<CloseHandle>>);

impl Drop for ActiveLink<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // counters stay consistent even if a holder panicked
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<C: Connector> Session<C> {
    pub fn new(connector: C) -> Self {
        Self::with_options(connector, FileNameLabelPolicy, SessionOptions::default())
    }
}

impl<C: Connector, L: LabelPolicy> Session<C, L> {
    pub fn with_options(connector: C, label_policy: L, options: SessionOptions) -> Self {
        Self {
            connector,
            label_policy,
            quantizer: Quantizer::new(options.image_side),
            response_window: options.response_window,
            reply_serial: options.reply_serial,
            cycle: tokio::sync::Mutex::new(CycleState::default()),
            accuracy: Mutex::new(AccuracyTracker::new()),
            phase: PhaseBus::new(),
            active_link: Mutex::new(None),
        }
    }

    /// Phase right now. Between requests this is always `Idle`.
    pub fn phase(&self) -> SessionPhase {
        *self.phase.current.borrow()
    }

    /// Every phase transition from now on, in order, terminal phases
    /// (`Complete`, `TimedOut`, `Failed`) included.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionPhase> {
        self.phase.transitions.subscribe()
    }

    pub fn list_available_ports(&self) -> Result<Vec<String>> {
        self.connector.list_ports()
    }

    /// Drops the current serial handle and opens a new one.
    /// `config.port == None` probes every port.
    pub async fn connect(&self, config: &SerialConfig) -> Result<String> {
        let mut cycle = self.cycle.try_lock().map_err(|_| DeviceError::Busy)?;
        if let Some(mut stale) = cycle.serial.take() {
            stale.close().await;
        }

        let link = self.connector.open_serial(config).await?;
        let endpoint = link.endpoint().to_string();
        cycle.serial = Some(link);
        Ok(endpoint)
    }

    /// Closes the serial handle if one is held.
    pub async fn disconnect(&self) -> Result<()> {
        let mut cycle = self.cycle.try_lock().map_err(|_| DeviceError::Busy)?;
        if let Some(mut link) = cycle.serial.take() {
            link.close().await;
            tracing::info!("Disconnected from {}", link.endpoint());
        }
        Ok(())
    }

    pub fn connected_port(&self) -> Option<String> {
        let cycle = self.cycle.try_lock().ok()?;
        cycle
            .serial
            .as_ref()
            .filter(|link| link.is_open())
            .map(|link| link.endpoint().to_string())
    }

    pub fn get_accuracy(&self) -> AccuracySnapshot {
        lock(&self.accuracy).snapshot()
    }

    pub fn reset_accuracy(&self) {
        lock(&self.accuracy).reset();
        tracing::info!("Accuracy statistics reset");
    }

    /// Closes the link of an in-flight send or response wait so it ends
    /// right away. Returns `false` when no link is in use (idle, quantizing
    /// or still connecting).
    pub fn abort(&self) -> bool {
        match lock(&self.active_link).as_ref() {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    /// Runs one full cycle: quantize, send, wait for telemetry, score.
    pub async fn send_and_measure(
        &self,
        image: &Path,
        transport: &TransportConfig,
    ) -> Result<MeasurementReport> {
        let mut cycle = self.cycle.try_lock().map_err(|_| {
            tracing::debug!("Rejecting request for {}: cycle in flight", image.display());
            DeviceError::Busy
        })?;
        let _idle = IdleOnDrop(&self.phase);

        let result = self.run_cycle(&mut cycle, image, transport).await;
        let terminal = match &result {
            Ok(_) => SessionPhase::Complete,
            Err(e) if e.is_timeout() => SessionPhase::TimedOut,
            Err(_) => SessionPhase::Failed,
        };
        self.phase.set(terminal);

        match &result {
            Ok(report) => tracing::info!(
                "✓ {} → {} ({}%)",
                report.image_name,
                report.telemetry.predicted_class.map(|c| c.as_str()).unwrap_or("?"),
                report.telemetry.confidence_percent.unwrap_or_default()
            ),
            Err(e) if e.is_timeout() => tracing::warn!("No response from device for {}", image.display()),
            Err(e) => tracing::warn!("Measurement failed for {}: {}", image.display(), e),
        }
        result
    }

    fn track(&self, link: &dyn Transport) -> ActiveLink<'_> {
        *lock(&self.active_link) = Some(link.close_handle());
        ActiveLink(&self.active_link)
    }

    async fn run_cycle(
        &self,
        cycle: &mut CycleState,
        image: &Path,
        transport: &TransportConfig,
    ) -> Result<MeasurementReport> {
        self.phase.set(SessionPhase::Quantizing);
        let payload = self.quantizer.quantize(image)?;
        let bytes = payload.to_bytes();

        self.phase.set(SessionPhase::Transmitting);
        let (outcome, tx_time) = match transport {
            TransportConfig::Serial(config) => (self.measure_serial(cycle, config, &bytes).await?, None),
            TransportConfig::Network(config) => {
                let (outcome, tx) = self.measure_network(cycle, config, &bytes).await?;
                (outcome, Some(tx))
            }
        };

        let telemetry = match outcome {
            ResponseOutcome::Complete(telemetry) => telemetry,
            ResponseOutcome::Expired(partial) => return Err(DeviceError::Timeout { partial }),
        };

        let ground_truth = self.label_policy.ground_truth(image);
        let (correct, accuracy) = {
            let mut tracker = lock(&self.accuracy);
            let correct = match (ground_truth, telemetry.predicted_class) {
                (Some(truth), Some(predicted)) => Some(tracker.record(truth, predicted)),
                _ => None,
            };
            (correct, tracker.snapshot())
        };

        Ok(MeasurementReport {
            image_name: image
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| image.display().to_string()),
            transport: transport.kind(),
            telemetry,
            tx_millis: tx_time.map(|d| d.as_secs_f64() * 1000.0),
            ground_truth,
            correct,
            accuracy,
            completed_at: chrono::Utc::now(),
        })
    }

    async fn measure_serial(
        &self,
        cycle: &mut CycleState,
        config: &SerialConfig,
        payload: &[u8],
    ) -> Result<ResponseOutcome> {
        self.ensure_serial(cycle, config).await?;
        let Some(link) = cycle.serial.as_mut() else {
            return Err(DeviceError::NoDeviceFound);
        };

        let active = self.track(&**link);
        if let Err(e) = link.send(payload).await {
            drop(active);
            Self::drop_serial(cycle).await;
            return Err(e);
        }

        let outcome = self.await_response(link.as_mut()).await;
        drop(active);
        if !link.is_open() {
            Self::drop_serial(cycle).await;
        }
        Ok(outcome)
    }

    async fn measure_network(
        &self,
        cycle: &mut CycleState,
        config: &NetworkConfig,
        payload: &[u8],
    ) -> Result<(ResponseOutcome, Duration)> {
        // UART must already be listening (and empty) before the image goes out
        if config.reply_channel == ReplyChannel::Serial {
            self.ensure_serial(cycle, &self.reply_serial).await?;
        }

        let started = Instant::now();
        let mut link = self.connector.open_network(config).await?;
        let active = self.track(&*link);
        if let Err(e) = link.send(payload).await {
            drop(active);
            link.close().await;
            return Err(e);
        }
        let tx_time = started.elapsed();
        tracing::debug!("TX to {} took {:?}", link.endpoint(), tx_time);

        let outcome = match config.reply_channel {
            ReplyChannel::Socket => {
                let outcome = self.await_response(link.as_mut()).await;
                drop(active);
                link.close().await;
                outcome
            }
            ReplyChannel::Serial => {
                drop(active);
                link.close().await;
                let Some(serial) = cycle.serial.as_mut() else {
                    return Err(DeviceError::NoDeviceFound);
                };
                let active = self.track(&**serial);
                let outcome = self.await_response(serial.as_mut()).await;
                drop(active);
                if !serial.is_open() {
                    Self::drop_serial(cycle).await;
                }
                outcome
            }
        };

        Ok((outcome, tx_time))
    }

    /// Reuses the held serial handle when it is open and matches `config`,
    /// otherwise opens a new one. Either way the link starts with no
    /// unread input.
    async fn ensure_serial(&self, cycle: &mut CycleState, config: &SerialConfig) -> Result<()> {
        let reusable = cycle.serial.as_ref().is_some_and(|link| {
            link.is_open()
                && config
                    .port
                    .as_deref()
                    .map_or(true, |port| port == link.endpoint())
        });

        if reusable {
            if let Some(link) = cycle.serial.as_mut() {
                match link.discard_input().await {
                    Ok(_) => return Ok(()),
                    Err(e) => tracing::debug!(
                        "Held serial handle {} is unusable ({}), reopening",
                        link.endpoint(),
                        e
                    ),
                }
            }
        }

        Self::drop_serial(cycle).await;
        let mut link = self.connector.open_serial(config).await?;
        link.discard_input().await?;
        cycle.serial = Some(link);
        Ok(())
    }

    async fn drop_serial(cycle: &mut CycleState) {
        if let Some(mut link) = cycle.serial.take() {
            link.close().await;
            tracing::debug!("Released serial handle {}", link.endpoint());
        }
    }

    async fn await_response(&self, link: &mut dyn Transport) -> ResponseOutcome {
        self.phase.set(SessionPhase::AwaitingResponse);
        read_telemetry(link, self.response_window).await
    }
}
