use crate::domain::model::{ClassLabel, NetworkConfig, SerialConfig, TransportKind};
use crate::utils::error::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Shared switch that closes a transport from outside the task using it.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// A byte link to the inference device.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Port path or `host:port`, for status and logs.
    fn endpoint(&self) -> &str;

    fn is_open(&self) -> bool;

    fn close_handle(&self) -> CloseHandle;

    /// Writes the whole payload and returns how long the write took.
    /// Bounded by the link's I/O timeout.
    async fn send(&mut self, payload: &[u8]) -> Result<Duration>;

    /// Reads one newline-terminated line, decoded lossily.
    /// `Ok(None)` means no full line arrived within `timeout` or the link's
    /// own per-read limit, whichever is shorter.
    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// Drops buffered and already readable input without waiting.
    /// Returns how many bytes were thrown away.
    async fn discard_input(&mut self) -> Result<usize>;

    /// Best effort and idempotent. Pending reads fail once closed.
    async fn close(&mut self);
}

/// Opens transports for the session. Lets tests swap in in-memory links.
#[async_trait]
pub trait Connector: Send + Sync {
    fn list_ports(&self) -> Result<Vec<String>>;

    async fn open_serial(&self, config: &SerialConfig) -> Result<Box<dyn Transport>>;

    async fn open_network(&self, config: &NetworkConfig) -> Result<Box<dyn Transport>>;
}

/// Derives the expected class for an input image.
pub trait LabelPolicy: Send + Sync {
    fn ground_truth(&self, image: &Path) -> Option<ClassLabel>;
}
