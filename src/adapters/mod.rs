// Adapters layer: concrete links to the device (serial port, TCP socket).

pub mod line;
pub mod network;
pub mod serial;

use crate::domain::model::{NetworkConfig, SerialConfig};
use crate::domain::ports::{Connector, Transport};
use crate::utils::error::Result;
use async_trait::async_trait;

/// Opens real serial ports and TCP sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemConnector;

#[async_trait]
impl Connector for SystemConnector {
    fn list_ports(&self) -> Result<Vec<String>> {
        serial::available_ports()
    }

    async fn open_serial(&self, config: &SerialConfig) -> Result<Box<dyn Transport>> {
        Ok(Box::new(serial::open_serial(config)?))
    }

    async fn open_network(&self, config: &NetworkConfig) -> Result<Box<dyn Transport>> {
        Ok(Box::new(network::open_network(config).await?))
    }
}
