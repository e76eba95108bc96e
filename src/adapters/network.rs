use crate::adapters::line::LineTransport;
use crate::domain::model::{NetworkConfig, TransportKind};
use crate::utils::error::{DeviceError, Result};
use tokio::net::TcpStream;

pub type NetworkTransport = LineTransport<TcpStream>;

/// Connects straight to `host:port`; no probing, one connection per request.
pub async fn open_network(config: &NetworkConfig) -> Result<NetworkTransport> {
    let target = config.address();
    tracing::debug!("Connecting to {} (timeout {:?})", target, config.connect_timeout);

    let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&target)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(DeviceError::ConnectFailed { target, source }),
        Err(_) => {
            return Err(DeviceError::ConnectTimeout {
                target,
                timeout: config.connect_timeout,
            })
        }
    };

    // the payload is one small burst, don't let Nagle hold it back
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Could not disable Nagle on {}: {}", target, e);
    }

    // same bound for each write and read on the socket
    Ok(LineTransport::new(stream, TransportKind::Network, target)
        .with_io_timeout(config.connect_timeout))
}
