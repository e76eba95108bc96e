use crate::adapters::line::LineTransport;
use crate::domain::model::{SerialConfig, TransportKind};
use crate::utils::error::{DeviceError, Result};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

pub type SerialTransport = LineTransport<SerialStream>;

/// Serial ports in the order the OS reports them.
pub fn available_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(|e| DeviceError::IoError(e.into()))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// Opens the pinned port, or the first port that opens when none is pinned.
pub fn open_serial(config: &SerialConfig) -> Result<SerialTransport> {
    let candidates = match &config.port {
        Some(port) => vec![port.clone()],
        None => available_ports()?,
    };

    let (port, stream) = open_first(&candidates, config.port.is_some(), |path| {
        tokio_serial::new(path, config.baud_rate)
            .open_native_async()
            .map_err(std::io::Error::from)
    })?;

    tracing::info!("✓ Connected to {} at {} baud", port, config.baud_rate);
    Ok(LineTransport::new(stream, TransportKind::Serial, port)
        .with_io_timeout(config.read_timeout)
        .with_input_purge(purge_input))
}

// 清掉驅動層還沒讀出的資料 (上一輪遲到的回應)
fn purge_input(port: &SerialStream) -> std::io::Result<()> {
    port.clear(ClearBuffer::Input).map_err(std::io::Error::from)
}

/// Tries `candidates` in order and keeps the first that opens.
///
/// A pinned port reports its own failure; auto-probing reports
/// `NoDeviceFound` when nothing opens or nothing is listed.
pub fn open_first<T, F>(candidates: &[String], pinned: bool, mut open: F) -> Result<(String, T)>
where
    F: FnMut(&str) -> std::io::Result<T>,
{
    if candidates.is_empty() {
        tracing::warn!("No COM ports found");
        return Err(DeviceError::NoDeviceFound);
    }

    for candidate in candidates {
        match open(candidate) {
            Ok(handle) => return Ok((candidate.clone(), handle)),
            Err(source) if pinned => {
                return Err(DeviceError::ConnectFailed {
                    target: candidate.clone(),
                    source,
                })
            }
            Err(e) => tracing::debug!("Skipping {}: {}", candidate, e),
        }
    }

    Err(DeviceError::NoDeviceFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    fn ports(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_open_first_takes_first_success_in_order() {
        let mut tried = Vec::new();
        let (port, handle) = open_first(&ports(&["COM1", "COM3", "COM4"]), false, |p| {
            tried.push(p.to_string());
            if p == "COM1" {
                Err(Error::new(ErrorKind::PermissionDenied, "busy"))
            } else {
                Ok(p.len())
            }
        })
        .unwrap();

        assert_eq!(port, "COM3");
        assert_eq!(handle, 4);
        assert_eq!(tried, vec!["COM1", "COM3"]);
    }

    #[test]
    fn test_open_first_empty_list_is_no_device() {
        let result = open_first::<(), _>(&[], false, |_| Ok(()));
        assert!(matches!(result, Err(DeviceError::NoDeviceFound)));
    }

    #[test]
    fn test_open_first_all_failing_is_no_device() {
        let result = open_first::<(), _>(&ports(&["/dev/ttyS0", "/dev/ttyUSB0"]), false, |_| {
            Err(Error::new(ErrorKind::NotFound, "gone"))
        });
        assert!(matches!(result, Err(DeviceError::NoDeviceFound)));
    }

    #[test]
    fn test_open_first_pinned_failure_is_connect_failed() {
        let result = open_first::<(), _>(&ports(&["/dev/ttyUSB0"]), true, |_| {
            Err(Error::new(ErrorKind::PermissionDenied, "denied"))
        });
        match result {
            Err(DeviceError::ConnectFailed { target, .. }) => assert_eq!(target, "/dev/ttyUSB0"),
            other => panic!("unexpected result: {:?}", other.map(|(p, _)| p)),
        }
    }
}
