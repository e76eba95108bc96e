//! Newline framing over any async byte stream.
//!
//! Both the serial port and the TCP socket end up here, so send and
//! read semantics are identical regardless of the link underneath.
//! A link that hits EOF or an I/O error marks itself closed.

use crate::domain::model::TransportKind;
use crate::domain::ports::{CloseHandle, Transport};
use crate::utils::error::{DeviceError, Result};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::Instant;

const READ_CHUNK: usize = 256;

/// Per-operation limit for reads and writes unless the adapter sets one.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);

pub struct LineTransport<S> {
    stream: Option<S>,
    kind: TransportKind,
    endpoint: String,
    pending: Vec<u8>,
    closer: CloseHandle,
    io_timeout: Duration,
    purge: fn(&S) -> io::Result<()>,
}

fn keep_os_buffer<S>(_stream: &S) -> io::Result<()> {
    Ok(())
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, kind: TransportKind, endpoint: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            kind,
            endpoint: endpoint.into(),
            pending: Vec::new(),
            closer: CloseHandle::new(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            purge: keep_os_buffer::<S>,
        }
    }

    /// Caps every single write and every single read.
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Hook run by `discard_input` to flush input buffered below the stream
    /// (the OS receive queue of a serial port).
    pub fn with_input_purge(mut self, purge: fn(&S) -> io::Result<()>) -> Self {
        self.purge = purge;
        self
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        Some(decode(&raw))
    }

    // the stream is gone for good; the session must not reuse this link
    fn mark_closed(&mut self) {
        self.closer.close();
        self.stream = None;
    }
}

// device output is not guaranteed to be clean UTF-8
fn decode(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> io::Result<()> {
    stream.write_all(payload).await?;
    stream.flush().await
}

/// One read attempt that never waits: `None` when nothing is ready.
async fn read_ready<S: AsyncRead + Unpin>(stream: &mut S, chunk: &mut [u8]) -> Option<io::Result<usize>> {
    std::future::poll_fn(|cx| {
        let mut buf = ReadBuf::new(&mut *chunk);
        match Pin::new(&mut *stream).poll_read(cx, &mut buf) {
            Poll::Pending => Poll::Ready(None),
            Poll::Ready(result) => Poll::Ready(Some(result.map(|()| buf.filled().len()))),
        }
    })
    .await
}

#[async_trait]
impl<S> Transport for LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_open(&self) -> bool {
        self.stream.is_some() && !self.closer.is_closed()
    }

    fn close_handle(&self) -> CloseHandle {
        self.closer.clone()
    }

    async fn send(&mut self, payload: &[u8]) -> Result<Duration> {
        if self.closer.is_closed() {
            return Err(DeviceError::LinkClosed);
        }
        let closer = self.closer.clone();
        let limit = self.io_timeout;
        let stream = self.stream.as_mut().ok_or(DeviceError::LinkClosed)?;

        let started = Instant::now();
        let written = tokio::select! {
            _ = closer.closed() => return Err(DeviceError::LinkClosed),
            written = tokio::time::timeout(limit, write_frame(stream, payload)) => written,
        };

        match written {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                self.mark_closed();
                return Err(DeviceError::SendFailed { source });
            }
            Err(_) => {
                // a half-written frame would desync the device, so drop the link
                self.mark_closed();
                return Err(DeviceError::SendFailed {
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("write to {} stalled for {:?}", self.endpoint, limit),
                    ),
                });
            }
        }

        let elapsed = started.elapsed();
        tracing::debug!("Sent {} bytes to {} in {:?}", payload.len(), self.endpoint, elapsed);
        Ok(elapsed)
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        let deadline = Instant::now() + timeout.min(self.io_timeout);
        let closer = self.closer.clone();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if closer.is_closed() {
                return Err(DeviceError::LinkClosed);
            }
            let stream = self.stream.as_mut().ok_or(DeviceError::LinkClosed)?;

            // `read` is cancel safe, so nothing buffered is lost on timeout
            let read = tokio::select! {
                _ = closer.closed() => return Err(DeviceError::LinkClosed),
                read = tokio::time::timeout_at(deadline, stream.read(&mut chunk)) => read,
            };

            match read {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    let rest = std::mem::take(&mut self.pending);
                    self.mark_closed();
                    if rest.is_empty() {
                        return Err(DeviceError::LinkClosed);
                    }
                    // peer hung up mid-line, hand over what we have
                    return Ok(Some(decode(&rest)));
                }
                Ok(Ok(n)) => {
                    self.pending.extend_from_slice(&chunk[..n]);
                    if let Some(line) = self.take_line() {
                        return Ok(Some(line));
                    }
                }
                Ok(Err(e)) => {
                    self.mark_closed();
                    return Err(DeviceError::IoError(e));
                }
            }
        }
    }

    async fn discard_input(&mut self) -> Result<usize> {
        if self.closer.is_closed() {
            return Err(DeviceError::LinkClosed);
        }
        let mut dropped = std::mem::take(&mut self.pending).len();
        let purge = self.purge;
        let stream = self.stream.as_mut().ok_or(DeviceError::LinkClosed)?;

        if let Err(e) = purge(stream) {
            tracing::debug!("Could not purge input buffer of {}: {}", self.endpoint, e);
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match read_ready(stream, &mut chunk).await {
                None => break,
                Some(Ok(0)) => {
                    self.mark_closed();
                    return Err(DeviceError::LinkClosed);
                }
                Some(Ok(n)) => dropped += n,
                Some(Err(e)) => {
                    self.mark_closed();
                    return Err(DeviceError::IoError(e));
                }
            }
        }

        if dropped > 0 {
            tracing::debug!("Discarded {} stale bytes from {}", dropped, self.endpoint);
        }
        Ok(dropped)
    }

    async fn close(&mut self) {
        self.closer.close();
        self.pending.clear();
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Ignoring error while closing {}: {}", self.endpoint, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pair() -> (LineTransport<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (client, device) = duplex(1024);
        (LineTransport::new(client, TransportKind::Serial, "mock"), device)
    }

    #[tokio::test]
    async fn test_read_line_splits_buffered_lines() {
        let (mut transport, mut device) = pair();
        device.write_all(b"RX_us:120\r\nINFER_us:45\nTOT").await.unwrap();

        let timeout = Duration::from_millis(200);
        assert_eq!(transport.read_line(timeout).await.unwrap().as_deref(), Some("RX_us:120"));
        assert_eq!(transport.read_line(timeout).await.unwrap().as_deref(), Some("INFER_us:45"));

        device.write_all(b"AL_us:200\n").await.unwrap();
        assert_eq!(transport.read_line(timeout).await.unwrap().as_deref(), Some("TOTAL_us:200"));
    }

    #[tokio::test]
    async fn test_read_line_decodes_invalid_utf8_lossily() {
        let (mut transport, mut device) = pair();
        device.write_all(b"\xff\xfeboot\nRESULT:TIGER:87\n").await.unwrap();

        let first = transport.read_line(Duration::from_millis(200)).await.unwrap().unwrap();
        assert!(first.ends_with("boot"));
        let second = transport.read_line(Duration::from_millis(200)).await.unwrap();
        assert_eq!(second.as_deref(), Some("RESULT:TIGER:87"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_line_times_out_without_losing_partial_data() {
        let (mut transport, mut device) = pair();
        device.write_all(b"RESULT:TI").await.unwrap();

        assert_eq!(transport.read_line(Duration::from_millis(500)).await.unwrap(), None);

        device.write_all(b"GER:87\n").await.unwrap();
        let line = transport.read_line(Duration::from_millis(500)).await.unwrap();
        assert_eq!(line.as_deref(), Some("RESULT:TIGER:87"));
    }

    #[tokio::test]
    async fn test_send_writes_raw_payload() {
        let (mut transport, mut device) = pair();
        let payload: Vec<u8> = (0..=255).collect();

        transport.send(&payload).await.unwrap();

        let mut received = vec![0u8; payload.len()];
        device.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_peer_hangup_is_link_closed() {
        let (mut transport, device) = pair();
        drop(device);

        let result = transport.read_line(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(DeviceError::LinkClosed)));
        assert!(!transport.is_open());
        assert!(matches!(transport.send(&[0; 4]).await, Err(DeviceError::LinkClosed)));
    }

    #[tokio::test]
    async fn test_hangup_mid_line_returns_rest_then_closes() {
        let (mut transport, mut device) = pair();
        device.write_all(b"RESULT:TIGER:87").await.unwrap();
        drop(device);

        let line = transport.read_line(Duration::from_secs(1)).await.unwrap();
        assert_eq!(line.as_deref(), Some("RESULT:TIGER:87"));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_discard_input_drops_buffered_and_ready_bytes() {
        let (mut transport, mut device) = pair();
        device.write_all(b"RESULT:TIGER:87\nTOTAL_us:1111\n").await.unwrap();
        assert_eq!(
            transport.read_line(Duration::from_millis(200)).await.unwrap().as_deref(),
            Some("RESULT:TIGER:87")
        );

        // one line still pending in the buffer, one more waiting in the pipe
        device.write_all(b"RESULT:TIGER:99\n").await.unwrap();
        let dropped = transport.discard_input().await.unwrap();
        assert_eq!(dropped, "TOTAL_us:1111\n".len() + "RESULT:TIGER:99\n".len());
        assert!(transport.is_open());

        device.write_all(b"RESULT:NOT_TIGER:60\n").await.unwrap();
        assert_eq!(
            transport.read_line(Duration::from_millis(200)).await.unwrap().as_deref(),
            Some("RESULT:NOT_TIGER:60")
        );
    }

    #[tokio::test]
    async fn test_discard_input_on_quiet_link_returns_immediately() {
        let (mut transport, _device) = pair();
        assert_eq!(transport.discard_input().await.unwrap(), 0);
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_discard_input_notices_hangup() {
        let (mut transport, device) = pair();
        drop(device);

        assert!(matches!(transport.discard_input().await, Err(DeviceError::LinkClosed)));
        assert!(!transport.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        // the device never reads, so the 64 byte pipe fills up
        let (client, _device) = duplex(64);
        let mut transport = LineTransport::new(client, TransportKind::Serial, "stalled")
            .with_io_timeout(Duration::from_millis(500));
        let started = Instant::now();

        match transport.send(&[7u8; 1024]).await {
            Err(DeviceError::SendFailed { source }) => {
                assert_eq!(source.kind(), io::ErrorKind::TimedOut)
            }
            other => panic!("expected send timeout, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_close_handle_unblocks_stalled_write() {
        let (client, _device) = duplex(64);
        let mut transport = LineTransport::new(client, TransportKind::Serial, "stalled")
            .with_io_timeout(Duration::from_secs(60));
        let handle = transport.close_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.close();
        });

        let result = transport.send(&[7u8; 1024]).await;
        assert!(matches!(result, Err(DeviceError::LinkClosed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_line_is_capped_by_io_timeout() {
        let (client, _device) = duplex(64);
        let mut transport = LineTransport::new(client, TransportKind::Serial, "quiet")
            .with_io_timeout(Duration::from_secs(1));
        let started = Instant::now();

        assert_eq!(transport.read_line(Duration::from_secs(3)).await.unwrap(), None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3));
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_close_handle_unblocks_pending_read() {
        let (mut transport, _device) = pair();
        let handle = transport.close_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.close();
        });

        let result = transport.read_line(Duration::from_secs(10)).await;
        assert!(matches!(result, Err(DeviceError::LinkClosed)));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut transport, _device) = pair();
        transport.close().await;
        transport.close().await;

        assert!(!transport.is_open());
        assert!(matches!(transport.send(&[1, 2, 3]).await, Err(DeviceError::LinkClosed)));
    }
}
