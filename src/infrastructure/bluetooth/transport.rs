//! Transport seam
//!
//! Every backend produces plain byte streams; framing, handshake and session
//! bookkeeping sit above this trait and never see the platform socket.
//! Cancellation is by drop: releasing a listener or stream closes the
//! underlying socket and wakes any pending accept, connect or read.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};
use uuid::Uuid;

use super::protocol::ServiceRecord;
use crate::domain::models::RemoteDevice;
use crate::error::{LinkError, Result};

/// A connected, bidirectional byte stream.
pub trait LinkStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> LinkStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn LinkStream>;

/// A bound listening endpoint. Accepts exactly once per call.
#[async_trait]
pub trait RfcommListener: Send {
    /// Wait for an inbound connection. The peer identity is reported when the backend knows it.
    async fn accept(&mut self) -> Result<(BoxedStream, Option<RemoteDevice>)>;
}

/// Platform access to RFCOMM sockets.
#[async_trait]
pub trait RfcommAdapter: Send + Sync + 'static {
    /// Open a listening endpoint advertising `service`.
    async fn bind(&self, service: &ServiceRecord) -> Result<Box<dyn RfcommListener>>;

    /// Open one outbound socket to `device` and connect it once.
    async fn connect(&self, device: &RemoteDevice, service_uuid: Uuid) -> Result<BoxedStream>;

    /// Stop any inquiry in progress; discovery slows connection setup.
    fn cancel_discovery(&self) {}
}

/// TCP stand-in for RFCOMM, for serial-to-TCP bridges and clock emulators.
///
/// The listener binds `listen_addr`; a device address is dialed as `host:port`.
#[derive(Debug, Clone)]
pub struct TcpAdapter {
    listen_addr: String,
}

impl TcpAdapter {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
        }
    }
}

struct TcpLink {
    listener: TcpListener,
}

#[async_trait]
impl RfcommListener for TcpLink {
    async fn accept(&mut self) -> Result<(BoxedStream, Option<RemoteDevice>)> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| LinkError::socket("accept", e))?;
        let _ = stream.set_nodelay(true);
        debug!("Accepted TCP link from {}", addr);

        let peer = RemoteDevice::new(addr.to_string(), "");
        Ok((Box::new(stream), Some(peer)))
    }
}

#[async_trait]
impl RfcommAdapter for TcpAdapter {
    async fn bind(&self, service: &ServiceRecord) -> Result<Box<dyn RfcommListener>> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| LinkError::socket("bind", e))?;
        let local: Option<SocketAddr> = listener.local_addr().ok();
        info!("Listening for '{}' on tcp {:?}", service.name, local);
        Ok(Box::new(TcpLink { listener }))
    }

    async fn connect(&self, device: &RemoteDevice, _service_uuid: Uuid) -> Result<BoxedStream> {
        let stream = TcpStream::connect(&device.address)
            .await
            .map_err(|e| LinkError::ConnectFailed {
                device: device.clone(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_adapter_dial_to_plain_listener() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let adapter = TcpAdapter::new("127.0.0.1:0");
        let device = RemoteDevice::new(addr.to_string(), "emulator");
        let mut stream = adapter.connect(&device, Uuid::nil()).await.unwrap();

        let (mut peer, _) = server.accept().await.unwrap();
        stream.write_all(b"REQ_CONN\n").await.unwrap();

        let mut buf = [0u8; 9];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"REQ_CONN\n");
    }

    #[tokio::test]
    async fn test_tcp_adapter_connect_refused() {
        // Reserve a port, then free it so nothing listens there.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let adapter = TcpAdapter::new("127.0.0.1:0");
        let device = RemoteDevice::new(addr.to_string(), "");
        let result = adapter.connect(&device, Uuid::nil()).await;
        assert!(matches!(result, Err(LinkError::ConnectFailed { .. })));
    }
}
