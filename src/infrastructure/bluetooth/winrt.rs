//! Windows RFCOMM backend
//!
//! Listens through `RfcommServiceProvider` + `StreamSocketListener` and dials
//! through `BluetoothDevice` + `StreamSocket`. Each connected socket is
//! bridged to an in-process duplex pipe by two pump tasks, so the rest of
//! the link only sees tokio streams. Dropping the app side of the pipe
//! closes the WinRT socket, which fails any pending read.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::{Ref, GUID, HSTRING};
use windows::Devices::Bluetooth::Rfcomm::{RfcommServiceId, RfcommServiceProvider};
use windows::Devices::Bluetooth::BluetoothDevice;
use windows::Foundation::TypedEventHandler;
use windows::Networking::Sockets::{
    SocketProtectionLevel, StreamSocket, StreamSocketListener,
    StreamSocketListenerConnectionReceivedEventArgs,
};
use windows::Storage::Streams::{Buffer, DataReader, DataWriter, IBuffer, InputStreamOptions};

use super::protocol::ServiceRecord;
use super::transport::{BoxedStream, RfcommAdapter, RfcommListener};
use crate::domain::models::RemoteDevice;
use crate::error::{LinkError, Result};

const PIPE_CAPACITY: usize = 4096;
const READ_CHUNK: u32 = 1024;

fn winrt_error(op: &'static str, e: windows::core::Error) -> LinkError {
    LinkError::socket(op, io::Error::other(e))
}

fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

/// SDP Service Name, in the primary language base.
const SDP_SERVICE_NAME: u32 = 0x0100;
/// SDP data element header for a text string with an 8-bit length.
const SDP_TEXT_LEN8: u8 = 0x25;

/// Encode `name` as an SDP text attribute value.
fn service_name_attribute(name: &str) -> windows::core::Result<IBuffer> {
    let bytes = name.as_bytes();
    let bytes = &bytes[..bytes.len().min(u8::MAX as usize)];

    let writer = DataWriter::new()?;
    writer.WriteByte(SDP_TEXT_LEN8)?;
    writer.WriteByte(bytes.len() as u8)?;
    writer.WriteBytes(bytes)?;
    writer.DetachBuffer()
}

/// RFCOMM through the WinRT Bluetooth stack.
#[derive(Debug, Default, Clone)]
pub struct WinRtAdapter;

impl WinRtAdapter {
    pub fn new() -> Self {
        Self
    }
}

struct WinRtListener {
    provider: RfcommServiceProvider,
    listener: StreamSocketListener,
    incoming: mpsc::UnboundedReceiver<StreamSocket>,
}

#[async_trait]
impl RfcommListener for WinRtListener {
    async fn accept(&mut self) -> Result<(BoxedStream, Option<RemoteDevice>)> {
        let socket = self.incoming.recv().await.ok_or_else(|| {
            LinkError::socket(
                "accept",
                io::Error::new(io::ErrorKind::NotConnected, "listener closed"),
            )
        })?;

        let peer = remote_device(&socket);
        debug!("Accepted RFCOMM socket from {:?}", peer);
        Ok((bridge(socket), peer))
    }
}

impl Drop for WinRtListener {
    fn drop(&mut self) {
        let _ = self.provider.StopAdvertising();
        let _ = self.listener.Close();
    }
}

#[async_trait]
impl RfcommAdapter for WinRtAdapter {
    async fn bind(&self, service: &ServiceRecord) -> Result<Box<dyn RfcommListener>> {
        let service_id =
            RfcommServiceId::FromUuid(to_guid(service.uuid)).map_err(|e| winrt_error("bind", e))?;
        let provider = RfcommServiceProvider::CreateAsync(&service_id)
            .map_err(|e| winrt_error("bind", e))?
            .await
            .map_err(|e| winrt_error("bind", e))?;

        let (tx, incoming) = mpsc::unbounded_channel();
        let listener = StreamSocketListener::new().map_err(|e| winrt_error("bind", e))?;
        let handler = TypedEventHandler::new(
            move |_: Ref<StreamSocketListener>,
                  args: Ref<StreamSocketListenerConnectionReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let _ = tx.send(args.Socket()?);
                }
                Ok(())
            },
        );
        listener
            .ConnectionReceived(&handler)
            .map_err(|e| winrt_error("bind", e))?;

        let service_name = service_id
            .AsString()
            .map_err(|e| winrt_error("bind", e))?;
        listener
            .BindServiceNameWithProtectionLevelAsync(
                &service_name,
                SocketProtectionLevel::BluetoothEncryptionAllowNullAuthentication,
            )
            .map_err(|e| winrt_error("bind", e))?
            .await
            .map_err(|e| winrt_error("bind", e))?;

        let attribute = service_name_attribute(&service.name).map_err(|e| winrt_error("bind", e))?;
        provider
            .SdpRawAttributes()
            .and_then(|attributes| attributes.Insert(SDP_SERVICE_NAME, &attribute))
            .map_err(|e| winrt_error("bind", e))?;

        provider
            .StartAdvertising(&listener)
            .map_err(|e| winrt_error("bind", e))?;
        info!("Advertising RFCOMM service '{}' ({})", service.name, service.uuid);

        Ok(Box::new(WinRtListener {
            provider,
            listener,
            incoming,
        }))
    }

    async fn connect(&self, device: &RemoteDevice, service_uuid: Uuid) -> Result<BoxedStream> {
        let failed = |reason: String| LinkError::ConnectFailed {
            device: device.clone(),
            reason,
        };

        let address = device
            .bluetooth_address()
            .ok_or_else(|| failed(format!("'{}' is not a Bluetooth address", device.address)))?;

        let bt_device = BluetoothDevice::FromBluetoothAddressAsync(address)
            .map_err(|e| failed(e.to_string()))?
            .await
            .map_err(|e| failed(e.to_string()))?;

        let service_id = RfcommServiceId::FromUuid(to_guid(service_uuid))
            .map_err(|e| failed(e.to_string()))?;
        let services = bt_device
            .GetRfcommServicesForIdAsync(&service_id)
            .map_err(|e| failed(e.to_string()))?
            .await
            .map_err(|e| failed(e.to_string()))?
            .Services()
            .map_err(|e| failed(e.to_string()))?;

        if services.Size().map_err(|e| failed(e.to_string()))? == 0 {
            return Err(failed(format!("service {} not found on device", service_uuid)));
        }
        let service = services.GetAt(0).map_err(|e| failed(e.to_string()))?;

        let socket = StreamSocket::new().map_err(|e| failed(e.to_string()))?;
        let host = service
            .ConnectionHostName()
            .map_err(|e| failed(e.to_string()))?;
        let service_name = service
            .ConnectionServiceName()
            .map_err(|e| failed(e.to_string()))?;

        if let Err(e) = connect_socket(&socket, &host, &service_name).await {
            let _ = socket.Close();
            return Err(failed(e.to_string()));
        }

        Ok(bridge(socket))
    }

    fn cancel_discovery(&self) {
        // WinRT has no inquiry to cancel; connect uses the paired device record directly
        debug!("No discovery in progress");
    }
}

async fn connect_socket(
    socket: &StreamSocket,
    host: &windows::Networking::HostName,
    service_name: &HSTRING,
) -> windows::core::Result<()> {
    socket.ConnectAsync(host, service_name)?.await
}

fn remote_device(socket: &StreamSocket) -> Option<RemoteDevice> {
    let host = socket.Information().ok()?.RemoteHostName().ok()?;
    let raw = host.RawName().ok()?.to_string();
    let name = host.DisplayName().map(|n| n.to_string()).unwrap_or_default();
    let address = raw.trim_matches(|c| c == '(' || c == ')').to_string();
    Some(RemoteDevice::new(address, name))
}

/// Hand the socket to two pump tasks and return the app side of the pipe.
fn bridge(socket: StreamSocket) -> BoxedStream {
    let (app_side, pump_side) = tokio::io::duplex(PIPE_CAPACITY);
    let (from_app, to_app) = tokio::io::split(pump_side);

    tokio::spawn(pump_inbound(socket.clone(), to_app));
    tokio::spawn(pump_outbound(socket, from_app));

    Box::new(app_side)
}

async fn pump_inbound(socket: StreamSocket, mut to_app: WriteHalf<DuplexStream>) {
    if let Err(e) = inbound(&socket, &mut to_app).await {
        debug!("RFCOMM inbound pump ended: {}", e);
    }
    let _ = to_app.shutdown().await;
    let _ = socket.Close();
}

async fn inbound(socket: &StreamSocket, to_app: &mut WriteHalf<DuplexStream>) -> Result<()> {
    let input = socket.InputStream().map_err(|e| winrt_error("read", e))?;

    loop {
        let buffer = Buffer::Create(READ_CHUNK).map_err(|e| winrt_error("read", e))?;
        let filled = input
            .ReadAsync(&buffer, READ_CHUNK, InputStreamOptions::Partial)
            .map_err(|e| winrt_error("read", e))?
            .await
            .map_err(|e| winrt_error("read", e))?;

        let len = filled.Length().map_err(|e| winrt_error("read", e))? as usize;
        if len == 0 {
            return Ok(());
        }

        let reader = DataReader::FromBuffer(&filled).map_err(|e| winrt_error("read", e))?;
        let mut bytes = vec![0u8; len];
        reader
            .ReadBytes(&mut bytes)
            .map_err(|e| winrt_error("read", e))?;

        to_app
            .write_all(&bytes)
            .await
            .map_err(|e| LinkError::socket("read", e))?;
    }
}

async fn pump_outbound(socket: StreamSocket, mut from_app: ReadHalf<DuplexStream>) {
    if let Err(e) = outbound(&socket, &mut from_app).await {
        warn!("RFCOMM outbound pump ended: {}", e);
    }
    // app side dropped or write failed; closing fails the pending read too
    let _ = socket.Close();
}

async fn outbound(socket: &StreamSocket, from_app: &mut ReadHalf<DuplexStream>) -> Result<()> {
    let output = socket.OutputStream().map_err(|e| winrt_error("write", e))?;
    let mut chunk = vec![0u8; READ_CHUNK as usize];

    loop {
        let n = from_app
            .read(&mut chunk)
            .await
            .map_err(|e| LinkError::socket("write", e))?;
        if n == 0 {
            return Ok(());
        }

        let writer = DataWriter::new().map_err(|e| winrt_error("write", e))?;
        writer
            .WriteBytes(&chunk[..n])
            .map_err(|e| winrt_error("write", e))?;
        let buffer = writer.DetachBuffer().map_err(|e| winrt_error("write", e))?;

        output
            .WriteAsync(&buffer)
            .map_err(|e| winrt_error("write", e))?
            .await
            .map_err(|e| winrt_error("write", e))?;
        output
            .FlushAsync()
            .map_err(|e| winrt_error("write", e))?
            .await
            .map_err(|e| winrt_error("write", e))?;
    }
}
