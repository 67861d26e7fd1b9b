//! In-memory transport
//!
//! [`LoopbackAdapter`] behaves like an RFCOMM adapter whose only remote
//! device is a [`LoopbackPeer`] held by the caller. The peer plays the clock:
//! it dials in to a bound listener, picks up outbound dials, and can be told
//! to refuse connections or fail to bind.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::protocol::ServiceRecord;
use super::transport::{BoxedStream, RfcommAdapter, RfcommListener};
use crate::domain::models::RemoteDevice;
use crate::error::{LinkError, Result};

const PIPE_CAPACITY: usize = 4096;

type Inbound = (DuplexStream, Option<RemoteDevice>);

struct Shared {
    listener: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    dialed_tx: mpsc::UnboundedSender<(RemoteDevice, DuplexStream)>,
    refuse_dials: AtomicBool,
    fail_bind: AtomicBool,
    discovery_cancels: AtomicUsize,
    binds: AtomicUsize,
}

/// Adapter half handed to the connection manager.
#[derive(Clone)]
pub struct LoopbackAdapter {
    shared: Arc<Shared>,
}

/// Remote half, driven by tests or an emulator.
pub struct LoopbackPeer {
    shared: Arc<Shared>,
    dialed_rx: mpsc::UnboundedReceiver<(RemoteDevice, DuplexStream)>,
}

/// Create a connected adapter/peer pair.
pub fn loopback() -> (LoopbackAdapter, LoopbackPeer) {
    let (dialed_tx, dialed_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        listener: Mutex::new(None),
        dialed_tx,
        refuse_dials: AtomicBool::new(false),
        fail_bind: AtomicBool::new(false),
        discovery_cancels: AtomicUsize::new(0),
        binds: AtomicUsize::new(0),
    });

    (
        LoopbackAdapter {
            shared: shared.clone(),
        },
        LoopbackPeer { shared, dialed_rx },
    )
}

struct LoopbackListener {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl RfcommListener for LoopbackListener {
    async fn accept(&mut self) -> Result<(BoxedStream, Option<RemoteDevice>)> {
        match self.rx.recv().await {
            Some((stream, peer)) => Ok((Box::new(stream), peer)),
            None => Err(LinkError::socket(
                "accept",
                io::Error::new(io::ErrorKind::NotConnected, "listening endpoint closed"),
            )),
        }
    }
}

#[async_trait]
impl RfcommAdapter for LoopbackAdapter {
    async fn bind(&self, _service: &ServiceRecord) -> Result<Box<dyn RfcommListener>> {
        if self.shared.fail_bind.load(Ordering::SeqCst) {
            return Err(LinkError::socket(
                "bind",
                io::Error::new(io::ErrorKind::AddrInUse, "service already registered"),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut slot) = self.shared.listener.lock() {
            *slot = Some(tx);
        }
        self.shared.binds.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackListener { rx }))
    }

    async fn connect(&self, device: &RemoteDevice, _service_uuid: Uuid) -> Result<BoxedStream> {
        if self.shared.refuse_dials.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectFailed {
                device: device.clone(),
                reason: "connection refused".to_string(),
            });
        }

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        self.shared
            .dialed_tx
            .send((device.clone(), far))
            .map_err(|_| LinkError::ConnectFailed {
                device: device.clone(),
                reason: "host is down".to_string(),
            })?;
        Ok(Box::new(near))
    }

    fn cancel_discovery(&self) {
        self.shared.discovery_cancels.fetch_add(1, Ordering::SeqCst);
    }
}

impl LoopbackPeer {
    /// Connect to the bound listener as `device`.
    pub fn dial_in(&self, device: RemoteDevice) -> Result<DuplexStream> {
        let slot = self
            .shared
            .listener
            .lock()
            .map_err(|_| LinkError::Protocol("loopback state poisoned".to_string()))?;
        let tx = slot.as_ref().ok_or_else(|| LinkError::ConnectFailed {
            device: device.clone(),
            reason: "nothing listening".to_string(),
        })?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send((far, Some(device.clone())))
            .map_err(|_| LinkError::ConnectFailed {
                device,
                reason: "nothing listening".to_string(),
            })?;
        Ok(near)
    }

    /// True while a listener is bound and still accepting.
    pub fn is_listening(&self) -> bool {
        self.shared
            .listener
            .lock()
            .map(|slot| slot.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Wait for the next outbound dial.
    pub async fn next_dial(&mut self) -> Option<(RemoteDevice, DuplexStream)> {
        self.dialed_rx.recv().await
    }

    pub fn refuse_dials(&self, refuse: bool) {
        self.shared.refuse_dials.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_bind(&self, fail: bool) {
        self.shared.fail_bind.store(fail, Ordering::SeqCst);
    }

    /// How many times the adapter was asked to stop discovery.
    pub fn discovery_cancels(&self) -> usize {
        self.shared.discovery_cancels.load(Ordering::SeqCst)
    }

    /// How many listening endpoints have been opened.
    pub fn binds(&self) -> usize {
        self.shared.binds.load(Ordering::SeqCst)
    }
}
