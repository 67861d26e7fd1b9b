//! Connection Establisher Module
//!
//! Produces a socket for a new session, either by listening for the clock
//! to dial in or by dialing a paired clock. Each attempt runs on its own
//! task and reports back through a callback; cancelling aborts the task,
//! which drops the listening endpoint or half-open socket it owns.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::ServiceRecord;
use super::transport::{BoxedStream, RfcommAdapter};
use crate::domain::models::{RemoteDevice, SessionRole};
use crate::error::LinkError;

/// Progress of one establishment attempt.
pub enum EstablisherReport {
    /// The listening endpoint is open and waiting for the clock
    Listening,
    /// A socket is connected and ready to become a session
    Established {
        stream: BoxedStream,
        peer: Option<RemoteDevice>,
    },
    /// The attempt ended without a socket
    Failed(LinkError),
}

impl std::fmt::Debug for EstablisherReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listening => f.write_str("Listening"),
            Self::Established { peer, .. } => write!(f, "Established({:?})", peer),
            Self::Failed(e) => write!(f, "Failed({})", e),
        }
    }
}

/// A running listener or dialer.
pub struct Establisher {
    id: u64,
    role: SessionRole,
    task: Option<JoinHandle<()>>,
}

impl Establisher {
    /// Open one listening endpoint for `service` and accept a single connection.
    ///
    /// The endpoint is released as soon as one connection is accepted or
    /// accept fails; further inbound connections are not queued.
    pub fn listen<F>(id: u64, adapter: Arc<dyn RfcommAdapter>, service: ServiceRecord, report: F) -> Self
    where
        F: Fn(EstablisherReport) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut listener = match adapter.bind(&service).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!("Could not open listener for '{}': {}", service.name, e);
                    report(EstablisherReport::Failed(e));
                    return;
                }
            };

            info!("Listening for '{}' ({})", service.name, service.uuid);
            report(EstablisherReport::Listening);

            let accepted = listener.accept().await;
            drop(listener);

            match accepted {
                Ok((stream, peer)) => {
                    info!("Accepted inbound link from {:?}", peer);
                    report(EstablisherReport::Established { stream, peer });
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    report(EstablisherReport::Failed(e));
                }
            }
        });

        Self {
            id,
            role: SessionRole::Listener,
            task: Some(task),
        }
    }

    /// Dial `device` once. No retry happens at this layer.
    pub fn dial<F>(
        id: u64,
        adapter: Arc<dyn RfcommAdapter>,
        device: RemoteDevice,
        service_uuid: Uuid,
        report: F,
    ) -> Self
    where
        F: Fn(EstablisherReport) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            adapter.cancel_discovery();
            info!("Dialing {} for service {}", device, service_uuid);

            match adapter.connect(&device, service_uuid).await {
                Ok(stream) => {
                    info!("Connected to {}", device);
                    report(EstablisherReport::Established {
                        stream,
                        peer: Some(device),
                    });
                }
                Err(e) => {
                    warn!("Connect to {} failed: {}", device, e);
                    let error = match e {
                        LinkError::ConnectFailed { .. } => e,
                        other => LinkError::ConnectFailed {
                            device,
                            reason: other.to_string(),
                        },
                    };
                    report(EstablisherReport::Failed(error));
                }
            }
        });

        Self {
            id,
            role: SessionRole::Dialer,
            task: Some(task),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Abort the attempt and wait until its socket is released.
    pub async fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
            debug!("{} {} cancelled", self.role, self.id);
        }
    }
}

impl Drop for Establisher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::loopback::loopback;
    use tokio::sync::mpsc;

    fn collector() -> (
        impl Fn(EstablisherReport) + Send + 'static,
        mpsc::UnboundedReceiver<EstablisherReport>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            move |report| {
                let _ = tx.send(report);
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_listener_accepts_once_then_stops() {
        let (adapter, peer) = loopback();
        let (report, mut reports) = collector();
        let _listener = Establisher::listen(1, Arc::new(adapter), ServiceRecord::default(), report);

        assert!(matches!(reports.recv().await, Some(EstablisherReport::Listening)));
        let _clock = peer.dial_in(RemoteDevice::new("clock", "Nixie")).unwrap();

        match reports.recv().await {
            Some(EstablisherReport::Established { peer: who, .. }) => {
                assert_eq!(who, Some(RemoteDevice::new("clock", "Nixie")))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!peer.is_listening());
    }

    #[tokio::test]
    async fn test_listener_bind_failure_reported() {
        let (adapter, peer) = loopback();
        peer.fail_bind(true);
        let (report, mut reports) = collector();
        let _listener = Establisher::listen(1, Arc::new(adapter), ServiceRecord::default(), report);

        assert!(matches!(
            reports.recv().await,
            Some(EstablisherReport::Failed(LinkError::Socket { op: "bind", .. }))
        ));
    }

    #[tokio::test]
    async fn test_cancel_releases_listening_endpoint() {
        let (adapter, peer) = loopback();
        let (report, mut reports) = collector();
        let listener = Establisher::listen(1, Arc::new(adapter), ServiceRecord::default(), report);
        assert!(matches!(reports.recv().await, Some(EstablisherReport::Listening)));
        assert!(peer.is_listening());

        listener.cancel().await;
        assert!(!peer.is_listening());
    }

    #[tokio::test]
    async fn test_dialer_cancels_discovery_and_reports_failure() {
        let (adapter, peer) = loopback();
        peer.refuse_dials(true);
        let (report, mut reports) = collector();
        let device = RemoteDevice::new("00:11:22:33:44:55", "Nixie");
        let _dialer = Establisher::dial(2, Arc::new(adapter), device.clone(), Uuid::nil(), report);

        match reports.recv().await {
            Some(EstablisherReport::Failed(LinkError::ConnectFailed { device: d, .. })) => {
                assert_eq!(d, device)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(peer.discovery_cancels(), 1);
    }
}
