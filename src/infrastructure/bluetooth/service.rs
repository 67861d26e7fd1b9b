//! Connection Manager Module
//!
//! Composition root for the link. One owner task holds at most one
//! establisher and at most one session, and processes public requests and
//! notices from its own tasks strictly in order. Every role change closes
//! the previous session completely before the next one can be observed.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::establisher::{Establisher, EstablisherReport};
use super::protocol::{self, ServiceRecord};
use super::session::{LinkSession, SessionInfo, SessionOptions, SessionWriter};
use super::transport::{BoxedStream, RfcommAdapter};
use crate::domain::commands::OutgoingCommand;
use crate::domain::handshake::{Handshake, HandshakePolicy};
use crate::domain::models::{LinkEvent, LinkStatus, RemoteDevice, SessionRole};
use crate::domain::settings::Settings;
use crate::error::{LinkError, Result};

/// Runtime configuration of the connection manager.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub service: ServiceRecord,
    /// Treat new sessions as verified without the challenge exchange
    pub skip_handshake: bool,
    pub handshake: HandshakePolicy,
    pub max_frame_len: usize,
    /// Reopen the listener after `disconnect()` or a remote hangup
    pub listen_after_disconnect: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service: ServiceRecord::default(),
            skip_handshake: false,
            handshake: HandshakePolicy::default(),
            max_frame_len: protocol::DEFAULT_MAX_FRAME_LEN,
            listen_after_disconnect: true,
        }
    }
}

impl LinkConfig {
    /// Derive the runtime configuration from persisted settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let uuid = protocol::parse_uuid(&settings.service_uuid)?;

        Ok(Self {
            service: ServiceRecord::new(uuid, settings.service_name.clone()),
            skip_handshake: settings.skip_handshake,
            handshake: HandshakePolicy {
                max_retries: settings.handshake_max_retries,
                retry_delay: Duration::from_millis(settings.handshake_retry_delay_ms),
            },
            max_frame_len: settings.max_frame_len.max(1),
            listen_after_disconnect: settings.listen_after_disconnect,
        })
    }
}

enum Request {
    StartListening(oneshot::Sender<()>),
    ConnectTo {
        device: RemoteDevice,
        service_uuid: Uuid,
        reply: oneshot::Sender<()>,
    },
    Writer(oneshot::Sender<Option<SessionWriter>>),
    Disconnect(oneshot::Sender<()>),
    Status(oneshot::Sender<LinkStatus>),
    Shutdown(oneshot::Sender<()>),
}

enum Notice {
    Establisher { id: u64, report: EstablisherReport },
    SessionClosed { id: u64 },
}

enum Message {
    Request(Request),
    Notice(Notice),
}

/// Handle to the connection manager task.
///
/// Cloning shares the same manager. The task stops on
/// [`ConnectionManager::shutdown`] or once every handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionManager {
    /// Start the manager task. Link events arrive on the returned receiver.
    pub fn spawn(
        adapter: Arc<dyn RfcommAdapter>,
        config: LinkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let actor = Actor {
            adapter,
            config,
            events: events_tx,
            inbox: tx.downgrade(),
            next_id: 0,
            establisher: None,
            session: None,
        };
        tokio::spawn(actor.run(rx));

        (Self { tx }, events_rx)
    }

    /// Drop any session or attempt in progress and wait for the clock to dial in.
    pub async fn start_listening(&self) -> Result<()> {
        self.call(Request::StartListening).await
    }

    /// Drop any session or attempt in progress and dial `device` once.
    pub async fn connect_to(&self, device: RemoteDevice, service_uuid: Uuid) -> Result<()> {
        self.call(|reply| Request::ConnectTo {
            device,
            service_uuid,
            reply,
        })
        .await
    }

    /// Send one command over the active session.
    ///
    /// Out-of-range commands are rejected before a session is looked up.
    pub async fn write(&self, command: &OutgoingCommand) -> Result<()> {
        command.validate()?;

        let writer = self
            .call(Request::Writer)
            .await?
            .ok_or(LinkError::NoActiveSession)?;
        writer.write(command).await
    }

    /// Close the active session, if any, and return to idle or listening.
    pub async fn disconnect(&self) -> Result<()> {
        self.call(Request::Disconnect).await
    }

    pub async fn status(&self) -> Result<LinkStatus> {
        self.call(Request::Status).await
    }

    /// Release the listener, dialer and session, then stop the task.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(Request::Shutdown).await
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Request(make(reply)))
            .map_err(|_| LinkError::ManagerStopped)?;
        rx.await.map_err(|_| LinkError::ManagerStopped)
    }
}

struct Actor {
    adapter: Arc<dyn RfcommAdapter>,
    config: LinkConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
    /// Weak so the task ends once every public handle is gone
    inbox: mpsc::WeakUnboundedSender<Message>,
    next_id: u64,
    establisher: Option<Establisher>,
    session: Option<LinkSession>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        info!("Connection manager started");

        while let Some(message) = rx.recv().await {
            match message {
                Message::Request(request) => {
                    if self.handle_request(request).await.is_break() {
                        break;
                    }
                }
                Message::Notice(notice) => self.handle_notice(notice).await,
            }
        }

        // no-op after an explicit shutdown
        self.teardown().await;
        info!("Connection manager stopped");
    }

    async fn handle_request(&mut self, request: Request) -> ControlFlow<()> {
        match request {
            Request::StartListening(reply) => {
                self.teardown().await;
                self.listen();
                let _ = reply.send(());
            }
            Request::ConnectTo {
                device,
                service_uuid,
                reply,
            } => {
                self.teardown().await;
                self.dial(device, service_uuid);
                let _ = reply.send(());
            }
            Request::Writer(reply) => {
                let writer = self
                    .session
                    .as_ref()
                    .filter(|s| s.is_open())
                    .map(LinkSession::writer);
                let _ = reply.send(writer);
            }
            Request::Disconnect(reply) => {
                self.teardown().await;
                if self.config.listen_after_disconnect {
                    self.listen();
                }
                let _ = reply.send(());
            }
            Request::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Request::Shutdown(reply) => {
                self.teardown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Establisher { id, report } => {
                if self.establisher.as_ref().map(Establisher::id) != Some(id) {
                    // superseded attempt; dropping the report releases its socket
                    debug!("Ignoring stale report from establisher {}: {:?}", id, report);
                    return;
                }
                self.on_establisher_report(report).await;
            }
            Notice::SessionClosed { id } => {
                if self.session.as_ref().map(LinkSession::id) != Some(id) {
                    debug!("Ignoring close of superseded session {}", id);
                    return;
                }

                info!("Session {} closed by remote side", id);
                self.close_session().await;
                if self.config.listen_after_disconnect {
                    self.listen();
                }
            }
        }
    }

    async fn on_establisher_report(&mut self, report: EstablisherReport) {
        match report {
            EstablisherReport::Listening => self.emit(LinkEvent::Listening),
            EstablisherReport::Established { stream, peer } => {
                if let Some(establisher) = self.establisher.take() {
                    let (id, role) = (establisher.id(), establisher.role());
                    establisher.cancel().await;
                    self.open_session(id, role, stream, peer).await;
                }
            }
            EstablisherReport::Failed(error) => {
                let role = self.establisher.take().map(|e| e.role());
                match (role, error) {
                    (_, LinkError::ConnectFailed { device, reason }) => {
                        self.emit(LinkEvent::ConnectFailed { device, reason })
                    }
                    (Some(SessionRole::Listener), e) => self.emit(LinkEvent::ListenFailed {
                        reason: e.to_string(),
                    }),
                    (_, e) => warn!("Establisher failed: {}", e),
                }
            }
        }
    }

    async fn open_session(
        &mut self,
        id: u64,
        role: SessionRole,
        stream: BoxedStream,
        peer: Option<RemoteDevice>,
    ) {
        self.close_session().await;

        let handshake = if self.config.skip_handshake {
            Handshake::pre_verified()
        } else {
            Handshake::new(self.config.handshake)
        };

        // announce before the read loop can deliver anything
        self.emit(LinkEvent::SessionOpened {
            role,
            peer: peer.clone(),
        });
        if self.config.skip_handshake {
            self.emit(LinkEvent::Connected);
        }

        let inbox = self.inbox.clone();
        let session = LinkSession::spawn(
            SessionInfo { id, role, peer },
            stream,
            handshake,
            SessionOptions {
                max_frame_len: self.config.max_frame_len,
            },
            self.events.clone(),
            move || {
                if let Some(tx) = inbox.upgrade() {
                    let _ = tx.send(Message::Notice(Notice::SessionClosed { id }));
                }
            },
        );
        self.session = Some(session);
    }

    fn listen(&mut self) {
        let id = self.next_id();
        let report = self.reporter(id);
        self.establisher = Some(Establisher::listen(
            id,
            self.adapter.clone(),
            self.config.service.clone(),
            report,
        ));
    }

    fn dial(&mut self, device: RemoteDevice, service_uuid: Uuid) {
        let id = self.next_id();
        let report = self.reporter(id);
        self.establisher = Some(Establisher::dial(
            id,
            self.adapter.clone(),
            device,
            service_uuid,
            report,
        ));
    }

    fn reporter(&self, id: u64) -> impl Fn(EstablisherReport) + Send + 'static {
        let inbox = self.inbox.clone();
        move |report| {
            if let Some(tx) = inbox.upgrade() {
                let _ = tx.send(Message::Notice(Notice::Establisher { id, report }));
            }
        }
    }

    /// Cancel the running establisher and close the session, waiting for both.
    async fn teardown(&mut self) {
        if let Some(establisher) = self.establisher.take() {
            establisher.cancel().await;
        }
        self.close_session().await;
    }

    async fn close_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
            self.emit(LinkEvent::Disconnected);
        }
    }

    fn status(&self) -> LinkStatus {
        LinkStatus {
            establishing: self.establisher.as_ref().map(Establisher::role),
            session: self.session.as_ref().map(LinkSession::role),
            peer: self.session.as_ref().and_then(|s| s.peer().cloned()),
            handshake: self
                .session
                .as_ref()
                .map(LinkSession::handshake_state)
                .unwrap_or_default(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn emit(&self, event: LinkEvent) {
        debug!("Link event: {:?}", event);
        let _ = self.events.send(event);
    }
}
