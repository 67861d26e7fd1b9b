//! Link Session Module
//!
//! Owns one open socket. A spawned read loop turns inbound bytes into
//! frames, runs them through the handshake, and forwards the resulting
//! events in arrival order. Writes are serialized through one lock so
//! frames never interleave on the wire.
//!
//! Closing never waits on a write: the close signal fires first, which
//! fails any write still blocked on a full socket and frees the lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::frame_reader::FrameReader;
use super::protocol::FRAME_DELIMITER;
use super::transport::BoxedStream;
use crate::domain::commands::OutgoingCommand;
use crate::domain::handshake::{Handshake, HandshakeAction};
use crate::domain::models::{HandshakeState, LinkEvent, RemoteDevice, SessionRole};
use crate::error::{LinkError, Result};

type SharedWriter = Arc<Mutex<Option<WriteHalf<BoxedStream>>>>;

/// `true` once the session is closing or closed.
type CloseSignal = Arc<watch::Sender<bool>>;

/// How long `close` lets the write half shut down before dropping it.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// Who the session talks to.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub role: SessionRole,
    pub peer: Option<RemoteDevice>,
}

/// Per-session knobs.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub max_frame_len: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_frame_len: super::protocol::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// One live link to the clock.
pub struct LinkSession {
    info: SessionInfo,
    writer: SharedWriter,
    closed: CloseSignal,
    handshake: watch::Receiver<HandshakeState>,
    reader: Option<JoinHandle<()>>,
}

impl LinkSession {
    /// Take ownership of `stream` and start the read loop.
    ///
    /// `on_closed` runs once if the read loop ends on its own (peer hangup
    /// or I/O error). It does not run when the session is closed with
    /// [`LinkSession::close`].
    pub fn spawn<F>(
        info: SessionInfo,
        stream: BoxedStream,
        handshake: Handshake,
        options: SessionOptions,
        events: mpsc::UnboundedSender<LinkEvent>,
        on_closed: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(Mutex::new(Some(write_half)));
        let closed: CloseSignal = Arc::new(watch::channel(false).0);
        let (state_tx, state_rx) = watch::channel(handshake.state());

        let read_loop = ReadLoop {
            id: info.id,
            reader: FrameReader::with_max_frame_len(read_half, options.max_frame_len),
            handshake,
            writer: writer.clone(),
            closed: closed.clone(),
            state: state_tx,
            events,
        };
        let task = tokio::spawn(read_loop.run(on_closed));

        info!("Session {} opened ({})", info.id, info.role);

        Self {
            info,
            writer,
            closed,
            handshake: state_rx,
            reader: Some(task),
        }
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn role(&self) -> SessionRole {
        self.info.role
    }

    pub fn peer(&self) -> Option<&RemoteDevice> {
        self.info.peer.as_ref()
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        *self.handshake.borrow()
    }

    /// Encode `command` and write it as one LF-terminated frame.
    pub async fn write(&self, command: &OutgoingCommand) -> Result<()> {
        self.writer().write(command).await
    }

    /// A handle that writes to this session without borrowing it.
    pub fn writer(&self) -> SessionWriter {
        SessionWriter {
            session_id: self.info.id,
            writer: self.writer.clone(),
            closed: self.closed.clone(),
        }
    }

    /// Stop the read loop and release the socket.
    ///
    /// Any write blocked on the socket fails with [`LinkError::Write`].
    /// Returns once the read loop has finished; afterwards writes fail.
    pub async fn close(&mut self) {
        self.closed.send_replace(true);

        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }

        if let Some(mut half) = self.writer.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, half.shutdown())
                .await
                .is_err()
            {
                debug!("Session {} shutdown timed out, dropping socket", self.info.id);
            }
        }

        debug!("Session {} closed", self.info.id);
    }
}

/// Write access to one session.
///
/// Writes are serialized. Closing the session fails a write that is still
/// waiting on the socket; writes after that fail at once.
#[derive(Clone)]
pub struct SessionWriter {
    session_id: u64,
    writer: SharedWriter,
    closed: CloseSignal,
}

impl SessionWriter {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub async fn write(&self, command: &OutgoingCommand) -> Result<()> {
        if *self.closed.borrow() {
            return Err(session_closed());
        }
        write_frame(&self.writer, &self.closed, command).await
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        self.closed.send_replace(true);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn session_closed() -> LinkError {
    LinkError::Write("session closed".to_string())
}

async fn write_frame(
    writer: &SharedWriter,
    closed: &CloseSignal,
    command: &OutgoingCommand,
) -> Result<()> {
    let mut bytes = command.encode()?;
    bytes.push(FRAME_DELIMITER);

    let mut closing = closed.subscribe();
    let send = async {
        let mut guard = writer.lock().await;
        let half = guard.as_mut().ok_or_else(session_closed)?;
        half.write_all(&bytes)
            .await
            .map_err(|e| LinkError::Write(e.to_string()))?;
        half.flush()
            .await
            .map_err(|e| LinkError::Write(e.to_string()))
    };

    tokio::select! {
        result = send => result?,
        _ = closing.wait_for(|closed| *closed) => return Err(session_closed()),
    }

    trace!("Sent {}", command);
    Ok(())
}

struct ReadLoop {
    id: u64,
    reader: FrameReader<ReadHalf<BoxedStream>>,
    handshake: Handshake,
    writer: SharedWriter,
    closed: CloseSignal,
    state: watch::Sender<HandshakeState>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl ReadLoop {
    async fn run<F>(mut self, on_closed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        loop {
            let frame = match self.reader.next_frame().await {
                Ok(frame) => frame,
                Err(e) => {
                    info!("Session {} read loop ended: {}", self.id, e);
                    break;
                }
            };
            debug!("Session {} received {:?}", self.id, frame);

            let actions = self.handshake.on_frame(frame);
            self.state.send_replace(self.handshake.state());

            for action in actions {
                match action {
                    HandshakeAction::Emit(event) => {
                        let _ = self.events.send(event);
                    }
                    HandshakeAction::Send { command, delay } => {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        if let Err(e) = write_frame(&self.writer, &self.closed, &command).await {
                            warn!("Session {} could not send {}: {}", self.id, command, e);
                        }
                    }
                }
            }
        }

        self.closed.send_replace(true);
        self.writer.lock().await.take();
        on_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Frame;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn start(
        handshake: Handshake,
    ) -> (
        LinkSession,
        DuplexStream,
        mpsc::UnboundedReceiver<LinkEvent>,
        tokio::sync::oneshot::Receiver<()>,
    ) {
        let (near, far) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        let info = SessionInfo {
            id: 1,
            role: SessionRole::Dialer,
            peer: None,
        };
        let session = LinkSession::spawn(
            info,
            Box::new(near),
            handshake,
            SessionOptions::default(),
            tx,
            move || {
                let _ = closed_tx.send(());
            },
        );
        (session, far, rx, closed_rx)
    }

    async fn read_line(stream: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                return String::from_utf8(out).unwrap();
            }
            out.push(byte[0]);
        }
    }

    #[tokio::test]
    async fn test_handshake_over_split_chunks() {
        let (session, mut clock, mut events, _closed) = start(Handshake::default());

        clock.write_all(b"REQ_CH").await.unwrap();
        clock.write_all(b"ECK_1\n").await.unwrap();
        assert_eq!(read_line(&mut clock).await, "REQ_CONN");

        clock.write_all(b"CONN_PASS\nhello\n").await.unwrap();
        assert_eq!(events.recv().await, Some(LinkEvent::Connected));
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::IncomingMessage(Frame::from("hello")))
        );
        assert_eq!(session.handshake_state(), HandshakeState::Verified);
    }

    #[tokio::test]
    async fn test_write_appends_delimiter() {
        let (session, mut clock, _events, _closed) = start(Handshake::pre_verified());
        session
            .write(&OutgoingCommand::TimeSet { hour: 9, min: 3, sec: 0 })
            .await
            .unwrap();
        assert_eq!(read_line(&mut clock).await, "T:9:3:0");
    }

    #[tokio::test]
    async fn test_invalid_command_never_reaches_wire() {
        let (session, _clock, _events, _closed) = start(Handshake::pre_verified());
        let result = session
            .write(&OutgoingCommand::CountdownSet { hour: 120, min: 0, sec: 0 })
            .await;
        assert!(matches!(result, Err(LinkError::InvalidCommand(_))));
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_peer_hangup_reports_closed() {
        let (session, clock, _events, closed) = start(Handshake::default());
        drop(clock);

        closed.await.unwrap();
        assert!(!session.is_open());
        let result = session.write(&OutgoingCommand::HandshakeReply).await;
        assert!(matches!(result, Err(LinkError::Write(_))));
    }

    #[tokio::test]
    async fn test_close_releases_socket() {
        let (mut session, mut clock, _events, closed) = start(Handshake::default());
        session.close().await;
        assert!(!session.is_open());

        // far end observes EOF once both halves are gone
        let mut buf = [0u8; 1];
        assert_eq!(clock.read(&mut buf).await.unwrap(), 0);

        // explicit close does not report to the owner
        assert!(closed.await.is_err());
        assert!(matches!(
            session.write(&OutgoingCommand::HandshakeReply).await,
            Err(LinkError::Write(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_writes_do_not_interleave() {
        let (session, mut clock, _events, _closed) = start(Handshake::pre_verified());
        let session = Arc::new(session);

        let mut tasks = Vec::new();
        for hour in 0..20u8 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                session
                    .write(&OutgoingCommand::CountdownSet { hour, min: 59, sec: 59 })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..20 {
            let line = read_line(&mut clock).await;
            let command: OutgoingCommand = line.parse().unwrap();
            seen.push(command);
        }
        assert_eq!(seen.len(), 20);
    }

    #[tokio::test]
    async fn test_writer_handle_fails_after_close() {
        let (mut session, _clock, _events, _closed) = start(Handshake::pre_verified());
        let writer = session.writer();
        assert_eq!(writer.session_id(), 1);
        writer.write(&OutgoingCommand::HandshakeReply).await.unwrap();

        session.close().await;
        assert!(matches!(
            writer.write(&OutgoingCommand::HandshakeReply).await,
            Err(LinkError::Write(_))
        ));
    }

    #[tokio::test]
    async fn test_close_fails_write_blocked_on_full_socket() {
        let (mut session, _clock, _events, _closed) = start(Handshake::pre_verified());
        let writer = session.writer();

        // the clock never reads, so the pipe fills and a write parks
        let stuck = tokio::spawn(async move {
            loop {
                if let Err(e) = writer
                    .write(&OutgoingCommand::TimeSet { hour: 23, min: 59, sec: 59 })
                    .await
                {
                    return e;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!stuck.is_finished());

        tokio::time::timeout(Duration::from_secs(5), session.close())
            .await
            .expect("close blocked behind a pending write");
        let error = tokio::time::timeout(Duration::from_secs(5), stuck)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(error, LinkError::Write(_)));
        assert!(!session.is_open());
    }
}
