use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A paired clock the link can dial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteDevice {
    /// Bluetooth address in `AA:BB:CC:DD:EE:FF` form (or `host:port` for the TCP bridge)
    pub address: String,
    pub name: String,
}

impl RemoteDevice {
    pub fn new(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
        }
    }

    /// Parse the address as a 48-bit Bluetooth address.
    ///
    /// Accepts colon or dash separated hex octets, most significant first.
    pub fn bluetooth_address(&self) -> Option<u64> {
        let octets: Vec<&str> = self.address.split(|c| c == ':' || c == '-').collect();
        if octets.len() != 6 {
            return None;
        }

        octets.iter().try_fold(0u64, |acc, octet| {
            if octet.len() != 2 {
                return None;
            }
            u8::from_str_radix(octet, 16)
                .ok()
                .map(|b| (acc << 8) | b as u64)
        })
    }
}

impl fmt::Display for RemoteDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} ({})", self.name, self.address)
        }
    }
}

/// One LF-delimited protocol message, without its terminator.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Frame(Bytes);

impl Frame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy text view; the protocol is plain ASCII.
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    /// True when the frame starts with `literal`.
    ///
    /// The clock is matched on its leading characters, so trailing bytes
    /// such as a CR from the serial module do not break recognition.
    pub fn matches(&self, literal: &str) -> bool {
        self.0.starts_with(literal.as_bytes())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:?})", self.to_text())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl From<&'static str> for Frame {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Frame {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

/// How a session came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    Listener,
    Dialer,
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listener => f.write_str("listener"),
            Self::Dialer => f.write_str("dialer"),
        }
    }
}

/// Progress of the post-connect verification exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    Idle,
    AwaitingVerification,
    Verified,
    Failed,
}

/// Events the link pushes to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A listener is waiting for the clock to dial in.
    Listening,
    /// The listener could not be opened or its accept failed.
    ListenFailed { reason: String },
    /// A socket is open; the handshake has not necessarily completed.
    SessionOpened {
        role: SessionRole,
        peer: Option<RemoteDevice>,
    },
    /// The handshake completed (or was skipped).
    Connected,
    /// The open session went away.
    Disconnected,
    /// The clock answered `CONN_FAIL` and the reply was sent again.
    HandshakeFailedRetrying { attempt: u32 },
    /// The configured retry ceiling was exceeded.
    HandshakeError { attempts: u32 },
    /// An outbound connection attempt failed.
    ConnectFailed { device: RemoteDevice, reason: String },
    /// A frame that means nothing to the handshake while unverified.
    UnknownFrame(Frame),
    /// A frame received after verification.
    IncomingMessage(Frame),
}

/// Snapshot of the connection manager for display.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkStatus {
    /// Role of the establisher currently running, if any
    pub establishing: Option<SessionRole>,
    /// Role of the open session, if any
    pub session: Option<SessionRole>,
    pub peer: Option<RemoteDevice>,
    pub handshake: HandshakeState,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.session.is_some() && self.handshake == HandshakeState::Verified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bluetooth_address_parsing() {
        let device = RemoteDevice::new("00:21:13:01:A2:FF", "HC-05");
        assert_eq!(device.bluetooth_address(), Some(0x0021_1301_A2FF));

        let dashed = RemoteDevice::new("00-21-13-01-a2-ff", "");
        assert_eq!(dashed.bluetooth_address(), Some(0x0021_1301_A2FF));

        assert_eq!(RemoteDevice::new("127.0.0.1:7000", "").bluetooth_address(), None);
        assert_eq!(RemoteDevice::new("00:21:13:01:A2", "").bluetooth_address(), None);
        assert_eq!(RemoteDevice::new("00:21:13:01:A2:FFF", "").bluetooth_address(), None);
    }

    #[test]
    fn test_frame_prefix_match() {
        let frame = Frame::from("CONN_PASS\r");
        assert!(frame.matches("CONN_PASS"));
        assert!(!Frame::from("CONN_PA").matches("CONN_PASS"));
        assert_eq!(frame.to_text(), "CONN_PASS\r");
    }
}
