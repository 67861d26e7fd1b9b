//! Post-connect verification exchange
//!
//! ```text
//!   Idle ──REQ_CHECK_1 / send REQ_CONN──► AwaitingVerification
//!   AwaitingVerification ──CONN_FAIL / send REQ_CONN──► AwaitingVerification
//!   AwaitingVerification ──CONN_PASS / Connected──► Verified
//! ```
//!
//! The machine does no I/O. Each inbound frame yields a list of actions the
//! session carries out in order.

use crate::domain::commands::OutgoingCommand;
use crate::domain::models::{Frame, HandshakeState, LinkEvent};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Verification challenge sent by the clock
pub const CHALLENGE: &str = "REQ_CHECK_1";
/// Clock accepted the reply
pub const PASS: &str = "CONN_PASS";
/// Clock rejected the reply and expects another
pub const FAIL: &str = "CONN_FAIL";

/// Retry behaviour on `CONN_FAIL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakePolicy {
    /// `None` retries forever
    pub max_retries: Option<u32>,
    /// Pause before each retry reply
    pub retry_delay: Duration,
}

/// Something the session must do in response to a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Write `command` after waiting `delay`
    Send {
        command: OutgoingCommand,
        delay: Duration,
    },
    /// Deliver an event to the application
    Emit(LinkEvent),
}

impl HandshakeAction {
    fn reply() -> Self {
        Self::Send {
            command: OutgoingCommand::HandshakeReply,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Handshake {
    state: HandshakeState,
    policy: HandshakePolicy,
    retries: u32,
}

impl Handshake {
    pub fn new(policy: HandshakePolicy) -> Self {
        Self {
            state: HandshakeState::Idle,
            policy,
            retries: 0,
        }
    }

    /// A machine that starts out verified, for links configured to skip the exchange.
    pub fn pre_verified() -> Self {
        Self {
            state: HandshakeState::Verified,
            policy: HandshakePolicy::default(),
            retries: 0,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_verified(&self) -> bool {
        self.state == HandshakeState::Verified
    }

    /// Number of `CONN_FAIL` retries sent so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Feed one inbound frame.
    pub fn on_frame(&mut self, frame: Frame) -> Vec<HandshakeAction> {
        match self.state {
            HandshakeState::Verified => {
                vec![HandshakeAction::Emit(LinkEvent::IncomingMessage(frame))]
            }
            HandshakeState::Failed => vec![HandshakeAction::Emit(LinkEvent::UnknownFrame(frame))],
            HandshakeState::Idle => {
                if frame.matches(CHALLENGE) {
                    debug!("Verification challenge received");
                    self.state = HandshakeState::AwaitingVerification;
                    vec![HandshakeAction::reply()]
                } else {
                    vec![HandshakeAction::Emit(LinkEvent::UnknownFrame(frame))]
                }
            }
            HandshakeState::AwaitingVerification => {
                if frame.matches(PASS) {
                    info!("Handshake verified after {} retries", self.retries);
                    self.state = HandshakeState::Verified;
                    vec![HandshakeAction::Emit(LinkEvent::Connected)]
                } else if frame.matches(FAIL) {
                    self.on_fail()
                } else if frame.matches(CHALLENGE) {
                    debug!("Repeated challenge, answering again");
                    vec![HandshakeAction::reply()]
                } else {
                    vec![HandshakeAction::Emit(LinkEvent::UnknownFrame(frame))]
                }
            }
        }
    }

    fn on_fail(&mut self) -> Vec<HandshakeAction> {
        if let Some(max) = self.policy.max_retries {
            if self.retries >= max {
                warn!("Handshake rejected {} times, giving up", self.retries + 1);
                self.state = HandshakeState::Failed;
                return vec![HandshakeAction::Emit(LinkEvent::HandshakeError {
                    attempts: self.retries + 1,
                })];
            }
        }

        self.retries += 1;
        warn!("Handshake rejected, retry {}", self.retries);
        vec![
            HandshakeAction::Emit(LinkEvent::HandshakeFailedRetrying {
                attempt: self.retries,
            }),
            HandshakeAction::Send {
                command: OutgoingCommand::HandshakeReply,
                delay: self.policy.retry_delay,
            },
        ]
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(HandshakePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(handshake: &mut Handshake, frames: &[&'static str]) -> Vec<HandshakeAction> {
        frames
            .iter()
            .flat_map(|f| handshake.on_frame(Frame::from(*f)))
            .collect()
    }

    fn replies(actions: &[HandshakeAction]) -> usize {
        actions
            .iter()
            .filter(|a| {
                matches!(
                    a,
                    HandshakeAction::Send {
                        command: OutgoingCommand::HandshakeReply,
                        ..
                    }
                )
            })
            .count()
    }

    fn connected(actions: &[HandshakeAction]) -> usize {
        actions
            .iter()
            .filter(|a| **a == HandshakeAction::Emit(LinkEvent::Connected))
            .count()
    }

    #[test]
    fn test_challenge_sends_one_reply() {
        let mut hs = Handshake::default();
        let actions = run(&mut hs, &[CHALLENGE]);
        assert_eq!(replies(&actions), 1);
        assert_eq!(hs.state(), HandshakeState::AwaitingVerification);
    }

    #[test]
    fn test_challenge_then_pass_verifies() {
        let mut hs = Handshake::default();
        let actions = run(&mut hs, &[CHALLENGE, PASS]);
        assert_eq!(hs.state(), HandshakeState::Verified);
        assert_eq!(connected(&actions), 1);
    }

    #[test]
    fn test_two_failures_two_retries() {
        let mut hs = Handshake::default();
        let actions = run(&mut hs, &[CHALLENGE, FAIL, FAIL, PASS]);
        assert_eq!(replies(&actions), 3);
        assert_eq!(hs.retries(), 2);
        assert_eq!(hs.state(), HandshakeState::Verified);
        assert_eq!(connected(&actions), 1);

        let retrying: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                HandshakeAction::Emit(LinkEvent::HandshakeFailedRetrying { attempt }) => {
                    Some(*attempt)
                }
                _ => None,
            })
            .collect();
        assert_eq!(retrying, vec![1, 2]);
    }

    #[test]
    fn test_unknown_frames_leave_state() {
        let mut hs = Handshake::default();
        let actions = run(&mut hs, &["hello", PASS]);
        assert_eq!(hs.state(), HandshakeState::Idle);
        assert_eq!(
            actions,
            vec![
                HandshakeAction::Emit(LinkEvent::UnknownFrame(Frame::from("hello"))),
                HandshakeAction::Emit(LinkEvent::UnknownFrame(Frame::from(PASS))),
            ]
        );

        run(&mut hs, &[CHALLENGE]);
        let actions = run(&mut hs, &["CONN_"]);
        assert_eq!(hs.state(), HandshakeState::AwaitingVerification);
        assert_eq!(
            actions,
            vec![HandshakeAction::Emit(LinkEvent::UnknownFrame(Frame::from("CONN_")))]
        );
    }

    #[test]
    fn test_verified_forwards_everything() {
        let mut hs = Handshake::default();
        run(&mut hs, &[CHALLENGE, PASS]);
        let actions = run(&mut hs, &["TEMP:23", FAIL]);
        assert_eq!(
            actions,
            vec![
                HandshakeAction::Emit(LinkEvent::IncomingMessage(Frame::from("TEMP:23"))),
                HandshakeAction::Emit(LinkEvent::IncomingMessage(Frame::from(FAIL))),
            ]
        );
        assert!(hs.is_verified());
    }

    #[test]
    fn test_trailing_carriage_return_tolerated() {
        let mut hs = Handshake::default();
        run(&mut hs, &["REQ_CHECK_1\r", "CONN_PASS\r"]);
        assert!(hs.is_verified());
    }

    #[test]
    fn test_bounded_retries_fail() {
        let mut hs = Handshake::new(HandshakePolicy {
            max_retries: Some(1),
            retry_delay: Duration::from_millis(250),
        });
        let actions = run(&mut hs, &[CHALLENGE, FAIL]);
        assert!(actions.contains(&HandshakeAction::Send {
            command: OutgoingCommand::HandshakeReply,
            delay: Duration::from_millis(250),
        }));

        let actions = run(&mut hs, &[FAIL]);
        assert_eq!(hs.state(), HandshakeState::Failed);
        assert_eq!(
            actions,
            vec![HandshakeAction::Emit(LinkEvent::HandshakeError { attempts: 2 })]
        );

        let actions = run(&mut hs, &[PASS]);
        assert_eq!(hs.state(), HandshakeState::Failed);
        assert_eq!(
            actions,
            vec![HandshakeAction::Emit(LinkEvent::UnknownFrame(Frame::from(PASS)))]
        );
    }

    #[test]
    fn test_pre_verified_forwards_immediately() {
        let mut hs = Handshake::pre_verified();
        let actions = run(&mut hs, &[CHALLENGE]);
        assert_eq!(
            actions,
            vec![HandshakeAction::Emit(LinkEvent::IncomingMessage(Frame::from(CHALLENGE)))]
        );
    }
}
