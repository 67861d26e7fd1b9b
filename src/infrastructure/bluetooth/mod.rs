//! Bluetooth Module
//!
//! RFCOMM/SPP link to the Nixie clock.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ConnectionManager                      │
//! │  (owner task - public API for the application)           │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌─────────────┐ ┌────────────┐ ┌──────────────┐
//! │ Establisher │ │  Session   │ │  Transport   │
//! │             │ │            │ │              │
//! │ - Listener  │ │ - Frames   │ │ - WinRT      │
//! │ - Dialer    │ │ - Handshake│ │ - TCP bridge │
//! │             │ │ - Writes   │ │ - Loopback   │
//! └─────────────┘ └────────────┘ └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Service identity and framing constants
//! - [`frame_reader`] - LF-delimited frame extraction
//! - [`transport`] - Adapter traits and the TCP backend
//! - [`loopback`] - In-memory backend for tests and emulators
//! - [`establisher`] - Listener and dialer roles
//! - [`session`] - One open link: read loop and serialized writes
//! - [`service`] - Connection manager

pub mod establisher;
pub mod frame_reader;
pub mod loopback;
pub mod protocol;
pub mod service;
pub mod session;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::{ConnectionManager, LinkConfig};
pub use transport::{RfcommAdapter, TcpAdapter};
#[cfg(windows)]
pub use winrt::WinRtAdapter;
