//! Bluetooth serial link to a Nixie clock.
//!
//! The [`ConnectionManager`] owns at most one RFCOMM session to the clock,
//! established either by listening for the clock to dial in or by dialing a
//! paired clock. It verifies the session with the clock's challenge exchange
//! and then forwards every received line to the application as a [`LinkEvent`].

pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod presentation;

pub use domain::commands::{LedConfig, OutgoingCommand};
pub use domain::models::{LinkEvent, LinkStatus, RemoteDevice};
pub use error::{LinkError, Result};
pub use infrastructure::bluetooth::{ConnectionManager, LinkConfig};
