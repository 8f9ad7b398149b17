//! # Device to Device Communication
//!
//! Protocol core shared by every comms backend of the console:
//!
//! - **Message Catalog**: fixed 32-byte packets with explicit wire layout
//! - **Transceiver**: framing and link acknowledgement over a [`Hardware`] backend
//! - **Connections**: reliable byte streams multiplexed over one transceiver
//! - **Controller**: connection manager driving everything from a periodic tick
//!
//! ## Architecture
//!
//! ```text
//!  application ──► Connection ──┐                       ┌──► transmit()
//!                  (tx buffer)   │                       │
//!                                ├──► Controller ──► Transceiver ──► Hardware
//!                                │    (outbox)       (1 acked msg)   │
//!  application ◄── Connection ◄──┘                       └─── receive()
//!                  (rx buffer)
//! ```
//!
//! ## Scheduling
//!
//! The core is single threaded and never blocks. All progress happens in
//! [`Controller::tick`], which the application calls periodically. Only the
//! ring buffer indices are atomic so that an interrupt handler can feed a
//! [`RingBuffer`] while the main loop drains it.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod buffer;
pub mod connection;
pub mod controller;
pub mod protocol;
pub mod traits;
pub mod transceiver;

pub use buffer::RingBuffer;
pub use connection::{Connection, ConnectionError, ConnectionId, State};
pub use controller::{CommsError, Controller, ControllerConfig, ControllerEvent, LinkStats};
pub use protocol::{DecodeError, DeviceId, Message, MessageId, Packet, BROADCAST_ID, PACKET_SIZE};
pub use traits::{Clock, Frame, Hardware};
pub use transceiver::{Ack, Event, Transceiver};

/// Library version for protocol compatibility checks
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
