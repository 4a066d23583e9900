//! uTP (Micro Transport Protocol, BEP 29) over a shared UDP socket.
//!
//! The module splits the way the protocol splits:
//!
//! - [`packet`]: the 20-byte wire header and its (de)serialization.
//! - [`extensions`]: the extension chain (selective ACK, window scaling,
//!   ECN) carried between the header and the payload.
//! - [`seq`]: 16-bit wrap-around sequence arithmetic. The single place
//!   where sequence numbers are compared.
//! - [`congestion`]: the LEDBAT window and AIMD rate controllers.
//! - [`connection`]: one connection — handshake state machine,
//!   reliability engine (ACK, SACK, retransmission, RTT estimation) and
//!   the byte-stream facade handed to peer sessions.
//! - [`mux`]: the socket multiplexer fronting every connection sharing
//!   one UDP socket, including passive accepts and connection-id
//!   allocation.
pub mod congestion;
pub mod connection;
pub mod error;
pub mod extensions;
pub mod mux;
pub mod packet;
pub mod seq;

pub use connection::{Connection, ConnectionState};
pub use error::Error;
pub use mux::UtpSocketMux;

pub const UTP_TRANSPORT_LOG_TARGET: &str = "UTP TRANSPORT";

/// Largest datagram the receive loop accepts. uTP packets are bounded by
/// the configured MTU, which is well below this; the headroom only
/// protects against peers with a larger MTU than ours.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// This code needs to be copied into each crate.
/// Working version, for production.
#[cfg(not(test))]
pub(crate) type CurrentClock = torrkit_clock::clock::Working;

/// Stopped version, for testing.
#[cfg(test)]
pub(crate) type CurrentClock = torrkit_clock::clock::Stopped;
