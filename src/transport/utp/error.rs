//! Error types for the uTP transport.
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use super::connection::ConnectionState;

/// Error returned by the uTP transport.
#[derive(Error, Debug)]
pub enum Error {
    /// A wire field violated its declared range while encoding a packet.
    #[error("invalid wire field {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },

    /// The input was too short to contain the fixed packet header.
    #[error("truncated packet: {len} bytes, the fixed header needs {expected}")]
    Truncated { len: usize, expected: usize },

    /// The extension chain could not be fully decoded. The packet body
    /// is still delivered; this error only surfaces in logs.
    #[error("malformed extension chain at offset {offset}")]
    MalformedExtension { offset: usize },

    /// The handshake or another operation exceeded its deadline.
    #[error("operation timed out after {after:?}")]
    Timeout { after: Duration },

    /// A packet exhausted its retransmission budget; the connection is
    /// terminated.
    #[error("packet seq {seq} exceeded {max} retransmits")]
    MaxRetransmits { seq: u16, max: u32 },

    /// The peer reset the connection or the local side tore it down.
    #[error("connection reset by {addr}")]
    Reset { addr: SocketAddr },

    /// A send or receive was attempted on a connection that is not in
    /// the `Connected` state.
    #[error("connection is not connected (state: {state})")]
    NotConnected { state: ConnectionState },

    /// The multiplexer could not allocate an unused connection id.
    #[error("no free connection id after {attempts} attempts")]
    NoFreeId { attempts: u32 },

    /// An error from the underlying UDP socket.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}
