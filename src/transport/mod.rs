//! Transports peers are reached over.
//!
//! The only transport implemented today is uTP (BEP 29), a reliable,
//! ordered, congestion-controlled byte stream on top of UDP. TCP peers
//! are handled by the standard library stream types directly and need no
//! module here.
pub mod utp;
