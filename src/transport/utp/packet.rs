//! The uTP packet header and its wire (de)serialization.
//!
//! A packet is a 20-byte big-endian header, an optional extension chain
//! and the payload:
//!
//! ```text
//! +---------------+---------------+---------------+---------------+
//! | type|ver (1B) | first_ext (1B)|       connection_id (2B)      |
//! +---------------+---------------+-------------------------------+
//! |         sequence_nr (2B)      |      acknowledgement_nr (2B)  |
//! +-------------------------------+-------------------------------+
//! |                     advertised_window (4B)                    |
//! +---------------------------------------------------------------+
//! |                        timestamp_us (4B)                      |
//! +---------------------------------------------------------------+
//! |                  timestamp_difference_us (4B)                 |
//! +---------------------------------------------------------------+
//! ```
//!
//! The upper nibble of the first byte is the packet type, the lower
//! nibble the protocol version (always 1). `first_ext` names the type of
//! the first extension record, or zero when no chain follows.
use tracing::debug;

use super::error::Error;
use super::extensions::{self, Extension};
use super::UTP_TRANSPORT_LOG_TARGET;

/// Size of the fixed header on the wire.
pub const HEADER_SIZE: usize = 20;

/// The protocol version carried in the low nibble of the first byte.
pub const PROTOCOL_VERSION: u8 = 1;

/// uTP packet types (BEP 29).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Regular data packet with a payload.
    Data = 0,
    /// Finalize the connection; the last packet of the stream.
    Fin = 1,
    /// State packet: an ACK with no payload.
    State = 2,
    /// Terminate the connection forcefully.
    Reset = 3,
    /// Initiate a connection.
    Syn = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Fin),
            2 => Ok(PacketType::State),
            3 => Ok(PacketType::Reset),
            4 => Ok(PacketType::Syn),
            other => Err(Error::InvalidField {
                field: "packet type",
                value: u64::from(other),
            }),
        }
    }
}

/// A parsed (or to-be-sent) uTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub connection_id: u16,
    pub seq_nr: u16,
    pub ack_nr: u16,
    /// Receive window the sender advertises, in (possibly scaled) bytes.
    pub wnd_size: u32,
    /// Microseconds since the sender's connection epoch, wrapped to 32 bits.
    pub timestamp_micros: u32,
    /// The sender's measured one-way delay, in microseconds.
    pub timestamp_difference_micros: u32,
    pub extensions: Vec<Extension>,
    pub payload: Vec<u8>,
}

impl Packet {
    /// A bare packet of the given type with every numeric field zeroed.
    #[must_use]
    pub fn new(packet_type: PacketType, connection_id: u16) -> Packet {
        Packet {
            packet_type,
            connection_id,
            seq_nr: 0,
            ack_nr: 0,
            wnd_size: 0,
            timestamp_micros: 0,
            timestamp_difference_micros: 0,
            extensions: Vec::new(),
            payload: Vec::new(),
        }
    }

    /// Serializes the packet: header, extension chain, payload.
    ///
    /// # Errors
    ///
    /// Will return `Error::InvalidField` if an extension field violates
    /// its declared range. Header fields are range-safe by construction.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let chain = extensions::encode_chain(&self.extensions)?;

        let first_ext = self
            .extensions
            .first()
            .map_or(extensions::EXTENSION_NONE, Extension::extension_type);

        let mut bytes = Vec::with_capacity(HEADER_SIZE + chain.len() + self.payload.len());
        bytes.push((self.packet_type as u8) << 4 | PROTOCOL_VERSION);
        bytes.push(first_ext);
        bytes.extend_from_slice(&self.connection_id.to_be_bytes());
        bytes.extend_from_slice(&self.seq_nr.to_be_bytes());
        bytes.extend_from_slice(&self.ack_nr.to_be_bytes());
        bytes.extend_from_slice(&self.wnd_size.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp_micros.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp_difference_micros.to_be_bytes());
        bytes.extend_from_slice(&chain);
        bytes.extend_from_slice(&self.payload);

        Ok(bytes)
    }

    /// Deserializes a packet from a datagram.
    ///
    /// A malformed extension chain does not fail the decode: the chain
    /// is dropped at the malformed record and the rest of the datagram
    /// is delivered as payload, matching the recovery policy for
    /// wire-level anomalies.
    ///
    /// # Errors
    ///
    /// Will return `Error::Truncated` if the datagram is smaller than
    /// the fixed header, or `Error::InvalidField` for an unknown packet
    /// type nibble.
    pub fn decode(data: &[u8]) -> Result<Packet, Error> {
        if data.len() < HEADER_SIZE {
            return Err(Error::Truncated {
                len: data.len(),
                expected: HEADER_SIZE,
            });
        }

        let packet_type = PacketType::try_from(data[0] >> 4)?;
        let version = data[0] & 0x0F;
        if version != PROTOCOL_VERSION {
            // Recovered locally: the header is otherwise parseable.
            debug!(target: UTP_TRANSPORT_LOG_TARGET, version, "unexpected uTP version nibble");
        }

        let first_ext = data[1];
        let connection_id = u16::from_be_bytes([data[2], data[3]]);
        let seq_nr = u16::from_be_bytes([data[4], data[5]]);
        let ack_nr = u16::from_be_bytes([data[6], data[7]]);
        let wnd_size = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let timestamp_micros = u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
        let timestamp_difference_micros = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);

        let (extensions, body_offset) = if first_ext == extensions::EXTENSION_NONE {
            (Vec::new(), HEADER_SIZE)
        } else {
            let parsed = extensions::parse_chain(data, HEADER_SIZE);
            if parsed.malformed {
                debug!(
                    target: UTP_TRANSPORT_LOG_TARGET,
                    offset = parsed.body_offset,
                    "malformed extension chain, delivering packet without the rest of it"
                );
            }
            (parsed.extensions, parsed.body_offset)
        };

        Ok(Packet {
            packet_type,
            connection_id,
            seq_nr,
            ack_nr,
            wnd_size,
            timestamp_micros,
            timestamp_difference_micros,
            extensions,
            payload: data[body_offset..].to_vec(),
        })
    }

    /// Reads the connection id out of a raw datagram without a full
    /// decode. The multiplexer routes on this before parsing.
    #[must_use]
    pub fn peek_connection_id(data: &[u8]) -> Option<u16> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        Some(u16::from_be_bytes([data[2], data[3]]))
    }

    /// Reads the packet type nibble out of a raw datagram.
    #[must_use]
    pub fn peek_packet_type(data: &[u8]) -> Option<PacketType> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        PacketType::try_from(data[0] >> 4).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::{Packet, PacketType, HEADER_SIZE};
    use crate::transport::utp::error::Error;
    use crate::transport::utp::extensions::{Extension, SackBlock};

    fn sample_packet() -> Packet {
        Packet {
            packet_type: PacketType::Data,
            connection_id: 0x1234,
            seq_nr: 42,
            ack_nr: 41,
            wnd_size: 65535,
            timestamp_micros: 1_000_000,
            timestamp_difference_micros: 500,
            extensions: Vec::new(),
            payload: b"hello swarm".to_vec(),
        }
    }

    #[test]
    fn it_should_round_trip_a_plain_data_packet() {
        let packet = sample_packet();

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();

        assert_eq!(decoded, packet);
    }

    #[test]
    fn it_should_round_trip_every_packet_type() {
        for packet_type in [
            PacketType::Data,
            PacketType::Fin,
            PacketType::State,
            PacketType::Reset,
            PacketType::Syn,
        ] {
            let mut packet = sample_packet();
            packet.packet_type = packet_type;
            packet.payload.clear();

            let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();

            assert_eq!(decoded.packet_type, packet_type);
        }
    }

    #[test]
    fn it_should_round_trip_the_extension_chain() {
        let mut packet = sample_packet();
        packet.extensions = vec![
            Extension::SelectiveAck {
                blocks: vec![SackBlock { start: 44, end: 46 }],
            },
            Extension::WindowScale { shift: 2 },
            Extension::Ecn {
                echo: true,
                cwr: false,
            },
        ];

        let bytes = packet.encode().unwrap();
        // The first-extension byte names the head of the chain.
        assert_eq!(bytes[1], 1);

        let decoded = Packet::decode(&bytes).unwrap();

        assert_eq!(decoded, packet);
    }

    #[test]
    fn it_should_pack_type_and_version_into_one_byte() {
        let mut packet = sample_packet();
        packet.packet_type = PacketType::Syn;

        let bytes = packet.encode().unwrap();

        assert_eq!(bytes[0] >> 4, 4);
        assert_eq!(bytes[0] & 0x0F, 1);
    }

    #[test]
    fn it_should_fail_decoding_a_truncated_header() {
        let result = Packet::decode(&[0u8; HEADER_SIZE - 1]);

        assert!(matches!(
            result.unwrap_err(),
            Error::Truncated {
                len: 19,
                expected: HEADER_SIZE
            }
        ));
    }

    #[test]
    fn it_should_fail_decoding_an_unknown_packet_type() {
        let mut bytes = sample_packet().encode().unwrap();
        bytes[0] = 0x5 << 4 | 1; // type nibble 5 does not exist

        assert!(matches!(
            Packet::decode(&bytes).unwrap_err(),
            Error::InvalidField {
                field: "packet type",
                value: 5
            }
        ));
    }

    #[test]
    fn it_should_refuse_to_encode_out_of_range_extension_fields() {
        let mut packet = sample_packet();
        packet.extensions = vec![Extension::WindowScale { shift: 15 }];

        assert!(matches!(
            packet.encode().unwrap_err(),
            Error::InvalidField {
                field: "window scale shift",
                ..
            }
        ));
    }

    #[test]
    fn it_should_deliver_the_body_when_the_extension_chain_is_malformed() {
        let mut packet = sample_packet();
        packet.extensions = vec![Extension::WindowScale { shift: 1 }];
        let mut bytes = packet.encode().unwrap();

        // Append a record that claims far more payload than remains.
        bytes.extend_from_slice(&[1, 250]);
        bytes.extend_from_slice(b"leftover");

        let decoded = Packet::decode(&bytes).unwrap();

        assert_eq!(decoded.extensions, vec![Extension::WindowScale { shift: 1 }]);
        // The malformed record and everything after it becomes payload.
        assert!(decoded.payload.starts_with(&[1, 250]));
    }

    #[test]
    fn it_should_tolerate_a_version_nibble_other_than_one() {
        let mut bytes = sample_packet().encode().unwrap();
        bytes[0] = (bytes[0] & 0xF0) | 0x2;

        let decoded = Packet::decode(&bytes).unwrap();

        assert_eq!(decoded.packet_type, PacketType::Data);
    }

    #[test]
    fn it_should_peek_the_connection_id_from_a_raw_datagram() {
        let bytes = sample_packet().encode().unwrap();

        assert_eq!(Packet::peek_connection_id(&bytes), Some(0x1234));
        assert_eq!(Packet::peek_connection_id(&bytes[..10]), None);
    }

    #[test]
    fn it_should_peek_the_packet_type_from_a_raw_datagram() {
        let mut packet = sample_packet();
        packet.packet_type = PacketType::Syn;
        let bytes = packet.encode().unwrap();

        assert_eq!(Packet::peek_packet_type(&bytes), Some(PacketType::Syn));
    }
}
