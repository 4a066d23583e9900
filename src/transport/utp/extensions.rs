//! The uTP extension chain.
//!
//! When the first-extension byte of the packet header is non-zero, the
//! fixed header is followed by a chain of records, each laid out as
//! `[type:1][length:1][payload:length]`. A record of type zero ends the
//! chain; running out of records ends it too.
//!
//! Three extension types are understood. Unknown types are skipped by
//! their declared length. A record whose declared length runs past the
//! end of the datagram aborts the chain: everything decoded so far is
//! kept, the remaining bytes become the packet body.
use tracing::debug;

use super::error::Error;
use super::UTP_TRANSPORT_LOG_TARGET;

/// Chain terminator.
pub const EXTENSION_NONE: u8 = 0;
/// Selective acknowledgment blocks (RFC 2018 flavored).
pub const EXTENSION_SACK: u8 = 1;
/// Window scaling (RFC 1323 flavored).
pub const EXTENSION_WINDOW_SCALE: u8 = 2;
/// Explicit congestion notification echo flags.
pub const EXTENSION_ECN: u8 = 4;

/// Largest number of SACK blocks a single extension may carry.
pub const MAX_SACK_BLOCKS: usize = 4;
/// Largest admissible window-scale shift.
pub const MAX_WINDOW_SCALE_SHIFT: u8 = 14;

const ECN_ECHO_BIT: u8 = 0b0000_0001;
const ECN_CWR_BIT: u8 = 0b0000_0010;

/// One contiguous run of received sequence numbers, `start` inclusive,
/// `end` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub start: u16,
    pub end: u16,
}

/// A decoded extension record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    SelectiveAck { blocks: Vec<SackBlock> },
    WindowScale { shift: u8 },
    Ecn { echo: bool, cwr: bool },
}

impl Extension {
    /// The wire type byte of this extension.
    #[must_use]
    pub fn extension_type(&self) -> u8 {
        match self {
            Extension::SelectiveAck { .. } => EXTENSION_SACK,
            Extension::WindowScale { .. } => EXTENSION_WINDOW_SCALE,
            Extension::Ecn { .. } => EXTENSION_ECN,
        }
    }

    /// Encodes the payload of this extension (without the type/length
    /// record framing).
    ///
    /// # Errors
    ///
    /// Will return `Error::InvalidField` if a field violates its
    /// declared range: more than four SACK blocks, an empty or inverted
    /// SACK block, or a window-scale shift above 14.
    pub fn encode_payload(&self) -> Result<Vec<u8>, Error> {
        match self {
            Extension::SelectiveAck { blocks } => {
                if blocks.len() > MAX_SACK_BLOCKS {
                    return Err(Error::InvalidField {
                        field: "sack block count",
                        value: blocks.len() as u64,
                    });
                }
                let mut payload = Vec::with_capacity(1 + blocks.len() * 4);
                #[allow(clippy::cast_possible_truncation)]
                payload.push(blocks.len() as u8);
                for block in blocks {
                    if block.start >= block.end {
                        return Err(Error::InvalidField {
                            field: "sack block range",
                            value: u64::from(block.start),
                        });
                    }
                    payload.extend_from_slice(&block.start.to_be_bytes());
                    payload.extend_from_slice(&block.end.to_be_bytes());
                }
                Ok(payload)
            }
            Extension::WindowScale { shift } => {
                if *shift > MAX_WINDOW_SCALE_SHIFT {
                    return Err(Error::InvalidField {
                        field: "window scale shift",
                        value: u64::from(*shift),
                    });
                }
                Ok(vec![*shift])
            }
            Extension::Ecn { echo, cwr } => {
                let mut flags = 0u8;
                if *echo {
                    flags |= ECN_ECHO_BIT;
                }
                if *cwr {
                    flags |= ECN_CWR_BIT;
                }
                Ok(vec![flags])
            }
        }
    }

    /// Decodes a single extension payload. `None` means the record is
    /// not usable (inconsistent with its own length, or out-of-range
    /// values); the caller skips it and keeps walking the chain.
    #[must_use]
    fn decode_payload(extension_type: u8, payload: &[u8]) -> Option<Extension> {
        match extension_type {
            EXTENSION_SACK => {
                let block_count = usize::from(*payload.first()?);
                if payload.len() < 1 + block_count * 4 {
                    return None;
                }
                let mut blocks = Vec::with_capacity(block_count.min(MAX_SACK_BLOCKS));
                for chunk in payload[1..1 + block_count * 4].chunks_exact(4) {
                    blocks.push(SackBlock {
                        start: u16::from_be_bytes([chunk[0], chunk[1]]),
                        end: u16::from_be_bytes([chunk[2], chunk[3]]),
                    });
                }
                Some(Extension::SelectiveAck { blocks })
            }
            EXTENSION_WINDOW_SCALE => {
                let shift = *payload.first()?;
                if shift > MAX_WINDOW_SCALE_SHIFT {
                    return None;
                }
                Some(Extension::WindowScale { shift })
            }
            EXTENSION_ECN => {
                let flags = *payload.first()?;
                Some(Extension::Ecn {
                    echo: flags & ECN_ECHO_BIT != 0,
                    cwr: flags & ECN_CWR_BIT != 0,
                })
            }
            _ => None,
        }
    }
}

/// Result of walking an extension chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChain {
    pub extensions: Vec<Extension>,
    /// Offset of the first byte after the chain; the packet body starts
    /// here.
    pub body_offset: usize,
    /// Set when a record's declared length overran the buffer and the
    /// rest of the chain was discarded.
    pub malformed: bool,
}

/// Walks the extension chain starting at `offset`.
#[must_use]
pub fn parse_chain(data: &[u8], offset: usize) -> ParsedChain {
    let mut extensions = Vec::new();
    let mut pos = offset;

    while pos < data.len() {
        let extension_type = data[pos];

        if extension_type == EXTENSION_NONE {
            pos += 1;
            break;
        }

        let Some(&length) = data.get(pos + 1) else {
            // Type byte with no length byte; cannot even skip it.
            return ParsedChain {
                extensions,
                body_offset: pos,
                malformed: true,
            };
        };
        let length = usize::from(length);

        if pos + 2 + length > data.len() {
            debug!(target: UTP_TRANSPORT_LOG_TARGET, extension_type, length, available = data.len() - pos - 2, "extension chain overruns the datagram, discarding the rest");
            return ParsedChain {
                extensions,
                body_offset: pos,
                malformed: true,
            };
        }

        let payload = &data[pos + 2..pos + 2 + length];
        if let Some(extension) = Extension::decode_payload(extension_type, payload) {
            extensions.push(extension);
        } else {
            debug!(target: UTP_TRANSPORT_LOG_TARGET, extension_type, length, "skipping unusable extension record");
        }

        pos += 2 + length;
    }

    ParsedChain {
        extensions,
        body_offset: pos,
        malformed: false,
    }
}

/// Encodes an extension chain (no trailing terminator; the chain ends
/// with the payload, exactly as the decoder expects).
///
/// # Errors
///
/// Will return `Error::InvalidField` if any extension fails its range
/// validation.
pub fn encode_chain(extensions: &[Extension]) -> Result<Vec<u8>, Error> {
    let mut bytes = Vec::new();
    for extension in extensions {
        let payload = extension.encode_payload()?;
        debug_assert!(payload.len() <= usize::from(u8::MAX));
        bytes.push(extension.extension_type());
        #[allow(clippy::cast_possible_truncation)]
        bytes.push(payload.len() as u8);
        bytes.extend_from_slice(&payload);
    }
    Ok(bytes)
}

/// The window-scale shift both sides agree on: the minimum of what each
/// end advertised (RFC 1323 convention).
#[must_use]
pub fn negotiate_window_scale(ours: u8, peers: u8) -> u8 {
    ours.min(peers)
}
