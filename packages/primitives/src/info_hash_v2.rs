//! The v2 `BitTorrent` info hash.
//!
//! BitTorrent v2 (BEP 52) identifies a torrent by the SHA-256 digest of
//! the bencoded info dictionary. Unlike the v1 hash, which is computed
//! over the v1-relevant fields only, the v2 hash always covers the whole
//! info dictionary.
//!
//! See [BEP 52. The `BitTorrent` Protocol Specification v2](https://www.bittorrent.org/beps/bep_0052.html).
use std::panic::Location;

use thiserror::Error;

/// `BitTorrent` Info Hash v2 (SHA-256 over the bencoded info dictionary).
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug)]
pub struct InfoHashV2(pub [u8; 32]);

const INFO_HASH_V2_BYTES_LEN: usize = 32;

impl InfoHashV2 {
    /// Create a new `InfoHashV2` from a byte slice.
    ///
    /// # Panics
    ///
    /// Will panic if byte slice does not contain the exact amount of bytes needed for the `InfoHashV2`.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), INFO_HASH_V2_BYTES_LEN);
        let mut ret = Self([0u8; INFO_HASH_V2_BYTES_LEN]);
        ret.0.clone_from_slice(bytes);
        ret
    }

    /// Returns the `InfoHashV2` internal byte array.
    #[must_use]
    pub fn bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Returns the `InfoHashV2` as a hex string.
    #[must_use]
    pub fn to_hex_string(&self) -> String {
        self.to_string()
    }

    /// The truncated 20-byte form used when a v2 swarm is addressed
    /// through interfaces sized for v1 hashes.
    #[must_use]
    pub fn truncated(&self) -> [u8; 20] {
        let mut short = [0u8; 20];
        short.clone_from_slice(&self.0[..20]);
        short
    }
}

impl std::fmt::Display for InfoHashV2 {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut chars = [0u8; 64];
        binascii::bin2hex(&self.0, &mut chars).expect("failed to hexlify");
        write!(f, "{}", std::str::from_utf8(&chars).unwrap())
    }
}

impl std::str::FromStr for InfoHashV2 {
    type Err = binascii::ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut i = Self([0u8; 32]);
        if s.len() != 64 {
            return Err(binascii::ConvertError::InvalidInputLength);
        }
        binascii::hex2bin(s.as_bytes(), &mut i.0)?;
        Ok(i)
    }
}

impl Ord for InfoHashV2 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::cmp::PartialOrd<InfoHashV2> for InfoHashV2 {
    fn partial_cmp(&self, other: &InfoHashV2) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::convert::From<[u8; 32]> for InfoHashV2 {
    fn from(val: [u8; 32]) -> Self {
        InfoHashV2(val)
    }
}

/// Errors that can occur when converting from a `Vec<u8>` to an `InfoHashV2`.
#[derive(Error, Debug)]
pub enum ConversionError {
    /// Not enough bytes for the info hash. A v2 info hash is 32 bytes.
    #[error("not enough bytes for v2 infohash: {message} {location}")]
    NotEnoughBytes {
        location: &'static Location<'static>,
        message: String,
    },
    /// Too many bytes for the info hash. A v2 info hash is 32 bytes.
    #[error("too many bytes for v2 infohash: {message} {location}")]
    TooManyBytes {
        location: &'static Location<'static>,
        message: String,
    },
}

impl TryFrom<&[u8]> for InfoHashV2 {
    type Error = ConversionError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() < INFO_HASH_V2_BYTES_LEN {
            return Err(ConversionError::NotEnoughBytes {
                location: Location::caller(),
                message: format! {"got {} bytes, expected {}", bytes.len(), INFO_HASH_V2_BYTES_LEN},
            });
        }
        if bytes.len() > INFO_HASH_V2_BYTES_LEN {
            return Err(ConversionError::TooManyBytes {
                location: Location::caller(),
                message: format! {"got {} bytes, expected {}", bytes.len(), INFO_HASH_V2_BYTES_LEN},
            });
        }
        Ok(Self::from_bytes(bytes))
    }
}

impl serde::ser::Serialize for InfoHashV2 {
    fn serialize<S: serde::ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex_string())
    }
}
