use std::str;

use crate::decode;
use crate::error::{BencodeParseError, BencodeParseResult};

/// A decoded bencode value borrowing from the input buffer.
///
/// The value keeps the raw byte span it was decoded from, which is what
/// makes info-hash computation exact: hashing `raw()` of a parsed info
/// dictionary reproduces the digest the torrent was published under,
/// byte for byte, without a re-encode round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value<'a> {
    inner: Inner<'a>,
    raw: &'a [u8],
}

/// Dictionary entries in document order (which decoding guarantees is
/// sorted key order).
pub type DictEntries<'a> = Vec<(&'a [u8], Value<'a>)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inner<'a> {
    Bytes(&'a [u8]),
    Int(i64),
    List(Vec<Value<'a>>),
    Dict(DictEntries<'a>),
}

impl<'a> Value<'a> {
    /// Decodes a complete bencoded document.
    ///
    /// # Errors
    ///
    /// Will return an error if the input is not a single canonical
    /// bencoded value spanning the whole buffer.
    pub fn decode(bytes: &'a [u8]) -> BencodeParseResult<Value<'a>> {
        let (value, consumed) = decode::decode(bytes, 0, 0)?;

        if consumed != bytes.len() {
            return Err(BencodeParseError::TrailingBytes { pos: consumed });
        }

        Ok(value)
    }

    pub(crate) fn new(inner: Inner<'a>, raw: &'a [u8]) -> Value<'a> {
        Value { inner, raw }
    }

    /// The exact input bytes this value was decoded from.
    #[must_use]
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    #[must_use]
    pub fn bytes(&self) -> Option<&'a [u8]> {
        match self.inner {
            Inner::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// The value as UTF-8 text, when it is a valid UTF-8 byte string.
    #[must_use]
    pub fn str(&self) -> Option<&'a str> {
        self.bytes().and_then(|bytes| str::from_utf8(bytes).ok())
    }

    #[must_use]
    pub fn int(&self) -> Option<i64> {
        match self.inner {
            Inner::Int(int) => Some(int),
            _ => None,
        }
    }

    #[must_use]
    pub fn list(&self) -> Option<&[Value<'a>]> {
        match &self.inner {
            Inner::List(list) => Some(list),
            _ => None,
        }
    }

    #[must_use]
    pub fn dict(&self) -> Option<&DictEntries<'a>> {
        match &self.inner {
            Inner::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks a key up in a dictionary's entry list.
    ///
    /// Entries are in sorted key order, but dictionaries this small are
    /// cheaper to scan than to binary search.
    #[must_use]
    pub fn lookup<'b>(entries: &'b DictEntries<'a>, key: &[u8]) -> Option<&'b Value<'a>> {
        entries
            .iter()
            .find(|(entry_key, _)| *entry_key == key)
            .map(|(_, value)| value)
    }
}
