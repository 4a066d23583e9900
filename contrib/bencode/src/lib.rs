//! Canonical bencode decoding and encoding.
//!
//! Info hashes are defined over the byte-exact bencoded info dictionary,
//! so this codec is strict in both directions:
//!
//! - The decoder ([`Value::decode`]) accepts canonical input only:
//!   dictionary keys must be sorted and unique, integers must not carry
//!   leading zeros or a negative zero. Every decoded node keeps a
//!   reference to its raw byte span so callers can hash the exact bytes
//!   a value was parsed from.
//! - The encoder ([`BencodeValue::encode`]) always produces canonical
//!   output: dictionary keys sorted lexicographically, integers in
//!   canonical decimal, byte strings length-prefixed.
//!
//! # Examples
//!
//! Decoding bencoded data:
//!
//! ```rust
//!     use torrkit_contrib_bencode::Value;
//!
//!     let data = b"d12:lucky_numberi7ee"; // cspell:disable-line
//!     let bencode = Value::decode(data).unwrap();
//!
//!     let dict = bencode.dict().unwrap();
//!     assert_eq!(Value::lookup(dict, b"lucky_number").unwrap().int(), Some(7));
//! ```
//!
//! Encoding bencoded data:
//!
//! ```rust
//!     use torrkit_contrib_bencode::BencodeValue;
//!
//!     let mut message = BencodeValue::new_dict();
//!     message.insert(b"lucky_number", BencodeValue::Int(7));
//!     message.insert(b"lucky_string", BencodeValue::bytes(b"7"));
//!
//!     let data = b"d12:lucky_numberi7e12:lucky_string1:7e"; // cspell:disable-line
//!     assert_eq!(&message.encode()[..], &data[..]);
//! ```

mod decode;
mod encode;
mod error;
mod value;

pub use crate::encode::BencodeValue;
pub use crate::error::{BencodeParseError, BencodeParseResult};
pub use crate::value::Value;

const BEN_END: u8 = b'e';
const DICT_START: u8 = b'd';
const LIST_START: u8 = b'l';
const INT_START: u8 = b'i';

const BYTE_LEN_LOW: u8 = b'0';
const BYTE_LEN_HIGH: u8 = b'9';
const BYTE_LEN_END: u8 = b':';

/// Nesting bound for decoded documents. Torrent file trees are shallow;
/// anything deeper than this is hostile input.
const MAX_RECURSION: usize = 50;
