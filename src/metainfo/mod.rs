//! The torrent metadata engine.
//!
//! Parses and generates v1 (BEP 3), v2 (BEP 52) and hybrid torrents:
//!
//! - [`torrent`]: the immutable metadata model and the dual info-hash
//!   identity.
//! - [`file_tree`]: the v2 file tree and per-file piece layers.
//! - [`attributes`]: BEP 47 per-file attribute flags.
//! - [`merkle`]: the SHA-256 Merkle constructions behind pieces-roots
//!   and the file-tree fingerprint.
//! - [`parser`]: bytes to model, with exact-span info hashing.
//! - [`generator`]: filesystem to torrent bytes.
pub mod attributes;
pub mod error;
pub mod file_tree;
pub mod generator;
pub mod merkle;
pub mod parser;
pub mod torrent;

pub use error::MetainfoError;
pub use torrent::{Info, Torrent};

pub const METAINFO_LOG_TARGET: &str = "METAINFO";

/// Smallest piece length the generator accepts, 16 KiB.
pub const MIN_PIECE_LENGTH: u64 = 16 * 1024;
