//! Error types for the torrent metadata engine.
use std::path::PathBuf;

use thiserror::Error;
use torrkit_contrib_bencode::BencodeParseError;

/// Error returned by the torrent parser and generator.
///
/// Parsing never partially succeeds: the first violated invariant
/// aborts with the error naming it.
#[derive(Error, Debug)]
pub enum MetainfoError {
    /// Structural or semantic validation of the metadata failed.
    #[error("invalid torrent: {reason}")]
    InvalidTorrent { reason: String },

    /// The input was not well-formed canonical bencode.
    #[error("bencode error: {source}")]
    Bencode {
        #[from]
        source: BencodeParseError,
    },

    /// A computed digest did not match the value the metadata claims.
    #[error("hash mismatch for {context}: expected {expected}, computed {computed}")]
    HashMismatch {
        context: String,
        expected: String,
        computed: String,
    },

    /// The filesystem source of a generation run could not be read.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MetainfoError {
    /// An `InvalidTorrent` with the given reason.
    pub fn invalid(reason: impl Into<String>) -> MetainfoError {
        MetainfoError::InvalidTorrent {
            reason: reason.into(),
        }
    }
}
