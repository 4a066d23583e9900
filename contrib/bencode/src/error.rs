use thiserror::Error;

/// Error raised while decoding a bencoded document.
///
/// Every variant carries the byte position the decoder had reached, so a
/// rejected torrent file can be diagnosed with a hex dump.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BencodeParseError {
    #[error("unexpected end of input at {pos}")]
    UnexpectedEnd { pos: usize },

    #[error("invalid value byte at {pos}")]
    InvalidByte { pos: usize },

    #[error("integer with no delimiter at {pos}")]
    IntNoDelimiter { pos: usize },

    #[error("negative zero integer at {pos}")]
    IntNegativeZero { pos: usize },

    #[error("zero padded integer at {pos}")]
    IntZeroPadding { pos: usize },

    #[error("unparsable integer at {pos}")]
    IntParse { pos: usize },

    #[error("byte string length overflows the buffer at {pos}")]
    LengthOverflow { pos: usize },

    #[error("dictionary key out of sorted order at {pos}: {key:?}")]
    KeyOrdering { pos: usize, key: Vec<u8> },

    #[error("duplicate dictionary key at {pos}: {key:?}")]
    KeyDuplicate { pos: usize, key: Vec<u8> },

    #[error("recursion limit {max} exceeded at {pos}")]
    RecursionExceeded { pos: usize, max: usize },

    #[error("trailing bytes after the document at {pos}")]
    TrailingBytes { pos: usize },
}

pub type BencodeParseResult<T> = Result<T, BencodeParseError>;
