//! The immutable torrent metadata model.
//!
//! A [`Torrent`] is the parsed (or generated) form of a `.torrent`
//! file: the outer container fields plus an [`Info`] that is v1, v2 or
//! hybrid. Metadata objects are built by the parser or the generator
//! and never mutated afterwards.
use torrkit_primitives::{InfoHash, InfoHashV2};

use super::attributes::FileAttributes;
use super::error::MetainfoError;
use super::file_tree::TorrentV2Info;

/// One file entry of a v1 multi-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1File {
    pub length: u64,
    /// Path components below the torrent root, in order.
    pub path: Vec<String>,
    /// BEP 47 flags; empty when the entry carries no `attr`.
    pub attributes: FileAttributes,
    /// Target path of a symlink entry (BEP 47).
    pub symlink_target: Option<Vec<String>>,
    /// Optional whole-file SHA-1 content digest (BEP 47).
    pub sha1: Option<[u8; 20]>,
}

/// The content layout of a v1 torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum V1FileLayout {
    /// `info.length`: the torrent is one file named by `info.name`.
    Single { length: u64 },
    /// `info.files`: a directory of files below `info.name`.
    Multiple { files: Vec<V1File> },
}

/// The v1 half of a torrent's info dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentV1Info {
    pub name: String,
    pub piece_length: u64,
    /// SHA-1 digests, one per piece, spanning the whole content stream.
    pub pieces: Vec<[u8; 20]>,
    pub layout: V1FileLayout,
    pub private: bool,
}

impl TorrentV1Info {
    #[must_use]
    pub fn total_length(&self) -> u64 {
        match &self.layout {
            V1FileLayout::Single { length } => *length,
            V1FileLayout::Multiple { files } => files.iter().map(|file| file.length).sum(),
        }
    }

    #[must_use]
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Checks the piece-count arithmetic: the content must fill every
    /// piece except for slack smaller than one piece at the end.
    ///
    /// # Errors
    ///
    /// Will return `MetainfoError::InvalidTorrent` if the piece count
    /// disagrees with the total length.
    pub fn validate(&self) -> Result<(), MetainfoError> {
        if self.piece_length == 0 {
            return Err(MetainfoError::invalid("piece length must be positive"));
        }

        let total = self.total_length();
        let expected_pieces = if total == 0 { 0 } else { total.div_ceil(self.piece_length) };
        if expected_pieces != self.pieces.len() as u64 {
            return Err(MetainfoError::invalid(format!(
                "{} pieces for {total} bytes at piece length {}, expected {expected_pieces}",
                self.pieces.len(),
                self.piece_length
            )));
        }

        Ok(())
    }
}

/// The info dictionary in its three shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Info {
    V1(TorrentV1Info),
    V2(TorrentV2Info),
    Hybrid { v1: TorrentV1Info, v2: TorrentV2Info },
}

impl Info {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Info::V1(v1) | Info::Hybrid { v1, .. } => &v1.name,
            Info::V2(v2) => &v2.name,
        }
    }

    #[must_use]
    pub fn piece_length(&self) -> u64 {
        match self {
            Info::V1(v1) | Info::Hybrid { v1, .. } => v1.piece_length,
            Info::V2(v2) => v2.piece_length,
        }
    }

    #[must_use]
    pub fn total_length(&self) -> u64 {
        match self {
            Info::V1(v1) | Info::Hybrid { v1, .. } => v1.total_length(),
            Info::V2(v2) => v2.total_length(),
        }
    }

    /// The `meta version` the info dictionary carries: `None` for v1,
    /// 2 for v2-only, 3 for hybrid.
    #[must_use]
    pub fn meta_version(&self) -> Option<i64> {
        match self {
            Info::V1(_) => None,
            Info::V2(_) => Some(2),
            Info::Hybrid { .. } => Some(3),
        }
    }

    #[must_use]
    pub fn is_private(&self) -> bool {
        match self {
            Info::V1(v1) | Info::Hybrid { v1, .. } => v1.private,
            Info::V2(v2) => v2.private,
        }
    }
}

/// A parsed or generated torrent: the outer container plus the info
/// dictionary and its hash identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    pub announce: Option<String>,
    /// BEP 12 announce tiers.
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    pub encoding: Option<String>,
    /// BEP 19 web seeds.
    pub web_seeds: Vec<String>,
    pub info: Info,
    /// SHA-1 over the bencoded info dictionary; the v1 swarm identity.
    pub info_hash: InfoHash,
    /// SHA-256 over the bencoded info dictionary; present iff the info
    /// dictionary carries v2 fields.
    pub info_hash_v2: Option<InfoHashV2>,
}

impl Torrent {
    /// A torrent is hybrid iff it owns both identities.
    #[must_use]
    pub fn is_hybrid(&self) -> bool {
        matches!(self.info, Info::Hybrid { .. })
    }

    /// Announce URLs in tier order, deduplicated against the flat
    /// `announce` field.
    #[must_use]
    pub fn trackers(&self) -> Vec<String> {
        let mut trackers = Vec::new();
        if let Some(announce) = &self.announce {
            trackers.push(announce.clone());
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !trackers.contains(url) {
                        trackers.push(url.clone());
                    }
                }
            }
        }
        trackers
    }
}
