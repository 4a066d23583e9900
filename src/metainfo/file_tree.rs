//! The v2 file tree and piece layers.
//!
//! A BEP 52 torrent describes its content as a tree of named nodes: a
//! file node carries a length and a 32-byte pieces-root, a directory
//! node carries children. Each non-empty file additionally owns a
//! *piece layer*, the ordered sequence of SHA-256 piece digests whose
//! Merkle root is the file's pieces-root.
use std::collections::BTreeMap;

use super::error::MetainfoError;
use super::merkle;

/// One node of the file tree. A node is exclusively a file or a
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileTreeNode {
    File {
        length: u64,
        /// Merkle root of the file's piece layer; all zeros for an
        /// empty file.
        pieces_root: [u8; 32],
    },
    Directory {
        /// Children by name; the map keeps them in the lexicographic
        /// order canonical serialization needs.
        children: BTreeMap<String, FileTreeNode>,
    },
}

impl FileTreeNode {
    #[must_use]
    pub fn is_file(&self) -> bool {
        matches!(self, FileTreeNode::File { .. })
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        matches!(self, FileTreeNode::Directory { .. })
    }

    /// Total content length under this node.
    #[must_use]
    pub fn total_length(&self) -> u64 {
        match self {
            FileTreeNode::File { length, .. } => *length,
            FileTreeNode::Directory { children } => children.values().map(FileTreeNode::total_length).sum(),
        }
    }
}

/// The ordered piece digests of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceLayer {
    /// Piece length of the torrent, replicated for convenience.
    pub piece_length: u64,
    pub hashes: Vec<[u8; 32]>,
}

impl PieceLayer {
    /// Number of pieces in the layer.
    #[must_use]
    pub fn num_pieces(&self) -> usize {
        self.hashes.len()
    }
}

/// The v2 half of a torrent's info dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentV2Info {
    pub name: String,
    pub piece_length: u64,
    /// Root children of the file tree.
    pub file_tree: BTreeMap<String, FileTreeNode>,
    /// Piece layers by the pieces-root they hash to.
    pub piece_layers: BTreeMap<[u8; 32], PieceLayer>,
    pub private: bool,
}

impl TorrentV2Info {
    /// Every file in the tree, as `(path, length, pieces_root)` with
    /// `/`-joined paths, in canonical (depth-first, lexicographic)
    /// order.
    #[must_use]
    pub fn files(&self) -> Vec<(String, u64, [u8; 32])> {
        let mut files = Vec::new();
        collect_files(&self.file_tree, "", &mut files);
        files
    }

    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.file_tree.values().map(FileTreeNode::total_length).sum()
    }

    /// The piece layer filed under a pieces-root, when the file is
    /// large enough to have one.
    #[must_use]
    pub fn piece_layer(&self, pieces_root: &[u8; 32]) -> Option<&PieceLayer> {
        self.piece_layers.get(pieces_root)
    }

    /// Number of pieces a file of `length` has under `piece_length`.
    #[must_use]
    pub fn num_pieces_for_length(&self, length: u64) -> u64 {
        if length == 0 {
            0
        } else {
            length.div_ceil(self.piece_length)
        }
    }

    /// Checks the structural invariants of the tree and the layer map:
    /// non-empty directories, sane names, one matching layer per
    /// multi-piece file, and layers that actually hash to their root.
    ///
    /// # Errors
    ///
    /// Will return `MetainfoError::InvalidTorrent` on a structural
    /// violation or `MetainfoError::HashMismatch` when a piece layer
    /// does not reproduce its pieces-root.
    pub fn validate(&self) -> Result<(), MetainfoError> {
        if self.file_tree.is_empty() {
            return Err(MetainfoError::invalid("file tree has no entries"));
        }

        validate_children(&self.file_tree)?;

        for (path, length, pieces_root) in self.files() {
            let expected_pieces = self.num_pieces_for_length(length);

            match self.piece_layers.get(&pieces_root) {
                Some(layer) => {
                    if layer.hashes.len() as u64 != expected_pieces {
                        return Err(MetainfoError::invalid(format!(
                            "piece layer of {path} has {} pieces, expected {expected_pieces}",
                            layer.hashes.len()
                        )));
                    }
                    if !merkle::verify_piece_layer(&layer.hashes, &pieces_root) {
                        return Err(MetainfoError::HashMismatch {
                            context: format!("piece layer of {path}"),
                            expected: hex(&pieces_root),
                            computed: hex(&merkle::pieces_root(&layer.hashes)),
                        });
                    }
                }
                None => {
                    // Files that fit in one piece (or are empty) carry
                    // no layer; their root is the piece digest itself.
                    if expected_pieces > 1 {
                        return Err(MetainfoError::invalid(format!(
                            "multi-piece file {path} has no piece layer"
                        )));
                    }
                }
            }
        }

        for pieces_root in self.piece_layers.keys() {
            let known = self
                .files()
                .iter()
                .any(|(_, _, root)| root == pieces_root);
            if !known {
                return Err(MetainfoError::invalid(format!(
                    "piece layer {} belongs to no file",
                    hex(pieces_root)
                )));
            }
        }

        Ok(())
    }
}

fn collect_files(
    children: &BTreeMap<String, FileTreeNode>,
    prefix: &str,
    files: &mut Vec<(String, u64, [u8; 32])>,
) {
    for (name, node) in children {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        match node {
            FileTreeNode::File { length, pieces_root } => files.push((path, *length, *pieces_root)),
            FileTreeNode::Directory { children } => collect_files(children, &path, files),
        }
    }
}

fn validate_children(children: &BTreeMap<String, FileTreeNode>) -> Result<(), MetainfoError> {
    for (name, node) in children {
        if name.is_empty() {
            return Err(MetainfoError::invalid("file tree entry with an empty name"));
        }
        if name.contains('/') {
            return Err(MetainfoError::invalid(format!(
                "file tree name {name:?} contains a path separator"
            )));
        }
        if let FileTreeNode::Directory { children } = node {
            if children.is_empty() {
                return Err(MetainfoError::invalid(format!("directory {name:?} has no children")));
            }
            validate_children(children)?;
        }
    }
    Ok(())
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
