//! SHA-256 Merkle constructions for BEP 52.
//!
//! Each file in a v2 torrent is fingerprinted by a *pieces-root*: the
//! root of a binary Merkle tree whose leaves are the SHA-256 digests of
//! the file's pieces. The leaf layer is padded with all-zero leaves to
//! the next power of two, which is the construction other v2 clients
//! verify against; the duplicate-last-leaf shortcut some implementations
//! use is deliberately not an option here, since the two disagree for
//! every non-power-of-two piece count.
use sha2::{Digest, Sha256};

use super::file_tree::FileTreeNode;

/// The conventional pieces-root of an empty file.
pub const EMPTY_PIECES_ROOT: [u8; 32] = [0u8; 32];

/// SHA-256 of one piece of content.
#[must_use]
pub fn hash_piece(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// The Merkle root over a file's piece digests.
///
/// An empty file has the all-zero root by convention, and a single
/// piece is its own root. Larger layers are zero-leaf padded to the
/// next power of two and combined pairwise.
#[must_use]
pub fn pieces_root(piece_hashes: &[[u8; 32]]) -> [u8; 32] {
    match piece_hashes {
        [] => EMPTY_PIECES_ROOT,
        [single] => *single,
        _ => merkle_root_padded(piece_hashes),
    }
}

/// Pairwise SHA-256 combination over a zero-padded leaf layer.
fn merkle_root_padded(leaves: &[[u8; 32]]) -> [u8; 32] {
    let padded_len = leaves.len().next_power_of_two();
    let mut level: Vec<[u8; 32]> = Vec::with_capacity(padded_len);
    level.extend_from_slice(leaves);
    level.resize(padded_len, [0u8; 32]);

    while level.len() > 1 {
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(pair[0]);
                hasher.update(pair[1]);
                hasher.finalize().into()
            })
            .collect();
    }

    level[0]
}

/// Whether a piece layer reproduces the pieces-root it is filed under.
#[must_use]
pub fn verify_piece_layer(piece_hashes: &[[u8; 32]], expected_root: &[u8; 32]) -> bool {
    pieces_root(piece_hashes) == *expected_root
}

/// A fingerprint of the logical layout of a file tree.
///
/// File nodes hash `SHA-256(name ‖ length_be_u64 ‖ pieces_root)`;
/// directory nodes combine their children (in lexicographic name
/// order) with the same Merkle scheme as piece layers. The fingerprint
/// is not part of the wire format, it only identifies layouts locally.
#[must_use]
pub fn file_tree_root(children: &std::collections::BTreeMap<String, FileTreeNode>) -> [u8; 32] {
    if children.is_empty() {
        return Sha256::digest(b"").into();
    }

    let child_hashes: Vec<[u8; 32]> = children
        .iter()
        .map(|(name, node)| match node {
            FileTreeNode::File { length, pieces_root } => hash_file_node(name, *length, pieces_root),
            FileTreeNode::Directory { children } => file_tree_root(children),
        })
        .collect();

    pieces_root(&child_hashes)
}

fn hash_file_node(name: &str, length: u64, pieces_root: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(length.to_be_bytes());
    hasher.update(pieces_root);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use sha2::{Digest, Sha256};

    use super::{file_tree_root, hash_piece, pieces_root, verify_piece_layer, EMPTY_PIECES_ROOT};
    use crate::metainfo::file_tree::FileTreeNode;

    fn sha256_pair(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(left);
        hasher.update(right);
        hasher.finalize().into()
    }

    #[test]
    fn it_should_use_the_all_zero_root_for_an_empty_file() {
        assert_eq!(pieces_root(&[]), EMPTY_PIECES_ROOT);
    }

    #[test]
    fn it_should_use_the_single_digest_as_the_root_of_a_one_piece_file() {
        let digest = hash_piece(b"only piece");

        assert_eq!(pieces_root(&[digest]), digest);
    }

    #[test]
    fn it_should_combine_two_pieces_into_their_parent_hash() {
        let left = hash_piece(b"left");
        let right = hash_piece(b"right");

        assert_eq!(pieces_root(&[left, right]), sha256_pair(&left, &right));
    }

    #[test]
    fn it_should_pad_an_odd_layer_with_zero_leaves() {
        let pieces = [hash_piece(b"a"), hash_piece(b"b"), hash_piece(b"c")];

        // Reference construction: leaves padded to four with zeros.
        let zero = [0u8; 32];
        let expected = sha256_pair(
            &sha256_pair(&pieces[0], &pieces[1]),
            &sha256_pair(&pieces[2], &zero),
        );

        assert_eq!(pieces_root(&pieces), expected);
    }

    #[test]
    fn it_should_match_the_reference_construction_for_a_five_piece_layer() {
        let pieces: Vec<[u8; 32]> = (0u8..5).map(|i| hash_piece(&[i])).collect();

        // Eight padded leaves, three levels.
        let zero = [0u8; 32];
        let l1 = [
            sha256_pair(&pieces[0], &pieces[1]),
            sha256_pair(&pieces[2], &pieces[3]),
            sha256_pair(&pieces[4], &zero),
            sha256_pair(&zero, &zero),
        ];
        let l2 = [sha256_pair(&l1[0], &l1[1]), sha256_pair(&l1[2], &l1[3])];
        let expected = sha256_pair(&l2[0], &l2[1]);

        assert_eq!(pieces_root(&pieces), expected);
    }

    #[test]
    fn it_should_verify_a_layer_against_its_root() {
        let pieces = [hash_piece(b"x"), hash_piece(b"y"), hash_piece(b"z")];
        let root = pieces_root(&pieces);

        assert!(verify_piece_layer(&pieces, &root));
        assert!(!verify_piece_layer(&pieces[..2], &root));
    }

    #[test]
    fn it_should_fingerprint_a_file_tree_deterministically() {
        let mut children = BTreeMap::new();
        children.insert(
            "a.bin".to_owned(),
            FileTreeNode::File {
                length: 7,
                pieces_root: hash_piece(b"a"),
            },
        );
        let mut subdir = BTreeMap::new();
        subdir.insert(
            "b.bin".to_owned(),
            FileTreeNode::File {
                length: 9,
                pieces_root: hash_piece(b"b"),
            },
        );
        children.insert("sub".to_owned(), FileTreeNode::Directory { children: subdir });

        let first = file_tree_root(&children);
        let second = file_tree_root(&children);
        assert_eq!(first, second);

        // Renaming a file changes the fingerprint.
        let mut renamed = children.clone();
        let node = renamed.remove("a.bin").unwrap();
        renamed.insert("z.bin".to_owned(), node);
        assert_ne!(file_tree_root(&renamed), first);
    }
}
