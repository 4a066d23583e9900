//! Parsing torrent files into the metadata model.
//!
//! The flow is: decode the bencoded document, inspect
//! `info.meta version`, then take the v1, v2 or hybrid path. The info
//! hashes are computed over the decoder-preserved raw byte span of the
//! info dictionary, so a parsed torrent keeps exactly the identity it
//! was published under.
use std::collections::BTreeMap;

use sha1::Sha1;
use sha2::{Digest, Sha256};
use torrkit_contrib_bencode::Value;
use torrkit_primitives::{InfoHash, InfoHashV2};

use super::attributes::FileAttributes;
use super::error::MetainfoError;
use super::file_tree::{FileTreeNode, PieceLayer, TorrentV2Info};
use super::torrent::{Info, Torrent, TorrentV1Info, V1File, V1FileLayout};
use super::MIN_PIECE_LENGTH;

type DictEntries<'a> = Vec<(&'a [u8], Value<'a>)>;

/// Parses a torrent file.
///
/// # Errors
///
/// Will return `MetainfoError::Bencode` for malformed bencode,
/// `MetainfoError::InvalidTorrent` for structural violations and
/// `MetainfoError::HashMismatch` when a v2 piece layer does not
/// reproduce its pieces-root. Parsing never partially succeeds.
pub fn parse(bytes: &[u8]) -> Result<Torrent, MetainfoError> {
    let document = Value::decode(bytes)?;
    let root = document
        .dict()
        .ok_or_else(|| MetainfoError::invalid("torrent is not a dictionary"))?;

    let info_value =
        Value::lookup(root, b"info").ok_or_else(|| MetainfoError::invalid("missing info dictionary"))?;
    let info_entries = info_value
        .dict()
        .ok_or_else(|| MetainfoError::invalid("info is not a dictionary"))?;

    let info = parse_info(info_entries)?;

    // The identity is the hash of the exact bytes the info dictionary
    // was decoded from.
    let info_hash = InfoHash::from_bytes(&Sha1::digest(info_value.raw()));
    let info_hash_v2 = match info {
        Info::V1(_) => None,
        Info::V2(_) | Info::Hybrid { .. } => {
            Some(InfoHashV2::from_bytes(&Sha256::digest(info_value.raw())))
        }
    };

    Ok(Torrent {
        announce: optional_str(root, b"announce")?,
        announce_list: parse_announce_list(root)?,
        comment: optional_str(root, b"comment")?,
        created_by: optional_str(root, b"created by")?,
        creation_date: optional_int(root, b"creation date"),
        encoding: optional_str(root, b"encoding")?,
        web_seeds: parse_web_seeds(root)?,
        info,
        info_hash,
        info_hash_v2,
    })
}

fn parse_info(entries: &DictEntries<'_>) -> Result<Info, MetainfoError> {
    match Value::lookup(entries, b"meta version").and_then(Value::int) {
        // Absent (or not an integer): plain v1.
        None => Ok(Info::V1(parse_v1(entries)?)),
        Some(2) => {
            if Value::lookup(entries, b"pieces").is_some() {
                return Err(MetainfoError::invalid(
                    "v2-only torrent must not carry a v1 pieces field",
                ));
            }
            Ok(Info::V2(parse_v2(entries)?))
        }
        Some(3) => Ok(Info::Hybrid {
            v1: parse_v1(entries)?,
            v2: parse_v2(entries)?,
        }),
        Some(other) => Err(MetainfoError::invalid(format!(
            "unsupported meta version {other}"
        ))),
    }
}

fn parse_v1(entries: &DictEntries<'_>) -> Result<TorrentV1Info, MetainfoError> {
    let name = required_str(entries, b"name")?;
    let piece_length = required_positive_int(entries, b"piece length")?;

    let pieces_bytes = required_bytes(entries, b"pieces")?;
    if pieces_bytes.len() % 20 != 0 {
        return Err(MetainfoError::invalid(format!(
            "pieces length {} is not a multiple of 20",
            pieces_bytes.len()
        )));
    }
    let pieces: Vec<[u8; 20]> = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| chunk.try_into().expect("chunk is 20 bytes"))
        .collect();

    let length = Value::lookup(entries, b"length");
    let files = Value::lookup(entries, b"files");

    let layout = match (length, files) {
        (Some(_), Some(_)) => {
            return Err(MetainfoError::invalid(
                "info carries both length and files",
            ));
        }
        (Some(length), None) => {
            let length = length
                .int()
                .filter(|length| *length >= 0)
                .ok_or_else(|| MetainfoError::invalid("length is not a non-negative integer"))?;
            V1FileLayout::Single {
                length: unsigned(length),
            }
        }
        (None, Some(files)) => V1FileLayout::Multiple {
            files: parse_v1_files(files)?,
        },
        (None, None) => {
            return Err(MetainfoError::invalid(
                "info carries neither length nor files",
            ));
        }
    };

    let info = TorrentV1Info {
        name,
        piece_length,
        pieces,
        layout,
        private: parse_private(entries),
    };
    info.validate()?;
    Ok(info)
}

fn parse_v1_files(files: &Value<'_>) -> Result<Vec<V1File>, MetainfoError> {
    let list = files
        .list()
        .ok_or_else(|| MetainfoError::invalid("files is not a list"))?;
    if list.is_empty() {
        return Err(MetainfoError::invalid("files list is empty"));
    }

    let mut parsed = Vec::with_capacity(list.len());
    for entry in list {
        let entry = entry
            .dict()
            .ok_or_else(|| MetainfoError::invalid("file entry is not a dictionary"))?;

        let length = Value::lookup(entry, b"length")
            .and_then(Value::int)
            .filter(|length| *length >= 0)
            .ok_or_else(|| MetainfoError::invalid("file entry has no valid length"))?;

        let path = parse_path_components(entry, b"path")?
            .ok_or_else(|| MetainfoError::invalid("file entry has no path"))?;

        let attributes = Value::lookup(entry, b"attr")
            .and_then(Value::bytes)
            .map_or_else(FileAttributes::default, FileAttributes::from_bytes);

        let symlink_target = parse_path_components(entry, b"symlink path")?;
        if attributes.symlink && symlink_target.is_none() {
            return Err(MetainfoError::invalid(
                "symlink attribute without a symlink path",
            ));
        }

        let sha1 = match Value::lookup(entry, b"sha1").and_then(Value::bytes) {
            Some(digest) => Some(digest.try_into().map_err(|_| {
                MetainfoError::invalid("file sha1 digest is not 20 bytes")
            })?),
            None => None,
        };

        parsed.push(V1File {
            length: unsigned(length),
            path,
            attributes,
            symlink_target,
            sha1,
        });
    }
    Ok(parsed)
}

fn parse_path_components(
    entry: &DictEntries<'_>,
    key: &[u8],
) -> Result<Option<Vec<String>>, MetainfoError> {
    let Some(value) = Value::lookup(entry, key) else {
        return Ok(None);
    };
    let list = value
        .list()
        .ok_or_else(|| MetainfoError::invalid("path is not a list"))?;

    let mut components = Vec::with_capacity(list.len());
    for component in list {
        let component = component
            .str()
            .ok_or_else(|| MetainfoError::invalid("path component is not UTF-8"))?;
        if component.is_empty() {
            return Err(MetainfoError::invalid("empty path component"));
        }
        components.push(component.to_owned());
    }
    if components.is_empty() {
        return Err(MetainfoError::invalid("path has no components"));
    }
    Ok(Some(components))
}

fn parse_v2(entries: &DictEntries<'_>) -> Result<TorrentV2Info, MetainfoError> {
    let name = required_str(entries, b"name")?;
    let piece_length = required_positive_int(entries, b"piece length")?;
    if !piece_length.is_power_of_two() || piece_length < MIN_PIECE_LENGTH {
        return Err(MetainfoError::invalid(format!(
            "v2 piece length {piece_length} is not a power of two of at least 16 KiB"
        )));
    }

    let file_tree = Value::lookup(entries, b"file tree")
        .ok_or_else(|| MetainfoError::invalid("v2 info has no file tree"))?;
    let file_tree = parse_file_tree_children(
        file_tree
            .dict()
            .ok_or_else(|| MetainfoError::invalid("file tree is not a dictionary"))?,
    )?;

    let piece_layers = Value::lookup(entries, b"piece layers")
        .ok_or_else(|| MetainfoError::invalid("v2 info has no piece layers"))?;
    let piece_layers = parse_piece_layers(
        piece_layers
            .dict()
            .ok_or_else(|| MetainfoError::invalid("piece layers is not a dictionary"))?,
        piece_length,
    )?;

    let info = TorrentV2Info {
        name,
        piece_length,
        file_tree,
        piece_layers,
        private: parse_private(entries),
    };
    info.validate()?;
    Ok(info)
}

/// Recursive file-tree parsing: a child dictionary whose only key is
/// the empty string is a file node; anything else is a directory of
/// further children.
fn parse_file_tree_children(
    entries: &DictEntries<'_>,
) -> Result<BTreeMap<String, FileTreeNode>, MetainfoError> {
    let mut children = BTreeMap::new();

    for (key, value) in entries {
        let name = std::str::from_utf8(key)
            .map_err(|_| MetainfoError::invalid("file tree name is not UTF-8"))?;
        if name.is_empty() {
            return Err(MetainfoError::invalid("file tree entry with an empty name"));
        }
        if name.contains('/') {
            return Err(MetainfoError::invalid(format!(
                "file tree name {name:?} contains a path separator"
            )));
        }

        let node_entries = value
            .dict()
            .ok_or_else(|| MetainfoError::invalid(format!("file tree entry {name:?} is not a dictionary")))?;

        let node = if let Some(file_info) = Value::lookup(node_entries, b"") {
            if node_entries.len() > 1 {
                return Err(MetainfoError::invalid(format!(
                    "file node {name:?} mixes file metadata with children"
                )));
            }
            parse_file_node(name, file_info)?
        } else {
            FileTreeNode::Directory {
                children: parse_file_tree_children(node_entries)?,
            }
        };

        children.insert(name.to_owned(), node);
    }

    Ok(children)
}

fn parse_file_node(name: &str, file_info: &Value<'_>) -> Result<FileTreeNode, MetainfoError> {
    let entries = file_info
        .dict()
        .ok_or_else(|| MetainfoError::invalid(format!("file node {name:?} metadata is not a dictionary")))?;

    let length = Value::lookup(entries, b"length")
        .and_then(Value::int)
        .filter(|length| *length >= 0)
        .ok_or_else(|| MetainfoError::invalid(format!("file node {name:?} has no valid length")))?;

    let pieces_root: [u8; 32] = Value::lookup(entries, b"pieces root")
        .and_then(Value::bytes)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            MetainfoError::invalid(format!("file node {name:?} has no 32-byte pieces root"))
        })?;

    Ok(FileTreeNode::File {
        length: unsigned(length),
        pieces_root,
    })
}

/// A checked-by-construction non-negative integer as `u64`.
fn unsigned(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_piece_layers(
    entries: &DictEntries<'_>,
    piece_length: u64,
) -> Result<BTreeMap<[u8; 32], PieceLayer>, MetainfoError> {
    let mut layers = BTreeMap::new();

    for (key, value) in entries {
        let pieces_root: [u8; 32] = (*key)
            .try_into()
            .map_err(|_| MetainfoError::invalid("piece layers key is not a 32-byte pieces root"))?;

        let layer_bytes = value
            .bytes()
            .ok_or_else(|| MetainfoError::invalid("piece layer is not a byte string"))?;
        if layer_bytes.len() % 32 != 0 {
            return Err(MetainfoError::invalid(format!(
                "piece layer length {} is not a multiple of 32",
                layer_bytes.len()
            )));
        }

        let hashes: Vec<[u8; 32]> = layer_bytes
            .chunks_exact(32)
            .map(|chunk| chunk.try_into().expect("chunk is 32 bytes"))
            .collect();

        layers.insert(
            pieces_root,
            PieceLayer {
                piece_length,
                hashes,
            },
        );
    }

    Ok(layers)
}

fn parse_private(entries: &DictEntries<'_>) -> bool {
    Value::lookup(entries, b"private").and_then(Value::int) == Some(1)
}

fn parse_announce_list(root: &DictEntries<'_>) -> Result<Option<Vec<Vec<String>>>, MetainfoError> {
    let Some(value) = Value::lookup(root, b"announce-list") else {
        return Ok(None);
    };
    let tiers = value
        .list()
        .ok_or_else(|| MetainfoError::invalid("announce-list is not a list"))?;

    let mut parsed = Vec::with_capacity(tiers.len());
    for tier in tiers {
        let tier = tier
            .list()
            .ok_or_else(|| MetainfoError::invalid("announce-list tier is not a list"))?;
        let mut urls = Vec::with_capacity(tier.len());
        for url in tier {
            urls.push(
                url.str()
                    .ok_or_else(|| MetainfoError::invalid("announce URL is not UTF-8"))?
                    .to_owned(),
            );
        }
        parsed.push(urls);
    }
    Ok(Some(parsed))
}

/// `url-list` is a list of web seeds, or a single byte string when
/// there is only one.
fn parse_web_seeds(root: &DictEntries<'_>) -> Result<Vec<String>, MetainfoError> {
    let Some(value) = Value::lookup(root, b"url-list") else {
        return Ok(Vec::new());
    };

    if let Some(single) = value.str() {
        return Ok(vec![single.to_owned()]);
    }

    let list = value
        .list()
        .ok_or_else(|| MetainfoError::invalid("url-list is neither a string nor a list"))?;
    let mut seeds = Vec::with_capacity(list.len());
    for seed in list {
        seeds.push(
            seed.str()
                .ok_or_else(|| MetainfoError::invalid("web seed URL is not UTF-8"))?
                .to_owned(),
        );
    }
    Ok(seeds)
}

fn required_str(entries: &DictEntries<'_>, key: &[u8]) -> Result<String, MetainfoError> {
    Value::lookup(entries, key)
        .and_then(Value::str)
        .map(str::to_owned)
        .ok_or_else(|| {
            MetainfoError::invalid(format!(
                "missing or non-UTF-8 field {:?}",
                String::from_utf8_lossy(key)
            ))
        })
}

fn optional_str(entries: &DictEntries<'_>, key: &[u8]) -> Result<Option<String>, MetainfoError> {
    match Value::lookup(entries, key) {
        None => Ok(None),
        Some(value) => value.str().map(str::to_owned).map(Some).ok_or_else(|| {
            MetainfoError::invalid(format!(
                "field {:?} is not UTF-8",
                String::from_utf8_lossy(key)
            ))
        }),
    }
}

fn optional_int(entries: &DictEntries<'_>, key: &[u8]) -> Option<i64> {
    Value::lookup(entries, key).and_then(Value::int)
}

fn required_positive_int(entries: &DictEntries<'_>, key: &[u8]) -> Result<u64, MetainfoError> {
    let value = Value::lookup(entries, key)
        .and_then(Value::int)
        .filter(|value| *value > 0)
        .ok_or_else(|| {
            MetainfoError::invalid(format!(
                "missing or non-positive field {:?}",
                String::from_utf8_lossy(key)
            ))
        })?;
    Ok(unsigned(value))
}

fn required_bytes<'a>(entries: &DictEntries<'a>, key: &[u8]) -> Result<&'a [u8], MetainfoError> {
    Value::lookup(entries, key).and_then(Value::bytes).ok_or_else(|| {
        MetainfoError::invalid(format!(
            "missing byte field {:?}",
            String::from_utf8_lossy(key)
        ))
    })
}
