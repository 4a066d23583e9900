//! Generating torrents from a filesystem source.
//!
//! The generator enumerates the source files in canonical order, hashes
//! their content (SHA-1 stream pieces for v1, per-file SHA-256 piece
//! layers for v2), assembles the info dictionary with the canonical
//! bencode encoder and computes the info hash identity. The finished
//! bytes are run back through the parser, so every generated torrent is
//! known to round-trip before it is handed out.
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::debug;

use torrkit_contrib_bencode::BencodeValue;

use super::error::MetainfoError;
use super::file_tree::{FileTreeNode, PieceLayer};
use super::merkle;
use super::parser;
use super::torrent::Torrent;
use super::{METAINFO_LOG_TARGET, MIN_PIECE_LENGTH};

/// Which metadata format(s) the generated torrent carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentVersion {
    V1,
    V2,
    Hybrid,
}

/// Everything configurable about one generation run.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub version: TorrentVersion,
    /// Power of two, at least 16 KiB; picked from the content size when
    /// absent.
    pub piece_length: Option<u64>,
    /// Announce URLs; the first becomes `announce`, all of them become
    /// single-URL tiers of `announce-list`.
    pub trackers: Vec<String>,
    /// BEP 19 web seeds for `url-list`.
    pub web_seeds: Vec<String>,
    pub comment: Option<String>,
    pub created_by: String,
    /// BEP 27 private flag.
    pub private: bool,
}

impl GenerateOptions {
    #[must_use]
    pub fn new(version: TorrentVersion) -> GenerateOptions {
        GenerateOptions {
            version,
            piece_length: None,
            trackers: Vec::new(),
            web_seeds: Vec::new(),
            comment: None,
            created_by: format!("torrkit {}", env!("CARGO_PKG_VERSION")),
            private: false,
        }
    }
}

/// A finished generation run: the file bytes and the parsed-back model.
#[derive(Debug)]
pub struct GeneratedTorrent {
    pub bytes: Vec<u8>,
    pub torrent: Torrent,
}

/// One file of the source, with its path relative to the torrent root.
struct SourceFile {
    relative: Vec<String>,
    absolute: PathBuf,
    length: u64,
}

/// Generates a torrent from a file or directory.
///
/// # Errors
///
/// Will return `MetainfoError::Io` when the source cannot be read and
/// `MetainfoError::InvalidTorrent` for an unusable piece length or an
/// empty source directory.
pub fn generate(source: &Path, options: &GenerateOptions) -> Result<GeneratedTorrent, MetainfoError> {
    let files = collect_files(source)?;
    if files.is_empty() {
        return Err(MetainfoError::invalid(format!(
            "no files found under {}",
            source.display()
        )));
    }

    let total_length: u64 = files.iter().map(|file| file.length).sum();
    let piece_length = match options.piece_length {
        Some(piece_length) => piece_length,
        None => auto_piece_length(total_length),
    };
    validate_piece_length(piece_length)?;

    let name = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| MetainfoError::invalid("source path has no file name"))?;

    debug!(
        target: METAINFO_LOG_TARGET,
        source = %source.display(),
        files = files.len(),
        total_length,
        piece_length,
        "generating torrent"
    );

    let single_file = files.len() == 1 && !source.is_dir();

    let mut info = BencodeValue::new_dict();
    info.insert(b"name", BencodeValue::bytes(name.as_bytes()));
    #[allow(clippy::cast_possible_wrap)]
    info.insert(b"piece length", BencodeValue::Int(piece_length as i64));

    if matches!(options.version, TorrentVersion::V1 | TorrentVersion::Hybrid) {
        info.insert(b"pieces", BencodeValue::Bytes(v1_stream_pieces(&files, piece_length)?));

        if single_file {
            #[allow(clippy::cast_possible_wrap)]
            info.insert(b"length", BencodeValue::Int(files[0].length as i64));
        } else {
            info.insert(b"files", v1_file_list(&files));
        }
    }

    if matches!(options.version, TorrentVersion::V2 | TorrentVersion::Hybrid) {
        let (file_tree, piece_layers) = v2_tree_and_layers(&files, piece_length)?;
        info.insert(b"file tree", file_tree_to_bencode(&file_tree));
        info.insert(b"piece layers", piece_layers_to_bencode(&piece_layers));
        let meta_version = match options.version {
            TorrentVersion::V2 => 2,
            TorrentVersion::Hybrid => 3,
            TorrentVersion::V1 => unreachable!(),
        };
        info.insert(b"meta version", BencodeValue::Int(meta_version));
    }

    if options.private {
        info.insert(b"private", BencodeValue::Int(1));
    }

    let mut container = BencodeValue::new_dict();
    container.insert(b"info", info);

    if let Some(first) = options.trackers.first() {
        container.insert(b"announce", BencodeValue::bytes(first.as_bytes()));
    }
    if options.trackers.len() > 1 {
        let mut tiers = BencodeValue::new_list();
        for tracker in &options.trackers {
            let mut tier = BencodeValue::new_list();
            tier.push(BencodeValue::bytes(tracker.as_bytes()));
            tiers.push(tier);
        }
        container.insert(b"announce-list", tiers);
    }
    if let Some(comment) = &options.comment {
        container.insert(b"comment", BencodeValue::bytes(comment.as_bytes()));
    }
    container.insert(b"created by", BencodeValue::bytes(options.created_by.as_bytes()));
    container.insert(b"creation date", BencodeValue::Int(unix_timestamp()));
    if !options.web_seeds.is_empty() {
        let mut seeds = BencodeValue::new_list();
        for seed in &options.web_seeds {
            seeds.push(BencodeValue::bytes(seed.as_bytes()));
        }
        container.insert(b"url-list", seeds);
    }

    let bytes = container.encode();

    // Parsing the product back validates every invariant the parser
    // enforces and yields the model with both info hashes.
    let torrent = parser::parse(&bytes)?;

    debug!(
        target: METAINFO_LOG_TARGET,
        info_hash = %torrent.info_hash,
        hybrid = torrent.is_hybrid(),
        "generated torrent"
    );

    Ok(GeneratedTorrent { bytes, torrent })
}

/// The default piece length for a content size: 16 KiB below 16 MiB,
/// 256 KiB below 512 MiB, 1 MiB above.
#[must_use]
pub fn auto_piece_length(total_length: u64) -> u64 {
    const MIB: u64 = 1024 * 1024;
    if total_length < 16 * MIB {
        16 * 1024
    } else if total_length < 512 * MIB {
        256 * 1024
    } else {
        MIB
    }
}

/// Enforces the piece-length contract: a power of two of at least
/// 16 KiB.
///
/// # Errors
///
/// Will return `MetainfoError::InvalidTorrent` otherwise.
pub fn validate_piece_length(piece_length: u64) -> Result<(), MetainfoError> {
    if !piece_length.is_power_of_two() || piece_length < MIN_PIECE_LENGTH {
        return Err(MetainfoError::invalid(format!(
            "piece length {piece_length} is not a power of two of at least 16 KiB"
        )));
    }
    Ok(())
}

/// Enumerates the source files with paths relative to the torrent
/// root, sorted by path so the layout is canonical.
fn collect_files(source: &Path) -> Result<Vec<SourceFile>, MetainfoError> {
    let metadata = std::fs::metadata(source).map_err(|e| io_error(source, e))?;

    let mut files = Vec::new();
    if metadata.is_file() {
        let name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| MetainfoError::invalid("source path has no file name"))?;
        files.push(SourceFile {
            relative: vec![name],
            absolute: source.to_path_buf(),
            length: metadata.len(),
        });
    } else {
        walk_directory(source, &mut Vec::new(), &mut files)?;
        files.sort_by(|a, b| a.relative.cmp(&b.relative));
    }
    Ok(files)
}

fn walk_directory(
    directory: &Path,
    prefix: &mut Vec<String>,
    files: &mut Vec<SourceFile>,
) -> Result<(), MetainfoError> {
    let entries = std::fs::read_dir(directory).map_err(|e| io_error(directory, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| io_error(directory, e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let metadata = std::fs::metadata(&path).map_err(|e| io_error(&path, e))?;

        if metadata.is_dir() {
            prefix.push(name);
            walk_directory(&path, prefix, files)?;
            prefix.pop();
        } else if metadata.is_file() {
            let mut relative = prefix.clone();
            relative.push(name);
            files.push(SourceFile {
                relative,
                absolute: path,
                length: metadata.len(),
            });
        }
    }
    Ok(())
}

/// SHA-1 pieces over the whole content stream, spanning file
/// boundaries, one digest per `piece_length` bytes.
fn v1_stream_pieces(files: &[SourceFile], piece_length: u64) -> Result<Vec<u8>, MetainfoError> {
    let piece_length = usize::try_from(piece_length).expect("piece length fits in usize");
    let mut pieces = Vec::new();
    let mut current = Vec::with_capacity(piece_length);
    let mut buffer = vec![0u8; 64 * 1024];

    for file in files {
        let mut handle = File::open(&file.absolute).map_err(|e| io_error(&file.absolute, e))?;
        loop {
            let read = handle.read(&mut buffer).map_err(|e| io_error(&file.absolute, e))?;
            if read == 0 {
                break;
            }
            let mut slice = &buffer[..read];
            while !slice.is_empty() {
                let missing = piece_length - current.len();
                let take = missing.min(slice.len());
                current.extend_from_slice(&slice[..take]);
                slice = &slice[take..];

                if current.len() == piece_length {
                    pieces.extend_from_slice(&Sha1::digest(&current));
                    current.clear();
                }
            }
        }
    }

    if !current.is_empty() {
        pieces.extend_from_slice(&Sha1::digest(&current));
    }

    Ok(pieces)
}

fn v1_file_list(files: &[SourceFile]) -> BencodeValue {
    let mut list = BencodeValue::new_list();
    for file in files {
        let mut entry = BencodeValue::new_dict();
        #[allow(clippy::cast_possible_wrap)]
        entry.insert(b"length", BencodeValue::Int(file.length as i64));
        let mut path = BencodeValue::new_list();
        for component in &file.relative {
            path.push(BencodeValue::bytes(component.as_bytes()));
        }
        entry.insert(b"path", path);
        list.push(entry);
    }
    list
}

/// Per-file SHA-256 piece hashing: the file tree with pieces-roots and
/// the layer map for every multi-piece file.
fn v2_tree_and_layers(
    files: &[SourceFile],
    piece_length: u64,
) -> Result<(BTreeMap<String, FileTreeNode>, BTreeMap<[u8; 32], PieceLayer>), MetainfoError> {
    let mut tree: BTreeMap<String, FileTreeNode> = BTreeMap::new();
    let mut layers: BTreeMap<[u8; 32], PieceLayer> = BTreeMap::new();

    for file in files {
        let hashes = v2_file_piece_hashes(&file.absolute, piece_length)?;
        let pieces_root = merkle::pieces_root(&hashes);

        if hashes.len() > 1 {
            layers.insert(
                pieces_root,
                PieceLayer {
                    piece_length,
                    hashes,
                },
            );
        }

        let node = FileTreeNode::File {
            length: file.length,
            pieces_root,
        };

        // A single-file torrent nests its one file under its own name,
        // which is exactly its relative path; directory sources mirror
        // their layout the same way.
        insert_into_tree(&mut tree, &file.relative, node);
    }

    Ok((tree, layers))
}

fn insert_into_tree(tree: &mut BTreeMap<String, FileTreeNode>, components: &[String], node: FileTreeNode) {
    match components {
        [] => {}
        [leaf] => {
            tree.insert(leaf.clone(), node);
        }
        [directory, rest @ ..] => {
            let entry = tree
                .entry(directory.clone())
                .or_insert_with(|| FileTreeNode::Directory {
                    children: BTreeMap::new(),
                });
            if let FileTreeNode::Directory { children } = entry {
                insert_into_tree(children, rest, node);
            }
        }
    }
}

fn v2_file_piece_hashes(path: &Path, piece_length: u64) -> Result<Vec<[u8; 32]>, MetainfoError> {
    let piece_length = usize::try_from(piece_length).expect("piece length fits in usize");
    let mut handle = File::open(path).map_err(|e| io_error(path, e))?;
    let mut hashes = Vec::new();
    let mut piece = vec![0u8; piece_length];

    loop {
        let mut filled = 0;
        while filled < piece_length {
            let read = handle
                .read(&mut piece[filled..])
                .map_err(|e| io_error(path, e))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        if filled == 0 {
            break;
        }
        hashes.push(Sha256::digest(&piece[..filled]).into());
        if filled < piece_length {
            break;
        }
    }

    Ok(hashes)
}

fn file_tree_to_bencode(tree: &BTreeMap<String, FileTreeNode>) -> BencodeValue {
    let mut dict = BencodeValue::new_dict();
    for (name, node) in tree {
        dict.insert(name.as_bytes(), node_to_bencode(node));
    }
    dict
}

fn node_to_bencode(node: &FileTreeNode) -> BencodeValue {
    match node {
        FileTreeNode::File { length, pieces_root } => {
            let mut file_info = BencodeValue::new_dict();
            #[allow(clippy::cast_possible_wrap)]
            file_info.insert(b"length", BencodeValue::Int(*length as i64));
            file_info.insert(b"pieces root", BencodeValue::bytes(pieces_root));
            let mut wrapper = BencodeValue::new_dict();
            wrapper.insert(b"", file_info);
            wrapper
        }
        FileTreeNode::Directory { children } => file_tree_to_bencode(children),
    }
}

fn piece_layers_to_bencode(layers: &BTreeMap<[u8; 32], PieceLayer>) -> BencodeValue {
    let mut dict = BencodeValue::new_dict();
    for (pieces_root, layer) in layers {
        let mut concatenated = Vec::with_capacity(layer.hashes.len() * 32);
        for hash in &layer.hashes {
            concatenated.extend_from_slice(hash);
        }
        dict.insert(pieces_root, BencodeValue::Bytes(concatenated));
    }
    dict
}

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(0))
}

fn io_error(path: &Path, source: std::io::Error) -> MetainfoError {
    MetainfoError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use sha1::Sha1;
    use sha2::{Digest, Sha256};

    use super::{auto_piece_length, generate, validate_piece_length, GenerateOptions, TorrentVersion};
    use crate::metainfo::error::MetainfoError;
    use crate::metainfo::merkle;
    use crate::metainfo::parser;
    use crate::metainfo::torrent::{Info, V1FileLayout};

    fn write_file(directory: &Path, name: &str, content: &[u8]) {
        fs::write(directory.join(name), content).unwrap();
    }

    #[test]
    fn it_should_pick_the_piece_length_from_the_content_size() {
        assert_eq!(auto_piece_length(1000), 16 * 1024);
        assert_eq!(auto_piece_length(15 * 1024 * 1024), 16 * 1024);
        assert_eq!(auto_piece_length(100 * 1024 * 1024), 256 * 1024);
        assert_eq!(auto_piece_length(600 * 1024 * 1024), 1024 * 1024);
    }

    #[test]
    fn it_should_reject_piece_lengths_that_break_the_contract() {
        assert!(matches!(
            validate_piece_length(15_000).unwrap_err(),
            MetainfoError::InvalidTorrent { .. }
        ));
        assert!(matches!(
            validate_piece_length(8192).unwrap_err(),
            MetainfoError::InvalidTorrent { .. }
        ));
        validate_piece_length(16_384).unwrap();
        validate_piece_length(1 << 20).unwrap();
    }

    #[test]
    fn it_should_generate_a_hybrid_torrent_with_both_identities() {
        // 33 000 bytes at 16 KiB pieces: two full pieces and a 232-byte
        // tail, on both sides of the hybrid.
        let workspace = tempfile::tempdir().unwrap();
        let source = workspace.path().join("payload.bin");
        let content: Vec<u8> = (0..33_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &content).unwrap();

        let mut options = GenerateOptions::new(TorrentVersion::Hybrid);
        options.piece_length = Some(16_384);
        options.trackers = vec!["http://tracker.example/announce".to_owned()];
        let generated = generate(&source, &options).unwrap();

        let torrent = &generated.torrent;
        assert_eq!(torrent.info.meta_version(), Some(3));
        assert_eq!(torrent.info.total_length(), 33_000);
        assert_eq!(torrent.info_hash.bytes().len(), 20);
        assert_eq!(torrent.info_hash_v2.unwrap().bytes().len(), 32);

        let Info::Hybrid { v1, v2 } = &torrent.info else {
            panic!("expected a hybrid info");
        };

        // v1: three SHA-1 pieces over the stream.
        assert_eq!(v1.num_pieces(), 3);
        let expected_first: [u8; 20] = Sha1::digest(&content[..16_384]).into();
        let expected_last: [u8; 20] = Sha1::digest(&content[32_768..]).into();
        assert_eq!(v1.pieces[0], expected_first);
        assert_eq!(v1.pieces[2], expected_last);
        assert_eq!(content.len() - 32_768, 232);

        // v2: three SHA-256 digests in the file's piece layer, hashing
        // to the pieces-root in the tree.
        let files = v2.files();
        assert_eq!(files.len(), 1);
        let (_, length, pieces_root) = &files[0];
        assert_eq!(*length, 33_000);
        let layer = v2.piece_layer(pieces_root).unwrap();
        assert_eq!(layer.num_pieces(), 3);
        let expected_piece: [u8; 32] = Sha256::digest(&content[..16_384]).into();
        assert_eq!(layer.hashes[0], expected_piece);
        assert_eq!(merkle::pieces_root(&layer.hashes), *pieces_root);
    }

    #[test]
    fn it_should_span_v1_pieces_across_file_boundaries() {
        let workspace = tempfile::tempdir().unwrap();
        let source = workspace.path().join("pack");
        fs::create_dir(&source).unwrap();
        write_file(&source, "a.bin", &[0x11u8; 10_000]);
        write_file(&source, "b.bin", &[0x22u8; 10_000]);

        let mut options = GenerateOptions::new(TorrentVersion::V1);
        options.piece_length = Some(16_384);
        let generated = generate(&source, &options).unwrap();

        let Info::V1(v1) = &generated.torrent.info else {
            panic!("expected a v1 info");
        };
        assert_eq!(v1.num_pieces(), 2);

        // The first piece covers all of a.bin and the head of b.bin.
        let mut stream = vec![0x11u8; 10_000];
        stream.extend_from_slice(&[0x22u8; 6_384]);
        let expected: [u8; 20] = Sha1::digest(&stream).into();
        assert_eq!(v1.pieces[0], expected);
    }

    #[test]
    fn it_should_generate_a_v2_torrent_whose_model_round_trips() {
        let workspace = tempfile::tempdir().unwrap();
        let source = workspace.path().join("album");
        fs::create_dir(&source).unwrap();
        fs::create_dir(source.join("inner")).unwrap();
        write_file(&source, "one.bin", &vec![0xAAu8; 20_000]);
        write_file(&source.join("inner"), "two.bin", &[0xBBu8; 123]);
        write_file(&source, "empty.bin", b"");

        let mut options = GenerateOptions::new(TorrentVersion::V2);
        options.piece_length = Some(16_384);
        options.comment = Some("round trip".to_owned());
        let generated = generate(&source, &options).unwrap();

        let reparsed = parser::parse(&generated.bytes).unwrap();
        assert_eq!(reparsed, generated.torrent);

        let Info::V2(v2) = &reparsed.info else {
            panic!("expected a v2 info");
        };
        let files = v2.files();
        let paths: Vec<&str> = files.iter().map(|(path, _, _)| path.as_str()).collect();
        assert_eq!(paths, vec!["empty.bin", "inner/two.bin", "one.bin"]);

        // The empty file carries the conventional all-zero root and no
        // layer.
        let empty = files.iter().find(|(path, _, _)| path == "empty.bin").unwrap();
        assert_eq!(empty.2, merkle::EMPTY_PIECES_ROOT);
        assert!(v2.piece_layer(&empty.2).is_none());

        // The single-piece file has its digest as root and no layer.
        let small = files.iter().find(|(path, _, _)| path == "inner/two.bin").unwrap();
        assert_eq!(small.2, merkle::hash_piece(&[0xBBu8; 123]));
    }

    #[test]
    fn it_should_write_announce_tiers_comment_and_private_flag() {
        let workspace = tempfile::tempdir().unwrap();
        let source = workspace.path().join("solo.bin");
        fs::write(&source, b"small content").unwrap();

        let mut options = GenerateOptions::new(TorrentVersion::V1);
        options.trackers = vec![
            "http://a.example/announce".to_owned(),
            "udp://b.example:6969".to_owned(),
        ];
        options.comment = Some("hello".to_owned());
        options.private = true;
        options.web_seeds = vec!["http://seed.example/".to_owned()];
        let generated = generate(&source, &options).unwrap();

        let torrent = &generated.torrent;
        assert_eq!(torrent.announce.as_deref(), Some("http://a.example/announce"));
        assert_eq!(
            torrent.announce_list,
            Some(vec![
                vec!["http://a.example/announce".to_owned()],
                vec!["udp://b.example:6969".to_owned()],
            ])
        );
        assert_eq!(torrent.comment.as_deref(), Some("hello"));
        assert!(torrent.info.is_private());
        assert_eq!(torrent.web_seeds, vec!["http://seed.example/".to_owned()]);
        assert!(torrent.created_by.as_deref().unwrap_or("").starts_with("torrkit"));
        assert!(matches!(
            torrent.info,
            Info::V1(ref v1) if matches!(v1.layout, V1FileLayout::Single { length: 13 })
        ));
    }

    #[test]
    fn it_should_fail_on_a_missing_source() {
        let workspace = tempfile::tempdir().unwrap();
        let missing = workspace.path().join("not-there");

        assert!(matches!(
            generate(&missing, &GenerateOptions::new(TorrentVersion::V1)).unwrap_err(),
            MetainfoError::Io { .. }
        ));
    }

    #[test]
    fn it_should_fail_on_an_empty_directory() {
        let workspace = tempfile::tempdir().unwrap();
        let source = workspace.path().join("hollow");
        fs::create_dir(&source).unwrap();

        assert!(matches!(
            generate(&source, &GenerateOptions::new(TorrentVersion::V1)).unwrap_err(),
            MetainfoError::InvalidTorrent { .. }
        ));
    }
}
