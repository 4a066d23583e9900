//! The `create` command.
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{ArgGroup, Args};
use url::Url;

use crate::config::Configuration;
use crate::metainfo::generator::{self, GenerateOptions, TorrentVersion};

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("format").required(true).args(["v1", "v2", "hybrid"])))]
pub struct CreateArgs {
    /// Source file or directory.
    pub source: PathBuf,

    /// Create a v1 (BEP 3) torrent.
    #[arg(long)]
    pub v1: bool,

    /// Create a v2 (BEP 52) torrent.
    #[arg(long)]
    pub v2: bool,

    /// Create a hybrid torrent carrying both identities.
    #[arg(long)]
    pub hybrid: bool,

    /// Piece length in bytes; a power of two of at least 16 KiB.
    /// Picked from the content size when omitted.
    #[arg(long)]
    pub piece_length: Option<u64>,

    /// Tracker announce URL; repeatable, first becomes `announce`.
    #[arg(long = "tracker")]
    pub trackers: Vec<String>,

    /// Web seed URL (BEP 19); repeatable.
    #[arg(long = "web-seed")]
    pub web_seeds: Vec<String>,

    /// Free-form comment stored in the torrent.
    #[arg(long)]
    pub comment: Option<String>,

    /// Mark the torrent private (BEP 27).
    #[arg(long)]
    pub private: bool,

    /// Output path; defaults to `<source>.torrent`. A directory puts
    /// the file inside it.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

pub fn run(args: &CreateArgs, configuration: &Configuration) -> anyhow::Result<()> {
    let version = if args.v1 {
        TorrentVersion::V1
    } else if args.v2 {
        TorrentVersion::V2
    } else {
        TorrentVersion::Hybrid
    };

    if let Some(piece_length) = args.piece_length {
        generator::validate_piece_length(piece_length)?;
    }

    for tracker in &args.trackers {
        Url::parse(tracker).with_context(|| format!("invalid tracker URL {tracker:?}"))?;
    }
    for seed in &args.web_seeds {
        Url::parse(seed).with_context(|| format!("invalid web seed URL {seed:?}"))?;
    }

    let options = GenerateOptions {
        version,
        piece_length: args.piece_length,
        trackers: args.trackers.clone(),
        web_seeds: args.web_seeds.clone(),
        comment: args.comment.clone(),
        created_by: configuration.console.created_by.clone(),
        private: args.private,
    };

    let generated = generator::generate(&args.source, &options)
        .with_context(|| format!("generating torrent from {}", args.source.display()))?;

    let output = resolve_output_path(&args.source, args.output.as_deref());
    std::fs::write(&output, &generated.bytes)
        .with_context(|| format!("writing torrent to {}", output.display()))?;

    println!("created {}", output.display());
    println!("  info hash v1: {}", generated.torrent.info_hash);
    if let Some(info_hash_v2) = generated.torrent.info_hash_v2 {
        println!("  info hash v2: {info_hash_v2}");
    }
    println!("  piece length: {}", generated.torrent.info.piece_length());
    println!("  total length: {}", generated.torrent.info.total_length());

    Ok(())
}

/// `<source>.torrent` next to the source by default; a directory output
/// receives the file inside.
fn resolve_output_path(source: &Path, output: Option<&Path>) -> PathBuf {
    let default_name = format!(
        "{}.torrent",
        source
            .file_name()
            .map_or_else(|| "output".into(), |name| name.to_string_lossy())
    );

    match output {
        None => source.with_file_name(&default_name),
        Some(path) if path.is_dir() => path.join(default_name),
        Some(path) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::resolve_output_path;

    #[test]
    fn it_should_default_to_source_dot_torrent() {
        assert_eq!(
            resolve_output_path(Path::new("dir/data.bin"), None),
            PathBuf::from("dir/data.bin.torrent")
        );
    }

    #[test]
    fn it_should_place_the_file_inside_an_output_directory() {
        let workspace = tempfile::tempdir().unwrap();

        let output = resolve_output_path(Path::new("data.bin"), Some(workspace.path()));

        assert_eq!(output, workspace.path().join("data.bin.torrent"));
    }

    #[test]
    fn it_should_use_an_explicit_output_file_verbatim() {
        assert_eq!(
            resolve_output_path(Path::new("data.bin"), Some(Path::new("custom.torrent"))),
            PathBuf::from("custom.torrent")
        );
    }
}
