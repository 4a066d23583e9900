//! The `inspect` command.
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use crate::metainfo::parser;

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// The torrent file to parse.
    pub torrent: PathBuf,
}

pub fn run(args: &InspectArgs) -> anyhow::Result<()> {
    let bytes = std::fs::read(&args.torrent)
        .with_context(|| format!("reading {}", args.torrent.display()))?;
    let torrent = parser::parse(&bytes)
        .with_context(|| format!("parsing {}", args.torrent.display()))?;

    let version = match torrent.info.meta_version() {
        None => "v1".to_owned(),
        Some(2) => "v2".to_owned(),
        Some(3) => "hybrid".to_owned(),
        Some(other) => format!("meta version {other}"),
    };

    println!("{}", args.torrent.display());
    println!("  name:         {}", torrent.info.name());
    println!("  format:       {version}");
    println!("  piece length: {}", torrent.info.piece_length());
    println!("  total length: {}", torrent.info.total_length());
    println!("  info hash v1: {}", torrent.info_hash);
    if let Some(info_hash_v2) = torrent.info_hash_v2 {
        println!("  info hash v2: {info_hash_v2}");
    }
    if torrent.info.is_private() {
        println!("  private:      yes");
    }
    for tracker in torrent.trackers() {
        println!("  tracker:      {tracker}");
    }
    for seed in &torrent.web_seeds {
        println!("  web seed:     {seed}");
    }

    Ok(())
}
