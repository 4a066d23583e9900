//! Torrkit: a `BitTorrent` client core.
//!
//! Two subsystems carry the weight, joined only at the outermost
//! boundary:
//!
//! - [`transport`]: uTP (BEP 29), a reliable, ordered, congestion
//!   controlled byte stream over UDP, with selective acknowledgment,
//!   delayed acknowledgment, window scaling and ECN. Peer sessions get
//!   a plain byte-stream facade from it.
//! - [`metainfo`]: the torrent metadata engine for v1 (BEP 3), v2
//!   (BEP 52) and hybrid torrents, including Merkle piece layers,
//!   file-tree hashing and the dual info-hash identity hybrids need to
//!   join both swarm generations.
//!
//! Around them sit the usual application layers: [`config`] for the
//! TOML configuration, [`bootstrap`] for logging and job startup,
//! [`app`] to wire a configuration into running services and
//! [`console`] for the `torrkit` binary.
pub mod app;
pub mod bootstrap;
pub mod config;
pub mod console;
pub mod metainfo;
pub mod transport;
