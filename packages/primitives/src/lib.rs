//! Primitive types shared by the torrkit packages.
//!
//! A torrent is identified on a swarm by the hash of its bencoded info
//! dictionary. BitTorrent v1 (BEP 3) uses a 20-byte SHA-1 digest, v2
//! (BEP 52) a 32-byte SHA-256 digest, and a hybrid torrent carries both,
//! so the two identities get their own value types:
//!
//! - [`InfoHash`](crate::info_hash::InfoHash): the v1 identity.
//! - [`InfoHashV2`](crate::info_hash_v2::InfoHashV2): the v2 identity.
pub mod info_hash;
pub mod info_hash_v2;

pub use info_hash::InfoHash;
pub use info_hash_v2::InfoHashV2;
