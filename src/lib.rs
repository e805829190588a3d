//! # Trellis
//!
//! A permissioned DAG consensus engine:
//! - **Heaviest-chain fork choice** — blocks carry a cumulative weight;
//!   ties between equal-weight forks break on a deterministic numeric
//!   projection of the block hash, so every replica picks the same winner
//! - **Uncle rewards** — competing siblings that lose a fork race are
//!   referenced by later blocks and add to the including block's weight
//! - **Proof-of-work sealing** — block identity is a SHA-512 hash found by
//!   a nonce loop against an application-supplied approval predicate
//! - **Rebaseable world state** — a fingerprinted key/value view that can be
//!   moved to any persisted fingerprint, with a transaction registry that
//!   survives reorganizations
//!
//! The crate deliberately stops at the consensus boundary: peer transport,
//! wire framing, and application transaction semantics live with the caller.

pub mod consensus;
pub mod db;
pub mod state;
pub mod transaction;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

/// Protocol constants
pub mod constants {
    /// System-wide cap on blocks returned by a single descendants query
    pub const MAX_DESCENDANTS: usize = 100;
    /// How far above an uncle's depth a block may still reference it
    pub const MAX_UNCLE_DISTANCE: u64 = 6;
    /// Wall-clock bound on a single hash computation, in seconds
    pub const HASH_TIMEOUT_SECS: u64 = 10;
}

/// Byte width of every identity in the protocol.
pub const HASH_LEN: usize = 64;

/// 64-byte identity used for block hashes, parent and uncle references,
/// world-state fingerprints, and transaction ids. Equality is byte equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// The all-zero hash; parent reference of the genesis block.
    pub const ZERO: Hash = Hash([0u8; HASH_LEN]);

    /// Build a hash from raw bytes. Shorter input is zero-padded on the
    /// right, longer input is truncated to [`HASH_LEN`].
    pub fn from_bytes(source: &[u8]) -> Self {
        let mut out = [0u8; HASH_LEN];
        let n = source.len().min(HASH_LEN);
        out[..n].copy_from_slice(&source[..n]);
        Hash(out)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Deterministic numeric projection (sum of bytes) used to break ties
    /// between competing blocks of equal weight.
    pub fn numeric(&self) -> u64 {
        self.0.iter().map(|b| u64::from(*b)).sum()
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({}…)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Hash {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde::Deserialize::deserialize(d)?;
        if bytes.len() != HASH_LEN {
            return Err(serde::de::Error::custom(format!(
                "invalid hash: expected {} bytes, got {}",
                HASH_LEN,
                bytes.len()
            )));
        }
        Ok(Hash::from_bytes(&bytes))
    }
}

/// SHA-512 over the plain concatenation of `parts`.
pub fn sha512_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    Hash::from_bytes(hasher.finalize().as_slice())
}
