//! Blocks: the unit of replication.
//!
//! A block starts life as a candidate seeded from the chain tip. The
//! application fills it with key/value edits and transactions through an
//! internal reader/writer lock, then submits it for mining; sealing persists
//! the overlay into the block's world-state view and runs the proof-of-work
//! nonce loop over the SHA-512 preimage. Network blocks arrive as a
//! [`BlockSpec`] and must pass the proof-of-work check on their very first
//! (wire) nonce.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::consensus::chain::ChainStore;
use crate::consensus::error::ChainError;
use crate::state::WorldState;
use crate::transaction::Transaction;
use crate::Hash;

/// Application predicate deciding whether a hash satisfies proof-of-work.
/// Receives the hash, the block timestamp, and the delta since the parent,
/// so variable-difficulty schemes can key off block timing.
pub type PowApprover = Arc<dyn Fn(&[u8], u64, u64) -> bool + Send + Sync>;

/// The fields of a block that go over the wire, in canonical order.
///
/// Re-serializing a deserialized spec is byte-identical; everything else a
/// block carries (overlay, uncle miners, network flag) is local.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub parent: Hash,
    pub miner: Vec<u8>,
    pub state: Hash,
    pub transactions: Vec<Transaction>,
    pub timestamp: u64,
    pub delta: u64,
    pub depth: u64,
    pub weight: u64,
    pub uncles: Vec<Hash>,
    pub nonce: u64,
}

impl BlockSpec {
    /// Decode a wire-encoded spec.
    pub fn decode(data: &[u8]) -> Result<Self, ChainError> {
        bincode::deserialize(data).map_err(|e| ChainError::Serialization(e.to_string()))
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, ChainError> {
        bincode::serialize(self).map_err(|e| ChainError::Serialization(e.to_string()))
    }
}

struct Inner {
    spec: BlockSpec,
    hash: Option<Hash>,
    uncle_miners: Vec<Vec<u8>>,
    /// Pending key edits; `None` records a delete
    overlay: HashMap<Vec<u8>, Option<Vec<u8>>>,
    added_txs: HashSet<Hash>,
    world: Option<Box<dyn WorldState>>,
    chain: Option<ChainStore>,
    is_network: bool,
}

/// A block in the DAG.
///
/// All mutation goes through the internal lock, so a candidate can be filled
/// from one thread while the mining task reads a consistent snapshot. Once a
/// block has a hash it is sealed: edits and transactions are rejected.
pub struct Block {
    inner: RwLock<Inner>,
    seq: u64,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("Block")
            .field("hash", &inner.hash)
            .field("parent", &inner.spec.parent)
            .field("depth", &inner.spec.depth)
            .field("weight", &inner.spec.weight)
            .field("transactions", &inner.spec.transactions.len())
            .field("uncles", &inner.spec.uncles.len())
            .finish()
    }
}

impl Block {
    pub(crate) fn new_candidate(
        parent: Hash,
        weight: u64,
        depth: u64,
        timestamp: u64,
        parent_timestamp: u64,
        miner: Vec<u8>,
        world: Box<dyn WorldState>,
        chain: Option<ChainStore>,
        seq: u64,
    ) -> Self {
        let state = world.fingerprint();
        Block {
            inner: RwLock::new(Inner {
                spec: BlockSpec {
                    parent,
                    miner,
                    state,
                    transactions: Vec::new(),
                    timestamp,
                    delta: timestamp.saturating_sub(parent_timestamp),
                    depth,
                    weight,
                    uncles: Vec::new(),
                    nonce: 0,
                },
                hash: None,
                uncle_miners: Vec::new(),
                overlay: HashMap::new(),
                added_txs: HashSet::new(),
                world: Some(world),
                chain,
                is_network: false,
            }),
            seq,
        }
    }

    /// The genesis block: zero parent, empty miner, the empty world state.
    /// A pure function of `genesis_time`, so every replica derives the same
    /// genesis hash.
    pub(crate) fn genesis(genesis_time: u64, world: Box<dyn WorldState>, chain: ChainStore) -> Self {
        Self::new_candidate(
            Hash::ZERO,
            0,
            0,
            genesis_time,
            genesis_time,
            Vec::new(),
            world,
            Some(chain),
            0,
        )
    }

    /// A network block hydrated from its wire spec, carrying a fresh world
    /// view rebased onto the parent's fingerprint for transaction replay.
    pub(crate) fn from_network_spec(
        spec: BlockSpec,
        uncle_miners: Vec<Vec<u8>>,
        world: Box<dyn WorldState>,
        chain: ChainStore,
        seq: u64,
    ) -> Self {
        Block {
            inner: RwLock::new(Inner {
                spec,
                hash: None,
                uncle_miners,
                overlay: HashMap::new(),
                added_txs: HashSet::new(),
                world: Some(world),
                chain: Some(chain),
                is_network: true,
            }),
            seq,
        }
    }

    /// A block reconstituted from the chain store. The store key is the
    /// hash, so the block is sealed on arrival; the overlay is empty.
    pub(crate) fn from_stored(hash: Hash, spec: BlockSpec, chain: ChainStore) -> Self {
        Block {
            inner: RwLock::new(Inner {
                spec,
                hash: Some(hash),
                uncle_miners: Vec::new(),
                overlay: HashMap::new(),
                added_txs: HashSet::new(),
                world: None,
                chain: Some(chain),
                is_network: true,
            }),
            seq: 0,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn parent_hash(&self) -> Hash {
        self.read().spec.parent
    }

    pub fn miner(&self) -> Vec<u8> {
        self.read().spec.miner.clone()
    }

    pub fn timestamp(&self) -> u64 {
        self.read().spec.timestamp
    }

    pub fn delta(&self) -> u64 {
        self.read().spec.delta
    }

    pub fn depth(&self) -> u64 {
        self.read().spec.depth
    }

    pub fn weight(&self) -> u64 {
        self.read().spec.weight
    }

    pub fn nonce(&self) -> u64 {
        self.read().spec.nonce
    }

    /// World-state fingerprint the block commits to.
    pub fn state_fingerprint(&self) -> Hash {
        self.read().spec.state
    }

    pub fn uncles(&self) -> Vec<Hash> {
        self.read().spec.uncles.clone()
    }

    /// Miner ids of the referenced uncles, reconstructed locally.
    pub fn uncle_miners(&self) -> Vec<Vec<u8>> {
        self.read().uncle_miners.clone()
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.read().spec.transactions.clone()
    }

    /// The block hash, once sealed.
    pub fn hash(&self) -> Option<Hash> {
        self.read().hash
    }

    /// Deterministic numeric projection for ordering competing blocks.
    /// Unsealed blocks sort after every sealed one.
    pub fn numeric(&self) -> u64 {
        self.read().hash.map(|h| h.numeric()).unwrap_or(u64::MAX)
    }

    /// A wire-ready copy of the block's serialized fields.
    pub fn spec(&self) -> BlockSpec {
        self.read().spec.clone()
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn is_network(&self) -> bool {
        self.read().is_network
    }

    pub(crate) fn world_fingerprint(&self) -> Option<Hash> {
        self.read().world.as_ref().map(|w| w.fingerprint())
    }

    // ── Candidate filling ───────────────────────────────────────────────

    /// Record a key update in the overlay. Last write per key wins.
    pub fn update(&self, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        let mut inner = self.write();
        if inner.hash.is_some() {
            return Err(ChainError::InvalidArg("block is sealed"));
        }
        inner.overlay.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    /// Record a key delete in the overlay.
    pub fn delete(&self, key: &[u8]) -> Result<(), ChainError> {
        let mut inner = self.write();
        if inner.hash.is_some() {
            return Err(ChainError::InvalidArg("block is sealed"));
        }
        inner.overlay.insert(key.to_vec(), None);
        Ok(())
    }

    /// Read a key through the overlay, falling back to the world-state view.
    /// Values found below are cached in the overlay; a delete marker or a
    /// miss on both layers reports `KeyNotFound`.
    pub fn lookup(&self, key: &[u8]) -> Result<Vec<u8>, ChainError> {
        let mut inner = self.write();
        match inner.overlay.get(key) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => Err(ChainError::KeyNotFound),
            None => {
                let value = match inner.world.as_ref() {
                    Some(world) => world.lookup(key)?,
                    None => None,
                };
                match value {
                    Some(value) => {
                        inner.overlay.insert(key.to_vec(), Some(value.clone()));
                        Ok(value)
                    }
                    None => Err(ChainError::KeyNotFound),
                }
            }
        }
    }

    /// Append a transaction.
    ///
    /// Rejected as a duplicate when the id was already added to this block,
    /// or when the registry maps it to a block currently on the main list.
    /// A registration left behind by an abandoned fork does not block the
    /// transaction from being carried again.
    pub fn add_transaction(&self, tx: Transaction) -> Result<(), ChainError> {
        let mut inner = self.write();
        if inner.hash.is_some() {
            return Err(ChainError::InvalidArg("block is sealed"));
        }
        if let Some(world) = inner.world.as_ref() {
            if let Some(holder) = world.has_transaction(&tx.id)? {
                let canonical = match inner.chain.as_ref() {
                    Some(chain) => chain.is_main_list(&holder)?,
                    None => true,
                };
                if canonical {
                    return Err(ChainError::DuplicateTransaction);
                }
            }
        }
        if !inner.added_txs.insert(tx.id) {
            return Err(ChainError::DuplicateTransaction);
        }
        inner.spec.transactions.push(tx);
        Ok(())
    }

    /// Reference an uncle, bumping the block's weight by one.
    pub(crate) fn add_uncle(&self, uncle: Hash, miner: Vec<u8>) -> Result<(), ChainError> {
        let mut inner = self.write();
        if inner.hash.is_some() {
            return Err(ChainError::InvalidArg("block is sealed"));
        }
        inner.spec.uncles.push(uncle);
        inner.uncle_miners.push(miner);
        inner.spec.weight += 1;
        Ok(())
    }

    // ── Sealing ─────────────────────────────────────────────────────────

    /// Apply the overlay to the world-state view, cleaning up the transient
    /// fingerprints left behind (never the parent's). Cleanup failures are
    /// logged and swallowed so sealing can proceed.
    fn persist_overlay(inner: &mut Inner) -> Result<(), ChainError> {
        let Some(world) = inner.world.as_mut() else {
            return Ok(());
        };
        let base = world.fingerprint();
        for (key, value) in &inner.overlay {
            let before = world.fingerprint();
            let after = match value {
                Some(value) => world.update(key, value)?,
                None => world.delete(key)?,
            };
            if after == before {
                continue;
            }
            if before != base {
                if let Err(e) = world.cleanup(&before) {
                    tracing::warn!(error = %e, "failed to clean up transient state fingerprint");
                }
            }
        }
        Ok(())
    }

    /// SHA-512 preimage without the trailing nonce:
    /// `parent ∥ miner ∥ timestamp ∥ delta ∥ state ∥ transactions ∥ weight ∥ uncles`.
    fn preimage_prefix(spec: &BlockSpec) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(spec.parent.as_bytes());
        data.extend_from_slice(&spec.miner);
        data.extend_from_slice(&spec.timestamp.to_be_bytes());
        data.extend_from_slice(&spec.delta.to_be_bytes());
        data.extend_from_slice(spec.state.as_bytes());
        for tx in &spec.transactions {
            data.extend_from_slice(&tx.canonical_bytes());
        }
        data.extend_from_slice(&spec.weight.to_be_bytes());
        for uncle in &spec.uncles {
            data.extend_from_slice(uncle.as_bytes());
        }
        data
    }

    /// Seal the block: persist the overlay, then run the nonce loop until
    /// the approver accepts (or immediately, absent an approver).
    ///
    /// Network blocks keep their wire fingerprint and must pass on the wire
    /// nonce, else `HashIncorrect`. The loop polls the deadline and the
    /// abort flag every iteration. Already-sealed blocks return their hash.
    pub(crate) fn compute_hash(
        &self,
        approver: Option<&PowApprover>,
        timeout: Duration,
        abort: Option<&AtomicBool>,
    ) -> Result<Hash, ChainError> {
        let mut inner = self.write();
        if let Some(hash) = inner.hash {
            return Ok(hash);
        }
        if inner.world.is_some() {
            Self::persist_overlay(&mut inner)?;
            if !inner.is_network {
                let fingerprint = inner.world.as_ref().map(|w| w.fingerprint());
                if let Some(fingerprint) = fingerprint {
                    inner.spec.state = fingerprint;
                }
            }
        }
        let prefix = Self::preimage_prefix(&inner.spec);
        let deadline = Instant::now() + timeout;
        let mut nonce = inner.spec.nonce;
        loop {
            if let Some(flag) = abort {
                if flag.load(Ordering::Relaxed) {
                    return Err(ChainError::MiningAborted);
                }
            }
            if Instant::now() >= deadline {
                return Err(ChainError::HashTimeout);
            }
            inner.spec.nonce = nonce;
            let mut hasher = Sha512::new();
            hasher.update(&prefix);
            hasher.update(nonce.to_be_bytes());
            let hash = Hash::from_bytes(hasher.finalize().as_slice());
            let approved = approver.map_or(true, |pow| {
                pow(hash.as_bytes(), inner.spec.timestamp, inner.spec.delta)
            });
            if approved {
                inner.hash = Some(hash);
                return Ok(hash);
            }
            if inner.is_network {
                return Err(ChainError::HashIncorrect);
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    /// Record every carried transaction in the world-state registry under
    /// this block's hash.
    pub(crate) fn register_transactions(&self) -> Result<(), ChainError> {
        let inner = self.read();
        let Some(hash) = inner.hash else {
            return Err(ChainError::Unhashed);
        };
        if let Some(world) = inner.world.as_ref() {
            for tx in &inner.spec.transactions {
                world.register_transaction(&tx.id, &hash)?;
            }
        }
        Ok(())
    }

    /// Serialize for the wire. Refuses blocks that were never sealed or
    /// whose committed fingerprint disagrees with their world-state view.
    pub fn serialize(&self) -> Result<Vec<u8>, ChainError> {
        let inner = self.read();
        if inner.spec.state == Hash::ZERO {
            return Err(ChainError::StateMismatch);
        }
        if let Some(world) = inner.world.as_ref() {
            if world.fingerprint() != inner.spec.state {
                return Err(ChainError::StateMismatch);
            }
        }
        if inner.hash.is_none() {
            return Err(ChainError::Unhashed);
        }
        bincode::serialize(&inner.spec).map_err(|e| ChainError::Serialization(e.to_string()))
    }
}
