//! DAG vertex metadata and the persistent chain store.
//!
//! Every accepted block, main list or uncle, gets a [`ChainNode`] recording
//! its position and forward links. Nodes and blocks are keyed by hash in the
//! database, so in-memory structures hold hashes, never pointers, and the
//! `children` list preserves insertion order.
//!
//! The store enforces no DAG invariants; the engine does.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::consensus::block::{Block, BlockSpec};
use crate::consensus::error::ChainError;
use crate::db::Database;
use crate::{Hash, HASH_LEN};

const BLOCK_NS: &[u8] = b"block:";
const NODE_NS: &[u8] = b"node:";
const TIP_KEY: &[u8] = b"tip";

/// Position metadata for one accepted block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    pub hash: Hash,
    pub parent: Hash,
    pub depth: u64,
    pub weight: u64,
    /// Forward links in insertion order
    pub children: Vec<Hash>,
    /// Whether this block sits on the canonical path from genesis to tip
    pub is_main_list: bool,
}

impl ChainNode {
    /// Node for a freshly sealed block, off the main list until fork choice
    /// says otherwise.
    pub fn from_block(block: &Block) -> Result<Self, ChainError> {
        let hash = block.hash().ok_or(ChainError::Unhashed)?;
        Ok(ChainNode {
            hash,
            parent: block.parent_hash(),
            depth: block.depth(),
            weight: block.weight(),
            children: Vec::new(),
            is_main_list: false,
        })
    }

    pub fn add_child(&mut self, child: Hash) {
        self.children.push(child);
    }

    pub fn set_main_list(&mut self, on_main_list: bool) {
        self.is_main_list = on_main_list;
    }
}

/// Persistent mapping from block hash to block and chain node, plus the
/// named tip pointer. Cheap to clone; all handles share one database.
#[derive(Clone)]
pub struct ChainStore {
    db: Arc<dyn Database>,
}

fn namespaced(ns: &[u8], hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(ns.len() + HASH_LEN);
    key.extend_from_slice(ns);
    key.extend_from_slice(hash.as_bytes());
    key
}

impl ChainStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        ChainStore { db }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn has_block(&self, hash: &Hash) -> Result<bool, ChainError> {
        Ok(self.db.has(&namespaced(BLOCK_NS, hash))?)
    }

    /// Serialized fields of a stored block, if present.
    pub fn get_spec(&self, hash: &Hash) -> Result<Option<BlockSpec>, ChainError> {
        match self.db.get(&namespaced(BLOCK_NS, hash))? {
            Some(bytes) => {
                let spec = bincode::deserialize(&bytes)
                    .map_err(|e| ChainError::DbCorrupted(e.to_string()))?;
                Ok(Some(spec))
            }
            None => Ok(None),
        }
    }

    /// Persist a sealed block. Refuses unhashed blocks and blocks whose
    /// committed fingerprint disagrees with their world-state view.
    pub fn put_block(&self, block: &Block) -> Result<(), ChainError> {
        let hash = block.hash().ok_or(ChainError::Unhashed)?;
        if let Some(fingerprint) = block.world_fingerprint() {
            if fingerprint != block.state_fingerprint() {
                return Err(ChainError::StateMismatch);
            }
        }
        let bytes = bincode::serialize(&block.spec())
            .map_err(|e| ChainError::Serialization(e.to_string()))?;
        self.db.put(&namespaced(BLOCK_NS, &hash), &bytes)?;
        Ok(())
    }

    pub fn get_node(&self, hash: &Hash) -> Result<Option<ChainNode>, ChainError> {
        match self.db.get(&namespaced(NODE_NS, hash))? {
            Some(bytes) => {
                let node = bincode::deserialize(&bytes)
                    .map_err(|e| ChainError::DbCorrupted(e.to_string()))?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    pub fn put_node(&self, node: &ChainNode) -> Result<(), ChainError> {
        let bytes =
            bincode::serialize(node).map_err(|e| ChainError::Serialization(e.to_string()))?;
        self.db.put(&namespaced(NODE_NS, &node.hash), &bytes)?;
        Ok(())
    }

    pub fn get_tip(&self) -> Result<Option<Hash>, ChainError> {
        match self.db.get(TIP_KEY)? {
            Some(bytes) if bytes.len() == HASH_LEN => Ok(Some(Hash::from_bytes(&bytes))),
            Some(_) => Err(ChainError::DbCorrupted(
                "tip pointer has wrong width".into(),
            )),
            None => Ok(None),
        }
    }

    pub fn put_tip(&self, hash: &Hash) -> Result<(), ChainError> {
        self.db.put(TIP_KEY, hash.as_bytes())?;
        Ok(())
    }

    /// Whether the block with `hash` currently sits on the main list.
    /// Unknown blocks are simply not canonical.
    pub fn is_main_list(&self, hash: &Hash) -> Result<bool, ChainError> {
        Ok(self.get_node(hash)?.map(|n| n.is_main_list).unwrap_or(false))
    }
}
