//! The consensus engine: candidate creation, mining, acceptance, fork
//! choice, and traversal over the block DAG.
//!
//! One mutex serializes everything that can move the tip: acceptance,
//! main-list rebalancing, and the world-state advance. A reader that
//! observes a new tip also observes the matching fingerprint and flags.
//! Mining runs on its own thread and reports through a completion callback;
//! a network block of equal or greater weight aborts it cooperatively.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::consensus::block::{Block, BlockSpec, PowApprover};
use crate::consensus::chain::{ChainNode, ChainStore};
use crate::consensus::error::ChainError;
use crate::constants;
use crate::db::Database;
use crate::state::{KvWorldState, WorldState};
use crate::Hash;

/// Engine configuration. The approver is the application's proof-of-work
/// predicate, applied when checking network blocks; local mining takes its
/// approver per call.
#[derive(Clone)]
pub struct EngineConfig {
    pub max_descendants: usize,
    pub max_uncle_distance: u64,
    pub hash_timeout: Duration,
    pub pow_approver: Option<PowApprover>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_descendants: constants::MAX_DESCENDANTS,
            max_uncle_distance: constants::MAX_UNCLE_DISTANCE,
            hash_timeout: Duration::from_secs(constants::HASH_TIMEOUT_SECS),
            pow_approver: None,
        }
    }
}

/// Completion callback for a mining request. Receives the sealed and
/// accepted block (ready to broadcast via [`Block::serialize`]) or the
/// error that ended the attempt.
pub type MiningCallback = Box<dyn FnOnce(Result<Arc<Block>, ChainError>) + Send + 'static>;

struct MinerHandle {
    seq: u64,
    weight: u64,
    abort: Arc<AtomicBool>,
}

struct Core {
    tip: Arc<Block>,
    state: KvWorldState,
    /// Candidates currently being mined, by candidate sequence number
    in_flight: HashSet<u64>,
    miners: Vec<MinerHandle>,
}

/// A DAG blockchain with heaviest-chain fork choice and uncle rewards.
pub struct BlockChainConsensus {
    chain: ChainStore,
    config: EngineConfig,
    miner_id: Vec<u8>,
    genesis_hash: Hash,
    core: Mutex<Core>,
    next_seq: AtomicU64,
}

fn unix_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

fn corrupted(what: &str) -> ChainError {
    ChainError::DbCorrupted(what.into())
}

impl BlockChainConsensus {
    /// Open or create a chain on `db`.
    ///
    /// When no tip is stored, the genesis block for `genesis_time` is
    /// synthesized and persisted; otherwise the stored tip is loaded and the
    /// engine's world state rebases onto its fingerprint. Database failures
    /// surface unchanged.
    pub fn new(
        genesis_time: u64,
        miner_id: &[u8],
        db: Arc<dyn Database>,
        config: EngineConfig,
    ) -> Result<Arc<Self>, ChainError> {
        let chain = ChainStore::new(db.clone());
        let mut state = KvWorldState::new(db.clone())?;

        // Genesis identity is a pure function of genesis_time, so it can be
        // recomputed on every open without a dedicated record.
        let genesis = Block::genesis(
            genesis_time,
            Box::new(KvWorldState::new(db.clone())?),
            chain.clone(),
        );
        let genesis_hash = genesis
            .compute_hash(None, config.hash_timeout, None)
            .map_err(|e| ChainError::InitializationFailed(e.to_string()))?;

        let tip = match chain.get_tip()? {
            None => {
                chain.put_tip(&genesis_hash)?;
                chain.put_block(&genesis)?;
                let mut node = ChainNode::from_block(&genesis)?;
                node.set_main_list(true);
                chain.put_node(&node)?;
                tracing::info!(genesis = %genesis_hash, "created new chain");
                Arc::new(genesis)
            }
            Some(tip_hash) => {
                let spec = chain
                    .get_spec(&tip_hash)?
                    .ok_or_else(|| corrupted("tip block missing"))?;
                chain
                    .get_node(&tip_hash)?
                    .ok_or_else(|| corrupted("tip chain node missing"))?;
                let tip = Block::from_stored(tip_hash, spec, chain.clone());
                state.rebase(&tip.state_fingerprint())?;
                tracing::info!(
                    tip = %tip_hash,
                    depth = tip.depth(),
                    weight = tip.weight(),
                    "reopened chain"
                );
                Arc::new(tip)
            }
        };

        Ok(Arc::new(BlockChainConsensus {
            chain,
            config,
            miner_id: miner_id.to_vec(),
            genesis_hash,
            core: Mutex::new(Core {
                tip,
                state,
                in_flight: HashSet::new(),
                miners: Vec::new(),
            }),
            next_seq: AtomicU64::new(1),
        }))
    }

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Read accessors ──────────────────────────────────────────────────

    /// The current tip of the canonical chain.
    pub fn tip(&self) -> Arc<Block> {
        Arc::clone(&self.lock_core().tip)
    }

    /// The best block, for protocol handshakes. Same block as [`tip`].
    ///
    /// [`tip`]: BlockChainConsensus::tip
    pub fn best_block(&self) -> Arc<Block> {
        self.tip()
    }

    pub fn genesis(&self) -> Hash {
        self.genesis_hash
    }

    pub fn weight(&self) -> u64 {
        self.lock_core().tip.weight()
    }

    pub fn depth(&self) -> u64 {
        self.lock_core().tip.depth()
    }

    /// Fingerprint of the engine's world state at the tip.
    pub fn state_fingerprint(&self) -> Hash {
        self.lock_core().state.fingerprint()
    }

    /// A stored block by hash.
    pub fn block(&self, hash: &Hash) -> Result<Arc<Block>, ChainError> {
        self.stored_block(hash)
    }

    fn stored_block(&self, hash: &Hash) -> Result<Arc<Block>, ChainError> {
        let spec = self
            .chain
            .get_spec(hash)?
            .ok_or(ChainError::InvalidArg("unknown block"))?;
        Ok(Arc::new(Block::from_stored(*hash, spec, self.chain.clone())))
    }

    // ── Candidate creation ──────────────────────────────────────────────

    /// A fresh candidate on top of the current tip, with a world-state view
    /// cloned from the tip's fingerprint and any discovered uncles already
    /// referenced.
    pub fn new_candidate_block(&self) -> Result<Arc<Block>, ChainError> {
        let core = self.lock_core();
        let tip_hash = core
            .tip
            .hash()
            .ok_or_else(|| corrupted("tip block has no hash"))?;
        let world = KvWorldState::at(self.chain.db().clone(), &core.tip.state_fingerprint())?;
        let block = Block::new_candidate(
            tip_hash,
            core.tip.weight() + 1,
            core.tip.depth() + 1,
            unix_nanos(),
            core.tip.timestamp(),
            self.miner_id.clone(),
            Box::new(world),
            Some(self.chain.clone()),
            self.next_seq.fetch_add(1, Ordering::Relaxed),
        );
        let uncles = self.find_uncles(&core)?;
        drop(core);
        for (uncle, miner) in uncles {
            block.add_uncle(uncle, miner)?;
        }
        Ok(Arc::new(block))
    }

    /// Uncle candidates for a block extending the tip: children of main-list
    /// ancestors within the horizon that are off the main list and not yet
    /// rewarded by any block on the path.
    fn find_uncles(&self, core: &Core) -> Result<Vec<(Hash, Vec<u8>)>, ChainError> {
        let horizon = self.config.max_uncle_distance;
        let candidate_depth = core.tip.depth() + 1;
        let min_uncle_depth = candidate_depth.saturating_sub(horizon);

        let mut cursor = core
            .tip
            .hash()
            .ok_or_else(|| corrupted("tip block has no hash"))?;
        let mut used: HashSet<Hash> = HashSet::new();
        let mut path: Vec<ChainNode> = Vec::new();
        // one node beyond the horizon: the deepest eligible uncle branches
        // off the ancestor just below it
        for _ in 0..=horizon {
            let node = self
                .chain
                .get_node(&cursor)?
                .ok_or_else(|| corrupted("main-list chain node missing"))?;
            let spec = self
                .chain
                .get_spec(&cursor)?
                .ok_or_else(|| corrupted("main-list block missing"))?;
            used.insert(cursor);
            used.extend(spec.uncles.iter().copied());
            cursor = node.parent;
            let depth = node.depth;
            path.push(node);
            if depth == 0 {
                break;
            }
        }

        let mut uncles = Vec::new();
        for ancestor in &path {
            let sibling_depth = ancestor.depth + 1;
            if sibling_depth < min_uncle_depth || sibling_depth >= candidate_depth {
                continue;
            }
            for child in &ancestor.children {
                if used.contains(child) {
                    continue;
                }
                let Some(node) = self.chain.get_node(child)? else {
                    continue;
                };
                if node.is_main_list {
                    continue;
                }
                let spec = self
                    .chain
                    .get_spec(child)?
                    .ok_or_else(|| corrupted("uncle block missing"))?;
                used.insert(*child);
                uncles.push((*child, spec.miner));
            }
        }
        Ok(uncles)
    }

    // ── Mining ──────────────────────────────────────────────────────────

    /// Mine a filled candidate on a background thread, accepting the first
    /// hash produced, and report through `completion`.
    pub fn mine_candidate_block(self: &Arc<Self>, block: Arc<Block>, completion: MiningCallback) {
        self.spawn_miner(block, None, completion)
    }

    /// Proof-of-work variant: the nonce loop runs until `approver` accepts.
    pub fn mine_candidate_block_pow(
        self: &Arc<Self>,
        block: Arc<Block>,
        approver: PowApprover,
        completion: MiningCallback,
    ) {
        self.spawn_miner(block, Some(approver), completion)
    }

    fn spawn_miner(
        self: &Arc<Self>,
        block: Arc<Block>,
        approver: Option<PowApprover>,
        completion: MiningCallback,
    ) {
        let abort = Arc::new(AtomicBool::new(false));
        {
            let mut core = self.lock_core();
            if !core.in_flight.insert(block.seq()) {
                drop(core);
                completion(Err(ChainError::DuplicateBlock));
                return;
            }
            core.miners.push(MinerHandle {
                seq: block.seq(),
                weight: block.weight(),
                abort: Arc::clone(&abort),
            });
        }
        let engine = Arc::clone(self);
        std::thread::spawn(move || {
            let result = engine.mine(&block, approver.as_ref(), &abort);
            {
                let mut core = engine.lock_core();
                core.in_flight.remove(&block.seq());
                core.miners.retain(|m| m.seq != block.seq());
            }
            completion(result.map(|_| block));
        });
    }

    fn mine(
        &self,
        block: &Arc<Block>,
        approver: Option<&PowApprover>,
        abort: &AtomicBool,
    ) -> Result<(), ChainError> {
        block.compute_hash(approver, self.config.hash_timeout, Some(abort))?;
        block.register_transactions()?;
        self.accept(block, false)
    }

    // ── Acceptance ──────────────────────────────────────────────────────

    /// Check and accept a processed network block, extending the canonical
    /// chain or recording it as a fork for later uncle inclusion.
    ///
    /// The block must have been hydrated by [`deserialize_network_block`] or
    /// [`decode_network_block_spec`] and replayed by the application; its
    /// recomputed fingerprint must match the wire fingerprint.
    ///
    /// [`deserialize_network_block`]: BlockChainConsensus::deserialize_network_block
    /// [`decode_network_block_spec`]: BlockChainConsensus::decode_network_block_spec
    pub fn accept_network_block(&self, block: Arc<Block>) -> Result<(), ChainError> {
        if !block.is_network() {
            return Err(ChainError::InvalidArg("not a network block"));
        }
        block.compute_hash(self.config.pow_approver.as_ref(), self.config.hash_timeout, None)?;
        self.accept(&block, true)
    }

    /// The acceptance path shared by mined and network blocks. Runs under
    /// the engine lock: persist, fork-choose, rebalance, advance.
    fn accept(&self, block: &Arc<Block>, from_network: bool) -> Result<(), ChainError> {
        let hash = block.hash().ok_or(ChainError::Unhashed)?;
        let mut core = self.lock_core();

        if self.chain.has_block(&hash)? {
            return Err(ChainError::DuplicateBlock);
        }
        let parent_hash = block.parent_hash();
        let parent = self
            .chain
            .get_spec(&parent_hash)?
            .ok_or(ChainError::OrphanBlock)?;
        let spec = block.spec();
        self.validate_against_parent(&spec, &parent)?;
        if from_network {
            if let Some(fingerprint) = block.world_fingerprint() {
                if fingerprint != spec.state {
                    return Err(ChainError::StateMismatch);
                }
            }
        }

        self.chain.put_block(block)?;
        self.chain.put_node(&ChainNode::from_block(block)?)?;
        let mut parent_node = self
            .chain
            .get_node(&parent_hash)?
            .ok_or_else(|| corrupted("parent chain node missing"))?;
        parent_node.add_child(hash);
        self.chain.put_node(&parent_node)?;

        let tip_hash = core
            .tip
            .hash()
            .ok_or_else(|| corrupted("tip block has no hash"))?;
        let wins = (spec.weight, std::cmp::Reverse(hash.numeric()))
            > (core.tip.weight(), std::cmp::Reverse(tip_hash.numeric()));
        if wins {
            self.advance_tip(&mut core, block)?;
        } else {
            tracing::debug!(block = %hash, weight = spec.weight, "accepted fork block");
        }

        if from_network {
            for miner in &core.miners {
                if spec.weight >= miner.weight {
                    miner.abort.store(true, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    /// Structural validation against the resolved parent: depth, weight, and
    /// every uncle reference.
    fn validate_against_parent(
        &self,
        spec: &BlockSpec,
        parent: &BlockSpec,
    ) -> Result<Vec<Vec<u8>>, ChainError> {
        if spec.depth != parent.depth + 1 {
            return Err(ChainError::Validation("depth is not parent depth + 1"));
        }
        if spec.weight != parent.weight + 1 + spec.uncles.len() as u64 {
            return Err(ChainError::Validation(
                "weight does not cover parent and uncles",
            ));
        }
        self.validate_uncles(spec)
    }

    /// Each uncle must resolve, sit within the depth horizon, branch off an
    /// ancestor of the block, and not be rewarded twice. Returns the uncle
    /// miners for local reconstruction.
    fn validate_uncles(&self, spec: &BlockSpec) -> Result<Vec<Vec<u8>>, ChainError> {
        if spec.uncles.is_empty() {
            return Ok(Vec::new());
        }
        let mut ancestors: HashSet<Hash> = HashSet::new();
        let mut rewarded: HashSet<Hash> = HashSet::new();
        let mut cursor = spec.parent;
        // one node beyond the horizon: the deepest eligible uncle branches
        // off the ancestor just below it
        for _ in 0..=self.config.max_uncle_distance {
            let Some(ancestor) = self.chain.get_spec(&cursor)? else {
                break;
            };
            ancestors.insert(cursor);
            rewarded.extend(ancestor.uncles.iter().copied());
            if ancestor.depth == 0 {
                break;
            }
            cursor = ancestor.parent;
        }

        let min_depth = spec.depth.saturating_sub(self.config.max_uncle_distance);
        let mut seen: HashSet<Hash> = HashSet::new();
        let mut miners = Vec::with_capacity(spec.uncles.len());
        for uncle in &spec.uncles {
            if !seen.insert(*uncle) {
                return Err(ChainError::Validation("uncle referenced twice"));
            }
            let uncle_spec = self
                .chain
                .get_spec(uncle)?
                .ok_or(ChainError::Validation("uncle block not known"))?;
            if uncle_spec.depth < min_depth || uncle_spec.depth >= spec.depth {
                return Err(ChainError::Validation("uncle depth outside the horizon"));
            }
            if !ancestors.contains(&uncle_spec.parent) {
                return Err(ChainError::Validation(
                    "uncle does not branch off an ancestor",
                ));
            }
            if rewarded.contains(uncle) {
                return Err(ChainError::Validation(
                    "uncle already rewarded by an ancestor",
                ));
            }
            miners.push(uncle_spec.miner);
        }
        Ok(miners)
    }

    /// Flip main-list flags along both sides of the fork down to the lowest
    /// common ancestor, rewrite the transaction registry for newly-main
    /// blocks, advance the world state, and persist the new tip.
    fn advance_tip(&self, core: &mut Core, block: &Arc<Block>) -> Result<(), ChainError> {
        let new_hash = block.hash().ok_or(ChainError::Unhashed)?;
        let old_hash = core
            .tip
            .hash()
            .ok_or_else(|| corrupted("tip block has no hash"))?;

        let mut joining: Vec<ChainNode> = Vec::new();
        let mut leaving: Vec<ChainNode> = Vec::new();
        let mut rising = self
            .chain
            .get_node(&new_hash)?
            .ok_or_else(|| corrupted("new tip chain node missing"))?;
        let mut sinking = self
            .chain
            .get_node(&old_hash)?
            .ok_or_else(|| corrupted("old tip chain node missing"))?;
        while rising.depth > sinking.depth {
            let parent = rising.parent;
            joining.push(rising);
            rising = self
                .chain
                .get_node(&parent)?
                .ok_or_else(|| corrupted("chain node missing below new tip"))?;
        }
        while sinking.depth > rising.depth {
            let parent = sinking.parent;
            leaving.push(sinking);
            sinking = self
                .chain
                .get_node(&parent)?
                .ok_or_else(|| corrupted("chain node missing below old tip"))?;
        }
        while rising.hash != sinking.hash {
            let rising_parent = rising.parent;
            let sinking_parent = sinking.parent;
            joining.push(rising);
            leaving.push(sinking);
            rising = self
                .chain
                .get_node(&rising_parent)?
                .ok_or_else(|| corrupted("chain node missing below new tip"))?;
            sinking = self
                .chain
                .get_node(&sinking_parent)?
                .ok_or_else(|| corrupted("chain node missing below old tip"))?;
        }

        for node in &mut leaving {
            node.set_main_list(false);
            self.chain.put_node(node)?;
        }
        for node in &mut joining {
            node.set_main_list(true);
            self.chain.put_node(node)?;
        }

        // Registry rewrite, oldest newly-main block first: a transaction
        // stays with its current holder only while that holder is canonical.
        for node in joining.iter().rev() {
            let spec = self
                .chain
                .get_spec(&node.hash)?
                .ok_or_else(|| corrupted("newly canonical block missing"))?;
            for tx in &spec.transactions {
                let already_canonical = match core.state.has_transaction(&tx.id)? {
                    Some(holder) => self.chain.is_main_list(&holder)?,
                    None => false,
                };
                if !already_canonical {
                    core.state.register_transaction(&tx.id, &node.hash)?;
                }
            }
        }

        core.state.rebase(&block.state_fingerprint())?;
        self.chain.put_tip(&new_hash)?;
        if !leaving.is_empty() {
            tracing::info!(
                from = %old_hash,
                to = %new_hash,
                reorged = leaving.len(),
                "chain reorganized"
            );
        }
        tracing::debug!(
            tip = %new_hash,
            depth = block.depth(),
            weight = block.weight(),
            "tip advanced"
        );
        core.tip = Arc::clone(block);
        Ok(())
    }

    // ── Network-block hydration ─────────────────────────────────────────

    /// Decode wire bytes into a network block ready for transaction replay.
    pub fn deserialize_network_block(&self, data: &[u8]) -> Result<Arc<Block>, ChainError> {
        let spec = BlockSpec::decode(data)?;
        self.decode_network_block_spec(spec)
    }

    /// Hydrate a wire spec: verify transaction ids, resolve the parent,
    /// validate structure, and attach a fresh world-state view rebased onto
    /// the parent's fingerprint. The application then replays the carried
    /// transactions before submitting the block for acceptance.
    pub fn decode_network_block_spec(&self, spec: BlockSpec) -> Result<Arc<Block>, ChainError> {
        for tx in &spec.transactions {
            if !tx.verify_id() {
                return Err(ChainError::Validation(
                    "transaction id does not match its derivation",
                ));
            }
        }
        let parent = self
            .chain
            .get_spec(&spec.parent)?
            .ok_or(ChainError::OrphanBlock)?;
        let uncle_miners = self.validate_against_parent(&spec, &parent)?;
        let world = KvWorldState::at(self.chain.db().clone(), &parent.state)?;
        Ok(Arc::new(Block::from_network_spec(
            spec,
            uncle_miners,
            Box::new(world),
            self.chain.clone(),
            self.next_seq.fetch_add(1, Ordering::Relaxed),
        )))
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// The block currently holding `tx_id` on the canonical chain. A
    /// registration held by an uncle or an abandoned fork reports
    /// `TransactionNotFound`.
    pub fn transaction_status(&self, tx_id: &Hash) -> Result<Arc<Block>, ChainError> {
        let holder = {
            let core = self.lock_core();
            core.state
                .has_transaction(tx_id)?
                .ok_or(ChainError::TransactionNotFound)?
        };
        let node = self
            .chain
            .get_node(&holder)?
            .ok_or(ChainError::TransactionNotFound)?;
        if !node.is_main_list {
            return Err(ChainError::TransactionNotFound);
        }
        self.stored_block(&holder)
    }

    /// Main-list blocks after `parent`, in order, each followed by its
    /// uncles. A block and its uncles ride together: when the cap cannot fit
    /// the whole group, the walk stops before it.
    pub fn descendants(&self, parent: &Hash, max: usize) -> Result<Vec<Arc<Block>>, ChainError> {
        let max = max.min(self.config.max_descendants);
        let mut cursor = self
            .chain
            .get_node(parent)?
            .ok_or(ChainError::InvalidArg("unknown block"))?;
        let mut out: Vec<Arc<Block>> = Vec::new();
        loop {
            let mut next: Option<ChainNode> = None;
            for child in &cursor.children {
                let node = self
                    .chain
                    .get_node(child)?
                    .ok_or_else(|| corrupted("child chain node missing"))?;
                if node.is_main_list {
                    next = Some(node);
                    break;
                }
            }
            let Some(node) = next else {
                break;
            };
            let spec = self
                .chain
                .get_spec(&node.hash)?
                .ok_or_else(|| corrupted("main-list block missing"))?;
            if out.len() + 1 + spec.uncles.len() > max {
                break;
            }
            let uncles = spec.uncles.clone();
            out.push(Arc::new(Block::from_stored(
                node.hash,
                spec,
                self.chain.clone(),
            )));
            for uncle in &uncles {
                out.push(self.stored_block(uncle)?);
            }
            cursor = node;
        }
        Ok(out)
    }

    /// The block `max` parent hops above `child`, clamped at genesis.
    pub fn ancestor(&self, child: &Hash, max: u64) -> Result<Arc<Block>, ChainError> {
        if max == 0 {
            return Err(ChainError::InvalidArg("distance must be positive"));
        }
        let mut spec = self
            .chain
            .get_spec(child)?
            .ok_or(ChainError::InvalidArg("unknown block"))?;
        if spec.depth == 0 {
            return Err(ChainError::InvalidArg("genesis has no ancestor"));
        }
        let mut hash = *child;
        for _ in 0..max {
            if spec.depth == 0 {
                break;
            }
            hash = spec.parent;
            spec = self
                .chain
                .get_spec(&hash)?
                .ok_or_else(|| corrupted("ancestor block missing"))?;
        }
        Ok(Arc::new(Block::from_stored(hash, spec, self.chain.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use crate::transaction::Transaction;
    use std::sync::mpsc;

    const GENESIS_TIME: u64 = 0x123456;

    fn engine() -> Arc<BlockChainConsensus> {
        BlockChainConsensus::new(
            GENESIS_TIME,
            b"a test node",
            Arc::new(MemoryDb::new()),
            EngineConfig::default(),
        )
        .unwrap()
    }

    /// Mine a block and wait for the completion callback.
    fn add_block(engine: &Arc<BlockChainConsensus>, block: Arc<Block>) -> Result<(), ChainError> {
        let (tx, rx) = mpsc::channel();
        engine.mine_candidate_block(
            block,
            Box::new(move |result| {
                let _ = tx.send(result.map(|_| ()));
            }),
        );
        rx.recv().expect("mining callback dropped")
    }

    /// A sealed sibling of the main-list block after `parent_hash`, built
    /// the way a competing miner would have built it.
    fn sealed_child(engine: &Arc<BlockChainConsensus>, seq: u64) -> Arc<Block> {
        let tip = engine.tip();
        let world =
            KvWorldState::at(engine.chain.db().clone(), &tip.state_fingerprint()).unwrap();
        let block = Block::new_candidate(
            tip.hash().unwrap(),
            tip.weight() + 1,
            tip.depth() + 1,
            unix_nanos(),
            tip.timestamp(),
            b"a competing node".to_vec(),
            Box::new(world),
            Some(engine.chain.clone()),
            seq,
        );
        block
            .compute_hash(None, Duration::from_secs(10), None)
            .unwrap();
        Arc::new(block)
    }

    #[test]
    fn genesis_only_chain() {
        let engine = engine();
        let tip = engine.tip();
        assert_eq!(tip.hash(), Some(engine.genesis()));
        assert_eq!(tip.depth(), 0);
        assert_eq!(tip.weight(), 0);
        assert_eq!(tip.parent_hash(), Hash::ZERO);
    }

    #[test]
    fn genesis_is_identical_across_replicas() {
        assert_eq!(engine().genesis(), engine().genesis());
        let other = BlockChainConsensus::new(
            GENESIS_TIME + 1,
            b"a test node",
            Arc::new(MemoryDb::new()),
            EngineConfig::default(),
        )
        .unwrap();
        assert_ne!(engine().genesis(), other.genesis());
    }

    #[test]
    fn candidate_parents_the_tip() {
        let engine = engine();
        let candidate = engine.new_candidate_block().unwrap();
        assert_eq!(candidate.parent_hash(), engine.tip().hash().unwrap());
        assert_eq!(candidate.depth(), 1);
        assert_eq!(candidate.weight(), 1);
        assert!(candidate.hash().is_none());
    }

    #[test]
    fn mining_advances_tip_and_state() {
        let engine = engine();
        let candidate = engine.new_candidate_block().unwrap();
        candidate.update(b"key", b"value").unwrap();
        candidate
            .add_transaction(Transaction::new(
                b"transaction 1".to_vec(),
                Hash::from_bytes(b"a test node"),
            ))
            .unwrap();
        add_block(&engine, Arc::clone(&candidate)).unwrap();

        assert_eq!(engine.tip().hash(), candidate.hash());
        assert_eq!(engine.state_fingerprint(), candidate.state_fingerprint());
        assert_eq!(engine.depth(), 1);
    }

    #[test]
    fn duplicate_candidate_resubmission_is_rejected() {
        let engine = engine();
        let candidate = engine.new_candidate_block().unwrap();
        add_block(&engine, Arc::clone(&candidate)).unwrap();
        assert!(matches!(
            add_block(&engine, candidate),
            Err(ChainError::DuplicateBlock)
        ));
    }

    #[test]
    fn reopen_restores_the_tip() {
        let db: Arc<dyn Database> = Arc::new(MemoryDb::new());
        let engine = BlockChainConsensus::new(
            GENESIS_TIME,
            b"a test node",
            db.clone(),
            EngineConfig::default(),
        )
        .unwrap();
        let candidate = engine.new_candidate_block().unwrap();
        candidate.update(b"key", b"value").unwrap();
        add_block(&engine, Arc::clone(&candidate)).unwrap();
        let tip_hash = engine.tip().hash().unwrap();
        drop(engine);

        let reopened =
            BlockChainConsensus::new(GENESIS_TIME, b"a test node", db, EngineConfig::default())
                .unwrap();
        assert_eq!(reopened.tip().hash(), Some(tip_hash));
        assert_eq!(reopened.weight(), candidate.weight());
        assert_eq!(reopened.state_fingerprint(), candidate.state_fingerprint());
    }

    #[test]
    fn transaction_status_tracks_the_canonical_chain() {
        let engine = engine();
        let tx = Transaction::new(
            b"transaction 1".to_vec(),
            Hash::from_bytes(b"a test node"),
        );
        let candidate = engine.new_candidate_block().unwrap();
        candidate.add_transaction(tx.clone()).unwrap();
        add_block(&engine, Arc::clone(&candidate)).unwrap();

        let holder = engine.transaction_status(&tx.id).unwrap();
        assert_eq!(holder.hash(), candidate.hash());

        // demote the holding block off the main list
        let mut node = engine
            .chain
            .get_node(&candidate.hash().unwrap())
            .unwrap()
            .unwrap();
        node.set_main_list(false);
        engine.chain.put_node(&node).unwrap();
        assert!(matches!(
            engine.transaction_status(&tx.id),
            Err(ChainError::TransactionNotFound)
        ));
    }

    #[test]
    fn unknown_transaction_is_not_found() {
        let engine = engine();
        assert!(matches!(
            engine.transaction_status(&Hash::from_bytes(b"never seen")),
            Err(ChainError::TransactionNotFound)
        ));
    }

    #[test]
    fn duplicate_transaction_across_blocks() {
        let engine = engine();
        let tx = Transaction::new(
            b"transaction 1".to_vec(),
            Hash::from_bytes(b"a test node"),
        );
        let first = engine.new_candidate_block().unwrap();
        first.add_transaction(tx.clone()).unwrap();
        add_block(&engine, first).unwrap();

        let second = engine.new_candidate_block().unwrap();
        assert!(matches!(
            second.add_transaction(tx),
            Err(ChainError::DuplicateTransaction)
        ));
    }

    #[test]
    fn equal_weight_forks_break_on_numeric() {
        let engine = engine();
        let ancestor = engine.new_candidate_block().unwrap();
        add_block(&engine, ancestor).unwrap();

        let block1 = engine.new_candidate_block().unwrap();
        let block2 = engine.new_candidate_block().unwrap();
        add_block(&engine, Arc::clone(&block1)).unwrap();
        add_block(&engine, Arc::clone(&block2)).unwrap();

        let n1 = block1.numeric();
        let n2 = block2.numeric();
        assert_ne!(n1, n2, "numeric collision between competing blocks");
        let winner = if n1 < n2 { &block1 } else { &block2 };
        assert_eq!(engine.tip().hash(), winner.hash());
    }

    #[test]
    fn losing_sibling_becomes_an_uncle() {
        let engine = engine();
        let ancestor = engine.new_candidate_block().unwrap();
        add_block(&engine, ancestor).unwrap();

        let block1 = engine.new_candidate_block().unwrap();
        let block2 = engine.new_candidate_block().unwrap();
        add_block(&engine, Arc::clone(&block1)).unwrap();
        add_block(&engine, Arc::clone(&block2)).unwrap();

        let (winner, loser) = if block1.numeric() < block2.numeric() {
            (block1, block2)
        } else {
            (block2, block1)
        };
        let next = engine.new_candidate_block().unwrap();
        assert_eq!(next.parent_hash(), winner.hash().unwrap());
        assert_eq!(next.uncles(), vec![loser.hash().unwrap()]);
        assert_eq!(next.uncle_miners(), vec![loser.miner()]);
        assert_eq!(next.weight(), winner.weight() + 1 + 1);
    }

    #[test]
    fn registry_rewrites_after_a_reorg() {
        let engine = engine();
        let tx = Transaction::new(
            b"transaction 1".to_vec(),
            Hash::from_bytes(b"a test node"),
        );

        // ancestor on the main list
        let ancestor = engine.new_candidate_block().unwrap();
        add_block(&engine, ancestor).unwrap();
        let tip = engine.tip();

        // an off-chain block carrying the transaction, registered as if it
        // had been mined first
        let uncle = {
            let world =
                KvWorldState::at(engine.chain.db().clone(), &tip.state_fingerprint()).unwrap();
            let block = Block::new_candidate(
                tip.hash().unwrap(),
                tip.weight() + 1,
                tip.depth() + 1,
                unix_nanos(),
                tip.timestamp(),
                b"a competing node".to_vec(),
                Box::new(world),
                Some(engine.chain.clone()),
                9_002,
            );
            block.add_transaction(tx.clone()).unwrap();
            block
                .compute_hash(None, Duration::from_secs(10), None)
                .unwrap();
            Arc::new(block)
        };
        engine.chain.put_block(&uncle).unwrap();
        let mut uncle_node = ChainNode::from_block(&uncle).unwrap();
        uncle_node.set_main_list(true);
        engine.chain.put_node(&uncle_node).unwrap();
        uncle.register_transactions().unwrap();
        assert_eq!(
            engine.transaction_status(&tx.id).unwrap().hash(),
            uncle.hash()
        );

        // a competing sibling takes the uncle's place on the main list
        let parent = sealed_child(&engine, 9_003);
        engine.chain.put_block(&parent).unwrap();
        let mut parent_node = ChainNode::from_block(&parent).unwrap();
        parent_node.set_main_list(true);
        engine.chain.put_node(&parent_node).unwrap();
        uncle_node.set_main_list(false);
        engine.chain.put_node(&uncle_node).unwrap();
        let mut tip_node = engine
            .chain
            .get_node(&tip.hash().unwrap())
            .unwrap()
            .unwrap();
        tip_node.add_child(uncle.hash().unwrap());
        tip_node.add_child(parent.hash().unwrap());
        engine.chain.put_node(&tip_node).unwrap();

        // the heavier child re-carries the transaction and rewards the uncle
        let child = {
            let world =
                KvWorldState::at(engine.chain.db().clone(), &parent.state_fingerprint()).unwrap();
            let block = Block::new_candidate(
                parent.hash().unwrap(),
                parent.weight() + 1,
                parent.depth() + 1,
                unix_nanos(),
                parent.timestamp(),
                b"a test node".to_vec(),
                Box::new(world),
                Some(engine.chain.clone()),
                9_004,
            );
            block
                .add_uncle(uncle.hash().unwrap(), uncle.miner())
                .unwrap();
            block.add_transaction(tx.clone()).unwrap();
            Arc::new(block)
        };
        add_block(&engine, Arc::clone(&child)).unwrap();

        let holder = engine.transaction_status(&tx.id).unwrap();
        assert_eq!(holder.hash(), child.hash());
        assert!(!engine
            .chain
            .is_main_list(&uncle.hash().unwrap())
            .unwrap());
    }

    /// Extend the chain by one mined ancestor, then a fork of one uncle and
    /// one main-list sibling, then a mined child rewarding the uncle.
    /// Returns the ancestor and the uncle.
    fn extend_chain_with_uncle(
        engine: &Arc<BlockChainConsensus>,
        seq: u64,
    ) -> (Arc<Block>, Arc<Block>) {
        let ancestor = engine.new_candidate_block().unwrap();
        add_block(engine, Arc::clone(&ancestor)).unwrap();
        let tip = engine.tip();

        let uncle = sealed_child(engine, seq);
        engine.chain.put_block(&uncle).unwrap();
        engine
            .chain
            .put_node(&ChainNode::from_block(&uncle).unwrap())
            .unwrap();

        let parent = sealed_child(engine, seq + 1);
        engine.chain.put_block(&parent).unwrap();
        let mut parent_node = ChainNode::from_block(&parent).unwrap();
        parent_node.set_main_list(true);
        engine.chain.put_node(&parent_node).unwrap();

        let mut tip_node = engine
            .chain
            .get_node(&tip.hash().unwrap())
            .unwrap()
            .unwrap();
        tip_node.add_child(uncle.hash().unwrap());
        tip_node.add_child(parent.hash().unwrap());
        engine.chain.put_node(&tip_node).unwrap();

        let child = {
            let world =
                KvWorldState::at(engine.chain.db().clone(), &parent.state_fingerprint()).unwrap();
            let block = Block::new_candidate(
                parent.hash().unwrap(),
                parent.weight() + 1,
                parent.depth() + 1,
                unix_nanos(),
                parent.timestamp(),
                b"a test node".to_vec(),
                Box::new(world),
                Some(engine.chain.clone()),
                seq + 2,
            );
            block
                .add_uncle(uncle.hash().unwrap(), uncle.miner())
                .unwrap();
            Arc::new(block)
        };
        add_block(engine, Arc::clone(&child)).unwrap();
        assert_eq!(engine.tip().hash(), child.hash());
        (ancestor, uncle)
    }

    #[test]
    fn descendants_include_uncles_after_their_inclusion_block() {
        let engine = engine();
        let (ancestor, uncle) = extend_chain_with_uncle(&engine, 9_100);

        let descendants = engine
            .descendants(&ancestor.hash().unwrap(), 100)
            .unwrap();
        assert_eq!(descendants.len(), 3);
        let hashes: Vec<_> = descendants.iter().map(|b| b.hash().unwrap()).collect();
        assert!(hashes.contains(&uncle.hash().unwrap()));
        // the uncle rides behind the block that rewarded it
        assert_eq!(hashes[2], uncle.hash().unwrap());
    }

    #[test]
    fn descendants_keep_a_block_and_its_uncles_together() {
        let engine = engine();
        let (ancestor1, uncle1) = extend_chain_with_uncle(&engine, 9_200);
        let (_, uncle2) = extend_chain_with_uncle(&engine, 9_300);

        let first = engine.descendants(&ancestor1.hash().unwrap(), 6).unwrap();
        assert_eq!(first.len(), 5);
        let hashes: Vec<_> = first.iter().map(|b| b.hash().unwrap()).collect();
        assert!(hashes.contains(&uncle1.hash().unwrap()));
        assert!(!hashes.contains(&uncle2.hash().unwrap()));

        let last = first.last().unwrap();
        let second = engine.descendants(&last.hash().unwrap(), 6).unwrap();
        assert_eq!(second.len(), 2);
        let hashes: Vec<_> = second.iter().map(|b| b.hash().unwrap()).collect();
        assert!(hashes.contains(&uncle2.hash().unwrap()));
        assert!(!hashes.contains(&uncle1.hash().unwrap()));
    }

    #[test]
    fn next_candidate_skips_already_rewarded_uncles() {
        let engine = engine();
        let (_, uncle) = extend_chain_with_uncle(&engine, 9_400);
        let candidate = engine.new_candidate_block().unwrap();
        assert!(!candidate.uncles().contains(&uncle.hash().unwrap()));
    }
}
