//! World-state views with Merkle fingerprints and a transaction registry.
//!
//! A view is a mutable key/value map whose fingerprint depends only on the
//! logical contents, so two replicas that applied the same edits agree on it
//! byte for byte. Every fingerprint ever produced stays addressable in the
//! backing database until explicitly cleaned up, which lets a view `rebase`
//! onto any historical fingerprint during fork handling.
//!
//! The transaction registry (tx id → holding block hash) is keyed
//! independently of the fingerprinted contents and therefore survives
//! rebasing, which is what lets registrations be rewritten across
//! reorganizations.

use std::collections::BTreeMap;
use std::sync::Arc;

use sha2::{Digest, Sha512};

use crate::db::{Database, DbError};
use crate::{Hash, HASH_LEN};

const STATE_NS: &[u8] = b"state:";
const TXN_NS: &[u8] = b"txn:";

/// Errors from world-state operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("unknown state fingerprint: {0}")]
    UnknownFingerprint(Hash),
    #[error("state record corrupted: {0}")]
    Corrupted(String),
}

/// Contract between the consensus core and its state collaborator.
///
/// `update` and `delete` must produce fingerprints that are a pure function
/// of the logical key/value set; `register_transaction` entries must survive
/// `rebase`.
pub trait WorldState: Send + Sync {
    /// Fingerprint of the current logical contents.
    fn fingerprint(&self) -> Hash;
    /// Value stored under `key`, if any.
    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError>;
    /// Set `key` to `value`; returns the new fingerprint.
    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<Hash, StateError>;
    /// Remove `key`; returns the new fingerprint.
    fn delete(&mut self, key: &[u8]) -> Result<Hash, StateError>;
    /// Move the view onto a previously persisted fingerprint.
    fn rebase(&mut self, fingerprint: &Hash) -> Result<(), StateError>;
    /// Drop the persisted snapshot for `fingerprint`.
    fn cleanup(&self, fingerprint: &Hash) -> Result<(), StateError>;
    /// Record that `tx_id` is held by the block with `block_hash`.
    fn register_transaction(&self, tx_id: &Hash, block_hash: &Hash) -> Result<(), StateError>;
    /// Block hash registered for `tx_id`, if any.
    fn has_transaction(&self, tx_id: &Hash) -> Result<Option<Hash>, StateError>;
}

/// World-state view persisted per fingerprint in a key-value store.
///
/// Each fingerprint maps to a full snapshot of the logical contents under
/// `state:<fingerprint>`. The Merkle-Patricia layout of the original trie is
/// deliberately not reproduced; the contract above is what consensus needs.
pub struct KvWorldState {
    db: Arc<dyn Database>,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
    fingerprint: Hash,
}

fn state_key(fingerprint: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(STATE_NS.len() + HASH_LEN);
    key.extend_from_slice(STATE_NS);
    key.extend_from_slice(fingerprint.as_bytes());
    key
}

fn txn_key(tx_id: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(TXN_NS.len() + HASH_LEN);
    key.extend_from_slice(TXN_NS);
    key.extend_from_slice(tx_id.as_bytes());
    key
}

/// Fingerprint of a logical key/value set: SHA-512 over the sorted,
/// length-prefixed entries.
fn fingerprint_of(entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> Hash {
    let mut hasher = Sha512::new();
    for (key, value) in entries {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key);
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    Hash::from_bytes(hasher.finalize().as_slice())
}

impl KvWorldState {
    /// Create an empty view, persisting the empty snapshot so the initial
    /// fingerprint is immediately rebaseable.
    pub fn new(db: Arc<dyn Database>) -> Result<Self, StateError> {
        let entries = BTreeMap::new();
        let fingerprint = fingerprint_of(&entries);
        let state = KvWorldState {
            db,
            entries,
            fingerprint,
        };
        state.persist()?;
        Ok(state)
    }

    /// Create a view already rebased onto `fingerprint`.
    pub fn at(db: Arc<dyn Database>, fingerprint: &Hash) -> Result<Self, StateError> {
        let mut state = Self::new(db)?;
        state.rebase(fingerprint)?;
        Ok(state)
    }

    fn persist(&self) -> Result<(), StateError> {
        let bytes = bincode::serialize(&self.entries)
            .map_err(|e| StateError::Corrupted(e.to_string()))?;
        self.db.put(&state_key(&self.fingerprint), &bytes)?;
        Ok(())
    }
}

impl WorldState for KvWorldState {
    fn fingerprint(&self) -> Hash {
        self.fingerprint
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.entries.get(key).cloned())
    }

    fn update(&mut self, key: &[u8], value: &[u8]) -> Result<Hash, StateError> {
        if self.entries.get(key).map(|v| v.as_slice()) == Some(value) {
            return Ok(self.fingerprint);
        }
        self.entries.insert(key.to_vec(), value.to_vec());
        self.fingerprint = fingerprint_of(&self.entries);
        self.persist()?;
        Ok(self.fingerprint)
    }

    fn delete(&mut self, key: &[u8]) -> Result<Hash, StateError> {
        if self.entries.remove(key).is_none() {
            return Ok(self.fingerprint);
        }
        self.fingerprint = fingerprint_of(&self.entries);
        self.persist()?;
        Ok(self.fingerprint)
    }

    fn rebase(&mut self, fingerprint: &Hash) -> Result<(), StateError> {
        let bytes = self
            .db
            .get(&state_key(fingerprint))?
            .ok_or(StateError::UnknownFingerprint(*fingerprint))?;
        let entries: BTreeMap<Vec<u8>, Vec<u8>> =
            bincode::deserialize(&bytes).map_err(|e| StateError::Corrupted(e.to_string()))?;
        self.entries = entries;
        self.fingerprint = *fingerprint;
        Ok(())
    }

    fn cleanup(&self, fingerprint: &Hash) -> Result<(), StateError> {
        self.db.delete(&state_key(fingerprint))?;
        Ok(())
    }

    fn register_transaction(&self, tx_id: &Hash, block_hash: &Hash) -> Result<(), StateError> {
        self.db.put(&txn_key(tx_id), block_hash.as_bytes())?;
        Ok(())
    }

    fn has_transaction(&self, tx_id: &Hash) -> Result<Option<Hash>, StateError> {
        match self.db.get(&txn_key(tx_id))? {
            Some(bytes) if bytes.len() == HASH_LEN => Ok(Some(Hash::from_bytes(&bytes))),
            Some(_) => Err(StateError::Corrupted(
                "transaction registry entry has wrong width".into(),
            )),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;

    fn fresh() -> KvWorldState {
        KvWorldState::new(Arc::new(MemoryDb::new())).unwrap()
    }

    #[test]
    fn fingerprint_depends_only_on_contents() {
        let mut a = fresh();
        let mut b = fresh();

        a.update(b"x", b"1").unwrap();
        a.update(b"y", b"2").unwrap();
        b.update(b"y", b"2").unwrap();
        b.update(b"x", b"1").unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn noop_edits_keep_the_fingerprint() {
        let mut state = fresh();
        let after_set = state.update(b"key", b"value").unwrap();
        assert_eq!(state.update(b"key", b"value").unwrap(), after_set);
        assert_eq!(state.delete(b"missing").unwrap(), after_set);

        state.delete(b"key").unwrap();
        assert_eq!(state.fingerprint(), fresh().fingerprint());
    }

    #[test]
    fn rebase_restores_a_persisted_snapshot() {
        let mut state = fresh();
        let empty = state.fingerprint();
        let with_key = state.update(b"key", b"value").unwrap();

        state.rebase(&empty).unwrap();
        assert!(state.lookup(b"key").unwrap().is_none());

        state.rebase(&with_key).unwrap();
        assert_eq!(state.lookup(b"key").unwrap().unwrap(), b"value");
    }

    #[test]
    fn rebase_unknown_fingerprint_fails() {
        let mut state = fresh();
        let unknown = Hash::from_bytes(b"nothing persisted here");
        assert!(matches!(
            state.rebase(&unknown),
            Err(StateError::UnknownFingerprint(_))
        ));
    }

    #[test]
    fn cleanup_removes_a_snapshot() {
        let mut state = fresh();
        let empty = state.fingerprint();
        state.update(b"key", b"value").unwrap();

        state.cleanup(&empty).unwrap();
        assert!(matches!(
            state.rebase(&empty),
            Err(StateError::UnknownFingerprint(_))
        ));
    }

    #[test]
    fn registry_survives_rebase() {
        let mut state = fresh();
        let empty = state.fingerprint();
        let tx_id = Hash::from_bytes(b"a transaction");
        let holder = Hash::from_bytes(b"a block");

        state.update(b"key", b"value").unwrap();
        state.register_transaction(&tx_id, &holder).unwrap();
        state.rebase(&empty).unwrap();

        assert_eq!(state.has_transaction(&tx_id).unwrap(), Some(holder));
        assert!(state
            .has_transaction(&Hash::from_bytes(b"unseen"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn registration_overwrites() {
        let state = fresh();
        let tx_id = Hash::from_bytes(b"a transaction");
        state
            .register_transaction(&tx_id, &Hash::from_bytes(b"first"))
            .unwrap();
        state
            .register_transaction(&tx_id, &Hash::from_bytes(b"second"))
            .unwrap();
        assert_eq!(
            state.has_transaction(&tx_id).unwrap(),
            Some(Hash::from_bytes(b"second"))
        );
    }
}
