//! Transactions as consensus sees them.
//!
//! A transaction is an opaque payload submitted by a node; its id is derived
//! deterministically from the payload and the submitter, so any replica can
//! recompute and verify it on receipt. The application defines what the
//! payload means; consensus only tracks ids for uniqueness and registry
//! lookups.

use serde::{Deserialize, Serialize};

use crate::{sha512_concat, Hash};

/// An application transaction carried by a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Opaque application payload
    pub payload: Vec<u8>,
    /// Identity of the submitting node
    pub submitter: Hash,
    /// Application signature over the payload (may be empty)
    pub signature: Vec<u8>,
    /// Deterministic id: SHA-512 over payload and submitter
    pub id: Hash,
}

impl Transaction {
    /// Create an unsigned transaction, deriving its id.
    pub fn new(payload: Vec<u8>, submitter: Hash) -> Self {
        let id = Self::derive_id(&payload, &submitter);
        Transaction {
            payload,
            submitter,
            signature: Vec::new(),
            id,
        }
    }

    /// Create a signed transaction, deriving its id.
    pub fn signed(payload: Vec<u8>, submitter: Hash, signature: Vec<u8>) -> Self {
        let mut tx = Self::new(payload, submitter);
        tx.signature = signature;
        tx
    }

    fn derive_id(payload: &[u8], submitter: &Hash) -> Hash {
        sha512_concat(&[payload, submitter.as_bytes()])
    }

    /// Check that the carried id matches the derivation. Transactions coming
    /// off the wire must pass this before the block is considered.
    pub fn verify_id(&self) -> bool {
        self.id == Self::derive_id(&self.payload, &self.submitter)
    }

    /// Canonical byte form folded into the hash preimage of the holding
    /// block. Variable-width fields are length-prefixed so distinct
    /// transactions can never concatenate to the same bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.payload.len() + 64 + 8 + self.signature.len() + 64);
        out.extend_from_slice(&(self.payload.len() as u64).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(self.submitter.as_bytes());
        out.extend_from_slice(&(self.signature.len() as u64).to_be_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(self.id.as_bytes());
        out
    }
}
