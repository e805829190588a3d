//! # DAG consensus with heaviest-chain fork choice
//!
//! Blocks form a directed acyclic graph: every block has one parent and may
//! reference uncles, accepted siblings that lost a fork race. Fork choice
//! prefers the heavier chain (`weight = parent weight + 1 + uncle count`),
//! breaking ties with the smaller byte-sum of the block hash so that every
//! replica converges on the same tip regardless of arrival order.
//!
//! ## Block lifecycle
//!
//! ```text
//! candidate ── filled by the application (edits, transactions)
//!     │
//!     ▼ mine (background thread, PoW nonce loop, abortable)
//! sealed ───── hash fixed, overlay persisted into the world state
//!     │
//!     ▼ accept (shared with network blocks)
//! accepted ─── in the DAG; on the main list when fork choice says so
//! ```
//!
//! Network blocks run the same acceptance path after hydration and
//! application-side transaction replay; their recomputed state fingerprint
//! must match the wire fingerprint.

mod block;
mod chain;
mod engine;
mod error;

pub use block::{Block, BlockSpec, PowApprover};
pub use chain::{ChainNode, ChainStore};
pub use engine::{BlockChainConsensus, EngineConfig, MiningCallback};
pub use error::ChainError;
