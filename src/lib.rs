//! Block lifecycle core for a high-throughput chain VM.
//!
//! # Architecture
//!
//! The crate owns the contract between an externally driven consensus engine
//! (which proposes, votes on, and finalizes blocks) and the state layer (a
//! Merkle store persisting the canonical world state). Five components
//! cooperate, leaves first:
//!
//! - [block]: deterministic wire codec for blocks, bounded by a hard network
//!   size limit.
//! - [fees]: sliding-window fee accounting deriving a child's unit price and
//!   block cost from its parent.
//! - [processor]: ordered execution of a block's transaction batch against a
//!   state view, with prefetching and fee/surplus accounting.
//! - [state]: the narrow interface to the Merkle store (plus a bundled
//!   in-memory implementation).
//! - [lifecycle]: the central state machine driving a block through
//!   `Processing -> {Verified, VerifiedWithoutState} -> Accepted | Rejected`,
//!   coordinating signature verification with execution and resolving
//!   ancestor state on demand.
//!
//! The host VM is reached exclusively through the [host::Host] trait: block
//! arena, expiring replay map, chain rules, canonical state, sync control, and
//! lifecycle notifications.
//!
//! # Design
//!
//! ## Admission invariants
//!
//! A block that passes verification is structurally well-formed, temporally
//! bounded (after its parent, within [FUTURE_BOUND] of local time), free of
//! transaction replay within the validity window (both intra-block and across
//! the ancestor chain), priced exactly as the fee controller dictates, and
//! commits to the Merkle root its execution actually produces. Any violation
//! is a terminal error for the block; the consensus engine rejects it.
//!
//! ## Concurrency
//!
//! Signature verification for a block's transactions is dispatched into an
//! injected [commonware_parallel::Strategy] when the block is parsed and is
//! awaited only after execution, overlapping CPU-bound cryptography with
//! I/O-bound state work. Sibling blocks verify concurrently against
//! independent forks of the shared parent post-state.

pub mod block;
pub mod fees;
pub mod host;
pub mod lifecycle;
#[cfg(test)]
pub mod mocks;
pub mod processor;
pub mod state;
pub mod tx;

use commonware_cryptography::sha256;
use thiserror::Error;

pub use block::{Block, NETWORK_SIZE_LIMIT};
pub use fees::{ExecutionContext, Window, WINDOW_SIZE};
pub use host::{Host, Rules, SyncMode, ViewOf};
pub use lifecycle::{Candidate, Lifecycle, Shared, Status};
pub use processor::{Outcome, Processor, TxResult};
pub use state::{Database, Overlay, Store, View};
pub use tx::{Action, Auth, Base, Transaction, TxId};

/// Content address of a block (SHA-256 of its canonical bytes).
pub type BlockId = sha256::Digest;

/// Maximum drift of a block's timestamp into the future relative to local
/// wall clock, in seconds.
pub const FUTURE_BOUND: i64 = 10;

#[derive(Error, Debug)]
pub enum Error {
    // Codec.
    #[error("invalid object")]
    InvalidObject,
    #[error("codec: {0}")]
    Codec(#[from] commonware_codec::Error),

    // Structure and temporal bounds.
    #[error("timestamp too late")]
    TimestampTooLate,
    #[error("timestamp too early")]
    TimestampTooEarly,
    #[error("no transactions")]
    NoTxs,
    #[error("block too big")]
    BlockTooBig,
    #[error("duplicate transaction")]
    DuplicateTx,

    // Fee-context agreement.
    #[error("invalid unit price")]
    InvalidUnitPrice,
    #[error("invalid unit window")]
    InvalidUnitWindow,
    #[error("invalid block cost")]
    InvalidBlockCost,
    #[error("invalid block window")]
    InvalidBlockWindow,

    // Execution accounting.
    #[error("invalid units consumed (required={required} found={found})")]
    InvalidUnitsConsumed { required: u64, found: u64 },
    #[error("invalid surplus fee (required={required} found={found})")]
    InvalidSurplus { required: u64, found: u64 },
    #[error("insufficient surplus fee (required={required} found={found})")]
    InsufficientSurplus { required: u64, found: u64 },
    #[error("state root mismatch (expected={expected:?} found={found:?})")]
    StateRootMismatch {
        expected: sha256::Digest,
        found: sha256::Digest,
    },

    // Per-transaction admission.
    #[error("transaction expired: {0:?}")]
    TxExpired(tx::TxId),
    #[error("transaction expiry beyond validity window: {0:?}")]
    TxLifetimeTooLong(tx::TxId),
    #[error("transaction bid below block unit price: {0:?}")]
    UnderpricedTx(tx::TxId),
    #[error("insufficient balance to pay fee: {0:?}")]
    InsufficientBalance(tx::TxId),
    #[error("invalid signature: {0:?}")]
    InvalidSignature(tx::TxId),

    // Lifecycle.
    #[error("block not processed")]
    BlockNotProcessed,
    #[error("unknown parent: {0:?}")]
    UnknownParent(BlockId),
    #[error("block already decided")]
    AlreadyDecided,
    #[error("ancestry too deep")]
    AncestryTooDeep,

    // Collaborators.
    #[error("state: {0}")]
    State(String),
    #[error("runtime: {0}")]
    Runtime(#[from] commonware_runtime::Error),
}
