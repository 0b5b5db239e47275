//! The interface the lifecycle core consumes from its host VM.
//!
//! The core never owns the block arena, the mempool, or the expiring replay
//! map; it drives them through [Host]. Everything here is async-by-trait so
//! hosts can back these operations with storage or network fetches.

use crate::{lifecycle::Shared, state::Database, tx::Transaction, BlockId, Error};
use std::future::Future;

/// Chain parameters valid at a given timestamp (see [Host::rules]).
pub trait Rules: Clone + Send + Sync + 'static {
    /// Maximum number of transactions in a block.
    fn max_block_txs(&self) -> usize;

    /// Seconds a transaction ID stays unique-checked against the ancestor
    /// chain (and the host's expiring map) before it may reappear.
    fn validity_window(&self) -> i64;

    fn min_unit_price(&self) -> u64;

    fn min_block_cost(&self) -> u64;

    /// Unit consumption per window at which the unit price holds steady.
    fn window_target_units(&self) -> u64;

    /// Blocks per window at which the block cost holds steady.
    fn window_target_blocks(&self) -> u64;
}

/// How the host adopted a state-summary block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// The summary was ignored; the node continues normal operation.
    #[default]
    Skipped,
    /// The node restarts from the summary's state.
    Static,
    /// The node fetches the summary's state while tracking new blocks.
    Dynamic,
}

/// The view type produced by a host's database.
pub type ViewOf<H> = <<H as Host>::Database as Database>::View;

/// Host-side surface of the VM embedding the lifecycle core.
pub trait Host: Clone + Send + Sync + 'static {
    type Rules: Rules;
    type Database: Database;

    /// Parameters valid at `timestamp`.
    fn rules(&self, timestamp: i64) -> Self::Rules;

    /// Canonical state handle.
    fn state(&self) -> Self::Database;

    /// Whether enough state has been fetched to execute blocks (false while
    /// dynamic state sync is still running).
    fn state_ready(&self) -> bool;

    /// The most recently accepted block (none while bootstrapping genesis).
    fn last_accepted(&self) -> impl Future<Output = Option<Shared<Self>>> + Send;

    /// Look up an in-memory block by ID.
    fn get_block(&self, id: &BlockId) -> impl Future<Output = Option<Shared<Self>>> + Send;

    /// Query the expiring map of accepted transaction IDs within the validity
    /// window.
    fn is_repeat(&self, txs: &[Transaction]) -> impl Future<Output = bool> + Send;

    /// During state sync: whether `block` becomes the new sync target. If so,
    /// accept returns without committing and the sync continues.
    fn update_sync_target(
        &self,
        block: &Shared<Self>,
    ) -> impl Future<Output = Result<bool, Error>> + Send;

    /// Accept a state-summary block, returning the sync mode chosen.
    fn accepted_syncable(
        &self,
        block: &Shared<Self>,
    ) -> impl Future<Output = Result<SyncMode, Error>> + Send;

    /// Persist `block` as the new tip.
    fn set_last_accepted(
        &self,
        block: &Shared<Self>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Lifecycle notification: `block` passed verification (the host drops its
    /// transactions from the mempool).
    fn verified(&self, block: &Shared<Self>) -> impl Future<Output = ()> + Send;

    /// Lifecycle notification: `block` was accepted (the host indexes its
    /// transactions in the expiring replay map).
    fn accepted(&self, block: &Shared<Self>) -> impl Future<Output = ()> + Send;

    /// Lifecycle notification: `block` was rejected.
    fn rejected(&self, block: &Shared<Self>) -> impl Future<Output = ()> + Send;
}
