//! The block lifecycle state machine.
//!
//! # Overview
//!
//! [Lifecycle] owns a block from the moment it is parsed or built until
//! consensus decides it: it coordinates signature verification with state
//! execution, resolves ancestor state on demand, enforces every admission
//! invariant, and commits state on accept.
//!
//! # Design
//!
//! ## Concurrency
//!
//! Parsing a block spawns a data-parallel signature job over its transactions;
//! the job runs while verification fetches the parent and executes the batch,
//! and is awaited only after the state root has been checked. Sibling blocks
//! may verify concurrently: each forks an independent view from the shared
//! parent post-state.
//!
//! ## Recursive ancestor verification
//!
//! Consensus may ask to verify a child before its parent's state exists
//! (notably while catching up after state sync). [Lifecycle::verify] resolves
//! this by verifying unprocessed ancestors on demand, walking parent handles
//! fetched from the host's arena by ID. Blocks never hold pointers to each
//! other; locks are acquired child-to-ancestor and released between phases.
//!
//! ## State sync
//!
//! While the host reports its state is not ready, blocks are verified without
//! execution ([Status::VerifiedWithoutState]). Accepting such a block either
//! re-targets the sync (no commit) or, once state has arrived, performs the
//! deferred verification before committing.

use crate::{
    block::Block,
    fees::ExecutionContext,
    host::{Host, Rules as _, SyncMode, ViewOf},
    processor::{Processor, TxResult},
    state::{Database, View},
    tx::{Transaction, TxId},
    BlockId, Error, FUTURE_BOUND,
};
use bytes::Bytes;
use commonware_cryptography::{Hasher as _, Sha256};
use commonware_parallel::Strategy;
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::{future::BoxFuture, lock::Mutex, FutureExt};
use std::{collections::BTreeSet, sync::Arc, time::UNIX_EPOCH};
use tracing::{debug, info};

/// Upper bound on on-demand ancestor verification; consensus keeps the
/// unaccepted suffix far shallower than this.
const MAX_ANCESTRY_DEPTH: usize = 1024;

/// Where a block sits in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Undecided; not yet verified.
    Processing,
    /// Verified with state attached; may be accepted directly.
    Verified,
    /// Verified while state sync was running; execution is deferred to accept.
    VerifiedWithoutState,
    /// Committed. Terminal.
    Accepted,
    /// Discarded by consensus. Terminal.
    Rejected,
}

/// Shared handle to a tracked block. The host's arena owns these, keyed by ID.
pub type Shared<H> = Arc<Mutex<Candidate<H>>>;

/// A block tracked through consensus, together with everything the lifecycle
/// accumulates for it: canonical bytes, content address, the in-block tx-ID
/// set, execution results, the post-execution view, and the handle of the
/// background signature job.
pub struct Candidate<H: Host> {
    block: Block,
    id: BlockId,
    bytes: Bytes,
    status: Status,
    txs_set: BTreeSet<TxId>,
    results: Vec<TxResult>,
    view: Option<ViewOf<H>>,
    sig_job: Option<Handle<Result<(), Error>>>,
}

impl<H: Host> Candidate<H> {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn parent(&self) -> BlockId {
        self.block.parent
    }

    pub fn height(&self) -> u64 {
        self.block.height
    }

    pub fn timestamp(&self) -> i64 {
        self.block.timestamp
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Canonical encoding (what [Lifecycle::parse] consumed or
    /// [Block::marshal] produced).
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Per-transaction execution results; empty until verified (or built).
    pub fn results(&self) -> &[TxResult] {
        &self.results
    }

    /// Whether the post-execution view is attached.
    pub fn processed(&self) -> bool {
        self.view.is_some()
    }
}

/// The block lifecycle manager.
///
/// Drives [Candidate]s through parse, verify, accept, and reject on behalf of
/// an external consensus engine. `E` is the runtime context, `H` the host VM
/// surface, and `T` the strategy used for data-parallel signature
/// verification.
#[derive(Clone)]
pub struct Lifecycle<E, H, T> {
    context: E,
    host: H,
    strategy: T,
}

impl<E, H, T> Lifecycle<E, H, T>
where
    E: Spawner + Clock + Metrics,
    H: Host,
    T: Strategy,
{
    pub fn new(context: E, host: H, strategy: T) -> Self {
        Self {
            context,
            host,
            strategy,
        }
    }

    fn now(&self) -> i64 {
        self.context
            .current()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default()
    }

    /// Checks cheap enough to run before any expensive work.
    fn cheap_checks(&self, block: &Block, rules: &H::Rules) -> Result<(), Error> {
        if block.timestamp >= self.now().saturating_add(FUTURE_BOUND) {
            return Err(Error::TimestampTooLate);
        }
        if block.txs.is_empty() {
            return Err(Error::NoTxs);
        }
        if block.txs.len() > rules.max_block_txs() {
            return Err(Error::BlockTooBig);
        }
        Ok(())
    }

    /// Decode wire bytes into a tracked block with the given status.
    pub async fn parse(&self, source: Bytes, status: Status) -> Result<Shared<H>, Error> {
        let block = Block::unmarshal(&source)?;
        self.parse_block(block, Some(source), status).await
    }

    /// Track an already-decoded block (re-encoding it if `source` is absent).
    pub async fn parse_block(
        &self,
        block: Block,
        source: Option<Bytes>,
        status: Status,
    ) -> Result<Shared<H>, Error> {
        if block.height > 0 {
            // Genesis skips these.
            let rules = self.host.rules(block.timestamp);
            self.cheap_checks(&block, &rules)?;
        }

        let bytes = match source {
            Some(bytes) => bytes,
            None => block.marshal()?,
        };
        let id = Sha256::hash(&bytes);
        let mut candidate = Candidate {
            block,
            id,
            bytes,
            status,
            txs_set: BTreeSet::new(),
            results: Vec::new(),
            view: None,
            sig_job: None,
        };

        // A block at or below the accepted tip is parsed for observation only
        // and will never be re-verified: skip populating it. The same applies
        // when there is no tip yet (parsing genesis).
        match self.host.last_accepted().await {
            None => return Ok(Arc::new(Mutex::new(candidate))),
            Some(last) => {
                if candidate.block.height <= last.lock().await.block.height {
                    return Ok(Arc::new(Mutex::new(candidate)));
                }
            }
        }

        self.populate(&mut candidate, true)?;
        Ok(Arc::new(Mutex::new(candidate)))
    }

    /// Track a locally built block. The builder already executed it, so its
    /// results are retained and signature verification is skipped.
    pub async fn from_built(
        &self,
        block: Block,
        results: Vec<TxResult>,
    ) -> Result<Shared<H>, Error> {
        let bytes = block.marshal()?;
        let id = Sha256::hash(&bytes);
        let mut candidate = Candidate {
            block,
            id,
            bytes,
            status: Status::Processing,
            txs_set: BTreeSet::new(),
            results,
            view: None,
            sig_job: None,
        };
        self.populate(&mut candidate, false)?;
        Ok(Arc::new(Mutex::new(candidate)))
    }

    /// Build the in-block tx-ID set and spawn the background signature job.
    ///
    /// The job is not awaited here: it runs concurrently with whatever the
    /// caller does next and is joined at the end of verification.
    fn populate(&self, candidate: &mut Candidate<H>, verify_signatures: bool) -> Result<(), Error> {
        for tx in &candidate.block.txs {
            if !candidate.txs_set.insert(tx.id()) {
                return Err(Error::DuplicateTx);
            }
        }
        if !verify_signatures {
            return Ok(());
        }

        let work: Vec<(TxId, Vec<u8>, _)> = candidate
            .block
            .txs
            .iter()
            .map(|tx| (tx.id(), tx.payload(), tx.auth.clone()))
            .collect();
        let strategy = self.strategy.clone();
        let handle = self
            .context
            .child("signatures")
            .spawn(move |_| async move {
                let invalid = strategy.fold(
                    work,
                    || None,
                    |acc: Option<TxId>, (id, payload, auth)| {
                        if acc.is_some() {
                            acc
                        } else if auth.verify(&payload) {
                            None
                        } else {
                            Some(id)
                        }
                    },
                    |left, right| left.or(right),
                );
                match invalid {
                    Some(id) => Err(Error::InvalidSignature(id)),
                    None => Ok(()),
                }
            });
        candidate.sig_job = Some(handle);
        Ok(())
    }

    /// Verify a block proposed by consensus.
    ///
    /// Terminal blocks must never reach this; a block already verified with
    /// state is a no-op. If the host's state is not ready (dynamic state sync
    /// in progress), execution is skipped and deferred to [Lifecycle::accept].
    pub async fn verify(&self, block: &Shared<H>) -> Result<(), Error> {
        {
            let guard = block.lock().await;
            match guard.status {
                Status::Accepted | Status::Rejected => return Err(Error::AlreadyDecided),
                Status::Verified => return Ok(()),
                Status::Processing | Status::VerifiedWithoutState => {}
            }
        }

        if self.host.state_ready() {
            // The parent may not be processed yet, in which case missing
            // ancestor state is computed recursively.
            let view = self.verify_inner(block.clone(), 0).await?;
            let mut guard = block.lock().await;
            guard.view = Some(view);
            guard.status = Status::Verified;
            info!(id = ?guard.id, height = guard.block.height, "verified block");
        } else {
            let mut guard = block.lock().await;
            guard.status = Status::VerifiedWithoutState;
            debug!(id = ?guard.id, height = guard.block.height, "verified block without state");
        }

        // The host prunes the block's transactions from its mempool.
        self.host.verified(block).await;
        Ok(())
    }

    /// The full verification pass; returns the post-execution view.
    ///
    /// Boxed because it recurses through [Lifecycle::child_state] when
    /// ancestors need verification on demand.
    fn verify_inner(&self, block: Shared<H>, depth: usize) -> BoxFuture<'_, Result<ViewOf<H>, Error>> {
        async move {
            if depth > MAX_ANCESTRY_DEPTH {
                return Err(Error::AncestryTooDeep);
            }

            let (blk, built) = {
                let guard = block.lock().await;
                (guard.block.clone(), !guard.results.is_empty())
            };
            let rules = self.host.rules(blk.timestamp);
            self.cheap_checks(&blk, &rules)?;

            // The parent must be tracked and temporally behind us.
            let parent = self
                .host
                .get_block(&blk.parent)
                .await
                .ok_or(Error::UnknownParent(blk.parent))?;
            let parent_block = parent.lock().await.block.clone();
            if blk.timestamp <= parent_block.timestamp {
                return Err(Error::TimestampTooEarly);
            }

            // No transaction may repeat within the validity window. Before the
            // host's expiring map is fully populated this can disagree with
            // peers that have seen more history.
            let oldest_allowed = blk
                .timestamp
                .saturating_sub(rules.validity_window())
                .max(0);
            if self
                .is_repeat(parent.clone(), oldest_allowed, &blk.txs)
                .await?
            {
                return Err(Error::DuplicateTx);
            }

            // The declared fee parameters must match what we derive.
            let ectx = ExecutionContext::generate(&parent_block, blk.timestamp, &rules);
            if blk.unit_price != ectx.next_unit_price {
                return Err(Error::InvalidUnitPrice);
            }
            if blk.unit_window != ectx.next_unit_window {
                return Err(Error::InvalidUnitWindow);
            }
            if blk.block_cost != ectx.next_block_cost {
                return Err(Error::InvalidBlockCost);
            }
            if blk.block_window != ectx.next_block_window {
                return Err(Error::InvalidBlockWindow);
            }
            debug!(
                height = blk.height,
                unit_price = blk.unit_price,
                block_cost = blk.block_cost,
                "verify context"
            );

            // Fetch parent state (verifying the parent on demand), prefetch,
            // and execute. The signature job is still running in parallel.
            let mut view = self.child_state(&parent, blk.txs.len() * 2, depth).await?;
            let processor = Processor::new(&blk);
            processor.prefetch(&view).await?;
            let outcome = processor.execute(&mut view, &ectx, &rules).await?;

            if blk.units_consumed != outcome.units_consumed {
                return Err(Error::InvalidUnitsConsumed {
                    required: outcome.units_consumed,
                    found: blk.units_consumed,
                });
            }
            if blk.surplus_fee != outcome.surplus_fee {
                return Err(Error::InvalidSurplus {
                    required: outcome.surplus_fee,
                    found: blk.surplus_fee,
                });
            }

            // Enough fee must be paid to compensate for block production speed.
            let required = blk.unit_price.saturating_mul(blk.block_cost);
            if outcome.surplus_fee < required {
                return Err(Error::InsufficientSurplus {
                    required,
                    found: outcome.surplus_fee,
                });
            }

            let root = view.root().await?;
            if blk.state_root != root {
                return Err(Error::StateRootMismatch {
                    expected: root,
                    found: blk.state_root,
                });
            }

            // Locally built blocks were signed-checked at admission; parsed
            // blocks join the background job here, after the state work it
            // overlapped with.
            if !built {
                let job = block.lock().await.sig_job.take();
                if let Some(job) = job {
                    job.await??;
                }
            }

            block.lock().await.results = outcome.results;
            Ok(view)
        }
        .boxed()
    }

    /// A fresh writable view over this block's post-state, for verifying a
    /// child. Verifies the block first if its state is missing.
    async fn child_state(
        &self,
        block: &Shared<H>,
        estimated_changes: usize,
        depth: usize,
    ) -> Result<ViewOf<H>, Error> {
        let (status, height, processed) = {
            let guard = block.lock().await;
            (guard.status, guard.block.height, guard.view.is_some())
        };

        // Accepted blocks (and genesis) are committed: fork the canonical
        // state instead.
        if status == Status::Accepted || height == 0 {
            return Ok(self.host.state().view(estimated_changes).await);
        }

        if !processed {
            info!(height, "verifying parent when child state requested");
            let view = self.verify_inner(block.clone(), depth + 1).await?;
            let mut guard = block.lock().await;
            guard.view = Some(view);
            guard.status = Status::Verified;
        }

        let guard = block.lock().await;
        let view = guard.view.as_ref().ok_or(Error::BlockNotProcessed)?;
        Ok(view.fork(estimated_changes))
    }

    /// Whether any of `txs` appears in the ancestor chain starting at `block`
    /// with a timestamp at or after `oldest_allowed`.
    pub async fn is_repeat(
        &self,
        block: Shared<H>,
        oldest_allowed: i64,
        txs: &[Transaction],
    ) -> Result<bool, Error> {
        let mut cursor = block;
        loop {
            let (timestamp, status, height, parent, hit) = {
                let guard = cursor.lock().await;
                (
                    guard.block.timestamp,
                    guard.status,
                    guard.block.height,
                    guard.block.parent,
                    txs.iter().any(|tx| guard.txs_set.contains(&tx.id())),
                )
            };

            // Already past the window: nothing older can conflict.
            if timestamp < oldest_allowed {
                return Ok(false);
            }

            // From an accepted block (or genesis) down, the host's expiring
            // map indexes every accepted transaction within the window.
            if status == Status::Accepted || height == 0 {
                return Ok(self.host.is_repeat(txs).await);
            }

            if hit {
                return Ok(true);
            }
            cursor = self
                .host
                .get_block(&parent)
                .await
                .ok_or(Error::UnknownParent(parent))?;
        }
    }

    /// Accept a block decided by consensus, committing its state.
    ///
    /// A block that was verified without state either becomes the new sync
    /// target (no commit; returns `Ok`) or is verified now that the parent
    /// state is available.
    pub async fn accept(&self, block: &Shared<H>) -> Result<(), Error> {
        let processed = block.lock().await.view.is_some();
        if !processed {
            // State was not computed during verify because the host was state
            // syncing at the time.
            if self.host.update_sync_target(block).await? {
                let guard = block.lock().await;
                info!(id = ?guard.id, root = ?guard.block.state_root, "updated state sync target");
                // The sync is still ongoing.
                return Ok(());
            }

            {
                let guard = block.lock().await;
                info!(id = ?guard.id, root = ?guard.block.state_root, "verifying unprocessed block in accept");
            }
            let view = self.verify_inner(block.clone(), 0).await?;
            block.lock().await.view = Some(view);
        }

        // Promote the accumulated changes into the canonical store; the view
        // is consumed.
        let view = block
            .lock()
            .await
            .view
            .take()
            .ok_or(Error::BlockNotProcessed)?;
        view.commit().await?;

        self.set_last_accepted(block).await
    }

    /// Mark `block` as the accepted tip. Also called directly by hosts at the
    /// start and end of state sync.
    pub async fn set_last_accepted(&self, block: &Shared<H>) -> Result<(), Error> {
        self.host.set_last_accepted(block).await?;
        {
            let mut guard = block.lock().await;
            guard.status = Status::Accepted;
            // Replay protection is now served by the host's expiring map.
            guard.txs_set.clear();
            info!(id = ?guard.id, height = guard.block.height, "accepted block");
        }
        self.host.accepted(block).await;
        Ok(())
    }

    /// Discard a block consensus decided against. No state effects.
    pub async fn reject(&self, block: &Shared<H>) -> Result<(), Error> {
        {
            let mut guard = block.lock().await;
            guard.status = Status::Rejected;
            // Don't leave signature workers running for a dead block.
            if let Some(job) = guard.sig_job.take() {
                job.abort();
            }
            debug!(id = ?guard.id, height = guard.block.height, "rejected block");
        }
        self.host.rejected(block).await;
        Ok(())
    }

    /// Read handle over the block's post-execution state, used to validate
    /// mempool transactions. Never written through.
    pub async fn state(&self, block: &Shared<H>) -> Result<ViewOf<H>, Error> {
        let accepted = {
            let guard = block.lock().await;
            guard.status == Status::Accepted
        };
        if accepted {
            return Ok(self.host.state().view(0).await);
        }
        let guard = block.lock().await;
        match &guard.view {
            Some(view) => Ok(view.fork(0)),
            None => Err(Error::BlockNotProcessed),
        }
    }

    /// Accept a state-summary block offered by the sync layer, returning the
    /// mode the host chose.
    pub async fn accept_syncable(&self, block: &Shared<H>) -> Result<SyncMode, Error> {
        self.host.accepted_syncable(block).await
    }
}
