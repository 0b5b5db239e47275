//! Mock host and chain fixtures for tests.

use crate::{
    block::Block,
    fees::ExecutionContext,
    host::{Host, Rules, SyncMode},
    lifecycle::{Lifecycle, Shared, Status},
    processor::Processor,
    state::{Database, Store, View as _},
    tx::{balance_key, decode_balance, encode_balance, Action, Base, Transaction, TxId},
    BlockId, Error,
};
use commonware_cryptography::{ed25519, PrivateKeyExt as _, Signer as _};
use commonware_parallel::Strategy;
use commonware_runtime::{deterministic, Clock, Metrics, Spawner};
use futures::lock::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::UNIX_EPOCH,
};

/// Fixed chain parameters for tests.
#[derive(Clone, Debug)]
pub struct TestRules {
    pub max_block_txs: usize,
    pub validity_window: i64,
    pub min_unit_price: u64,
    pub min_block_cost: u64,
    pub window_target_units: u64,
    pub window_target_blocks: u64,
}

impl Default for TestRules {
    fn default() -> Self {
        Self {
            max_block_txs: 16,
            validity_window: 60,
            min_unit_price: 1,
            min_block_cost: 1,
            window_target_units: 1_000,
            window_target_blocks: 100,
        }
    }
}

impl Rules for TestRules {
    fn max_block_txs(&self) -> usize {
        self.max_block_txs
    }

    fn validity_window(&self) -> i64 {
        self.validity_window
    }

    fn min_unit_price(&self) -> u64 {
        self.min_unit_price
    }

    fn min_block_cost(&self) -> u64 {
        self.min_block_cost
    }

    fn window_target_units(&self) -> u64 {
        self.window_target_units
    }

    fn window_target_blocks(&self) -> u64 {
        self.window_target_blocks
    }
}

#[derive(Default)]
struct Inner {
    blocks: HashMap<BlockId, Shared<Vm>>,
    last_accepted: Option<BlockId>,
    /// Accepted transaction IDs keyed by expiry (the expiring map). Entries
    /// are dropped once the validity window has passed their expiry.
    accepted_txs: HashMap<TxId, i64>,
    /// Whether the next `update_sync_target` call re-targets the sync.
    retarget: bool,
    sync_mode: SyncMode,
    verified: Vec<BlockId>,
    accepted: Vec<BlockId>,
    rejected: Vec<BlockId>,
}

/// Mock VM implementing [Host] over an in-memory arena and [Store].
#[derive(Clone)]
pub struct Vm {
    clock: Arc<deterministic::Context>,
    rules: TestRules,
    store: Store,
    state_ready: Arc<AtomicBool>,
    inner: Arc<Mutex<Inner>>,
}

impl Vm {
    pub fn new(clock: deterministic::Context, rules: TestRules) -> Self {
        Self {
            clock: Arc::new(clock),
            rules,
            store: Store::new(),
            state_ready: Arc::new(AtomicBool::new(true)),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn test_rules(&self) -> TestRules {
        self.rules.clone()
    }

    fn now(&self) -> i64 {
        self.clock
            .current()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default()
    }

    /// Seed an account balance in the canonical state.
    pub async fn fund(&self, key: &ed25519::PublicKey, amount: u64) {
        self.store.seed(balance_key(key), encode_balance(amount)).await;
    }

    /// Read an account balance from the canonical state.
    pub async fn balance(&self, key: &ed25519::PublicKey) -> u64 {
        let view = self.store.view(0).await;
        decode_balance(view.get(&balance_key(key)).await.unwrap())
    }

    /// Register a block in the arena.
    pub async fn track(&self, block: &Shared<Vm>) {
        let id = block.lock().await.id();
        self.inner.lock().await.blocks.insert(id, block.clone());
    }

    pub fn set_state_ready(&self, ready: bool) {
        self.state_ready.store(ready, Ordering::SeqCst);
    }

    pub async fn set_retarget(&self, retarget: bool) {
        self.inner.lock().await.retarget = retarget;
    }

    pub async fn last_accepted_id(&self) -> Option<BlockId> {
        self.inner.lock().await.last_accepted
    }

    pub async fn events(&self) -> (Vec<BlockId>, Vec<BlockId>, Vec<BlockId>) {
        let inner = self.inner.lock().await;
        (
            inner.verified.clone(),
            inner.accepted.clone(),
            inner.rejected.clone(),
        )
    }
}

impl Host for Vm {
    type Rules = TestRules;
    type Database = Store;

    fn rules(&self, _timestamp: i64) -> TestRules {
        self.rules.clone()
    }

    fn state(&self) -> Store {
        self.store.clone()
    }

    fn state_ready(&self) -> bool {
        self.state_ready.load(Ordering::SeqCst)
    }

    async fn last_accepted(&self) -> Option<Shared<Vm>> {
        let inner = self.inner.lock().await;
        let id = inner.last_accepted?;
        inner.blocks.get(&id).cloned()
    }

    async fn get_block(&self, id: &BlockId) -> Option<Shared<Vm>> {
        self.inner.lock().await.blocks.get(id).cloned()
    }

    async fn is_repeat(&self, txs: &[Transaction]) -> bool {
        // Drop entries the validity window has passed, the same cutoff the
        // lifecycle applies to its ancestor walk.
        let oldest_allowed = self.now().saturating_sub(self.rules.validity_window);
        let mut inner = self.inner.lock().await;
        inner.accepted_txs.retain(|_, expiry| *expiry >= oldest_allowed);
        txs.iter().any(|tx| inner.accepted_txs.contains_key(&tx.id()))
    }

    async fn update_sync_target(&self, _block: &Shared<Vm>) -> Result<bool, Error> {
        Ok(self.inner.lock().await.retarget)
    }

    async fn accepted_syncable(&self, _block: &Shared<Vm>) -> Result<SyncMode, Error> {
        Ok(self.inner.lock().await.sync_mode)
    }

    async fn set_last_accepted(&self, block: &Shared<Vm>) -> Result<(), Error> {
        let id = block.lock().await.id();
        self.inner.lock().await.last_accepted = Some(id);
        Ok(())
    }

    async fn verified(&self, block: &Shared<Vm>) {
        let id = block.lock().await.id();
        self.inner.lock().await.verified.push(id);
    }

    async fn accepted(&self, block: &Shared<Vm>) {
        let (id, txs) = {
            let guard = block.lock().await;
            (
                guard.id(),
                guard
                    .block()
                    .txs
                    .iter()
                    .map(|tx| (tx.id(), tx.base.timestamp))
                    .collect::<Vec<_>>(),
            )
        };
        let mut inner = self.inner.lock().await;
        inner.accepted.push(id);
        inner.accepted_txs.extend(txs);
    }

    async fn rejected(&self, block: &Shared<Vm>) {
        let id = block.lock().await.id();
        self.inner.lock().await.rejected.push(id);
    }
}

/// Deterministic test key.
pub fn signer(seed: u64) -> ed25519::PrivateKey {
    ed25519::PrivateKey::from_seed(seed)
}

/// A signed transfer with the given expiry and fee bid.
pub fn transfer(
    from: &ed25519::PrivateKey,
    to: &ed25519::PublicKey,
    value: u64,
    unit_price: u64,
    expiry: i64,
) -> Transaction {
    Transaction::sign(
        Base {
            timestamp: expiry,
            unit_price,
        },
        Action::Transfer {
            to: to.clone(),
            value,
        },
        from,
    )
}

/// Parse and adopt a genesis block, returning its handle.
pub async fn bootstrap<E, T>(
    lifecycle: &Lifecycle<E, Vm, T>,
    vm: &Vm,
) -> Result<Shared<Vm>, Error>
where
    E: Spawner + Clock + Metrics,
    T: Strategy,
{
    let genesis = Block::genesis([0u8; 32].into(), vm.rules.min_unit_price, vm.rules.min_block_cost);
    let shared = lifecycle.parse(genesis.marshal()?, Status::Accepted).await?;
    vm.track(&shared).await;
    vm.set_last_accepted(&shared).await?;
    Ok(shared)
}

/// Build a fully stamped child of an accepted parent: fee context from the
/// parent, commitment tuple from executing `txs` on the canonical state.
pub async fn build_child(
    vm: &Vm,
    parent: &Shared<Vm>,
    timestamp: i64,
    txs: Vec<Transaction>,
) -> Result<Block, Error> {
    let (parent_id, parent_block) = {
        let guard = parent.lock().await;
        (guard.id(), guard.block().clone())
    };
    let rules = vm.test_rules();
    let ectx = ExecutionContext::generate(&parent_block, timestamp, &rules);
    let mut block = Block::child(parent_id, parent_block.height, &ectx, timestamp);
    block.txs = txs;

    let mut view = vm.state().view(block.txs.len() * 2).await;
    let processor = Processor::new(&block);
    processor.prefetch(&view).await?;
    let outcome = processor.execute(&mut view, &ectx, &rules).await?;
    block.units_consumed = outcome.units_consumed;
    block.surplus_fee = outcome.surplus_fee;
    block.state_root = view.root().await?;
    Ok(block)
}
