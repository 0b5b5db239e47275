//! Executes a block's transactions against a state view.
//!
//! Execution is strictly ordered: transaction *i*'s committed writes are
//! visible to transaction *i+1*. Parallelism happens only in the prefetch
//! pass, which issues concurrent reads for every declared state key to overlap
//! state I/O with the signature work running in the background.

use crate::{
    block::Block,
    fees::ExecutionContext,
    host::Rules,
    state::View,
    tx::{balance_key, decode_balance, encode_balance, Action, Transaction},
    Error,
};
use bytes::Bytes;
use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of a single transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxResult {
    pub success: bool,
    pub units: u64,
    pub fee: u64,
    pub output: Vec<u8>,
}

/// Aggregate outcome of executing a block.
#[derive(Clone, Debug)]
pub struct Outcome {
    pub units_consumed: u64,
    pub surplus_fee: u64,
    pub results: Vec<TxResult>,
}

/// Executes one block's transaction batch.
pub struct Processor<'a> {
    block: &'a Block,
}

impl<'a> Processor<'a> {
    pub fn new(block: &'a Block) -> Self {
        Self { block }
    }

    /// Issue concurrent reads for the union of every transaction's declared
    /// state keys, warming the view before the serial execution pass.
    pub async fn prefetch<V: View>(&self, view: &V) -> Result<(), Error> {
        let mut keys: BTreeSet<Bytes> = BTreeSet::new();
        for tx in &self.block.txs {
            keys.extend(tx.state_keys());
        }
        try_join_all(keys.iter().map(|key| view.get(key))).await?;
        Ok(())
    }

    /// Execute the batch in order.
    ///
    /// A transaction that fails execution still consumes its advertised units
    /// and its fee; it does not abort the block. Structural violations that
    /// would make peers diverge (expired, underpriced, or unpayable
    /// transactions) invalidate the whole block.
    pub async fn execute<V: View, R: Rules>(
        &self,
        view: &mut V,
        ectx: &ExecutionContext,
        rules: &R,
    ) -> Result<Outcome, Error> {
        let mut units_consumed = 0u64;
        let mut surplus_fee = 0u64;
        let mut results = Vec::with_capacity(self.block.txs.len());
        let horizon = self
            .block
            .timestamp
            .saturating_add(rules.validity_window());

        for tx in &self.block.txs {
            if tx.base.timestamp < self.block.timestamp {
                return Err(Error::TxExpired(tx.id()));
            }
            if tx.base.timestamp > horizon {
                return Err(Error::TxLifetimeTooLong(tx.id()));
            }
            if tx.base.unit_price < ectx.next_unit_price {
                return Err(Error::UnderpricedTx(tx.id()));
            }

            // Charge the fee up front; fees are burned.
            let units = tx.units();
            let fee = tx.base.unit_price.saturating_mul(units);
            let sender = balance_key(&tx.auth.signer);
            let balance = decode_balance(view.get(&sender).await?);
            let Some(remaining) = balance.checked_sub(fee) else {
                return Err(Error::InsufficientBalance(tx.id()));
            };
            view.insert(sender, encode_balance(remaining)).await?;

            // Run the action against a scratch overlay so a failed transaction
            // leaves no writes behind (beyond the fee it already paid).
            let mut scratch = BTreeMap::new();
            let success = apply(view, &mut scratch, tx).await?;
            if success {
                for (key, value) in scratch {
                    view.insert(key, value).await?;
                }
            }

            units_consumed = units_consumed.saturating_add(units);
            surplus_fee = surplus_fee.saturating_add(
                (tx.base.unit_price - ectx.next_unit_price).saturating_mul(units),
            );
            results.push(TxResult {
                success,
                units,
                fee,
                output: Vec::new(),
            });
        }

        Ok(Outcome {
            units_consumed,
            surplus_fee,
            results,
        })
    }
}

/// Execute one action into `scratch`, reading through to `view`.
async fn apply<V: View>(
    view: &V,
    scratch: &mut BTreeMap<Bytes, Bytes>,
    tx: &Transaction,
) -> Result<bool, Error> {
    let sender = balance_key(&tx.auth.signer);
    match &tx.action {
        Action::Transfer { to, value } => {
            let held = read_through(view, scratch, &sender).await?;
            let Some(debited) = held.checked_sub(*value) else {
                return Ok(false);
            };
            scratch.insert(sender.clone(), encode_balance(debited));

            let recipient = balance_key(to);
            let held = read_through(view, scratch, &recipient).await?;
            let Some(credited) = held.checked_add(*value) else {
                return Ok(false);
            };
            scratch.insert(recipient, encode_balance(credited));
            Ok(true)
        }
        Action::Burn { value } => {
            // Burning nothing is not a state transition.
            if *value == 0 {
                return Ok(false);
            }
            let held = read_through(view, scratch, &sender).await?;
            let Some(debited) = held.checked_sub(*value) else {
                return Ok(false);
            };
            scratch.insert(sender, encode_balance(debited));
            Ok(true)
        }
    }
}

async fn read_through<V: View>(
    view: &V,
    scratch: &BTreeMap<Bytes, Bytes>,
    key: &Bytes,
) -> Result<u64, Error> {
    if let Some(value) = scratch.get(key) {
        return Ok(decode_balance(Some(value.clone())));
    }
    Ok(decode_balance(view.get(key).await?))
}
