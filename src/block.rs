//! Wire form of a block and its deterministic codec.
//!
//! The encoding is length-exact: a fixed header, an explicitly counted
//! transaction vector, and a trailing commitment tuple, all big-endian. Any
//! deviation (trailing bytes, an encoding over the network cap) is rejected
//! before more expensive work happens.

use crate::{
    fees::{ExecutionContext, Window},
    tx::Transaction,
    BlockId, Error,
};
use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{
    DecodeExt, Encode, EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write,
};
use commonware_cryptography::sha256;

/// Hard cap on an encoded block, leaving headroom under the transport's 2 MiB
/// message limit for the outer envelope.
pub const NETWORK_SIZE_LIMIT: usize = 2_044_723;

/// A block as agreed on by consensus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// ID of the preceding block; zero for genesis.
    pub parent: BlockId,
    /// Unix seconds; bounded below by the parent and above by local time plus
    /// [crate::FUTURE_BOUND].
    pub timestamp: i64,
    /// `parent.height + 1`; zero for genesis.
    pub height: u64,

    /// Fee per compute unit for this block.
    pub unit_price: u64,
    /// Rolling unit-consumption history backing the price update.
    pub unit_window: Window,

    /// Target production cost.
    pub block_cost: u64,
    /// Rolling block-production history backing the cost update.
    pub block_window: Window,

    pub txs: Vec<Transaction>,

    /// Expected Merkle root after executing `txs` on the parent's post-state.
    pub state_root: sha256::Digest,
    /// Sum of per-tx compute units.
    pub units_consumed: u64,
    /// Fees paid above `unit_price * units_consumed`.
    pub surplus_fee: u64,
}

impl Block {
    /// The genesis block: zero parent, height zero, no transactions, fee
    /// parameters at their configured floors.
    pub fn genesis(root: sha256::Digest, min_unit_price: u64, min_block_cost: u64) -> Self {
        Self {
            parent: BlockId::from([0u8; 32]),
            timestamp: 0,
            height: 0,
            unit_price: min_unit_price,
            unit_window: Window::default(),
            block_cost: min_block_cost,
            block_window: Window::default(),
            txs: Vec::new(),
            state_root: root,
            units_consumed: 0,
            surplus_fee: 0,
        }
    }

    /// An empty child of `parent_id`, stamped with the fee parameters a
    /// verifier will expect. The builder fills in transactions and the
    /// commitment tuple afterward.
    pub fn child(
        parent_id: BlockId,
        parent_height: u64,
        ectx: &ExecutionContext,
        timestamp: i64,
    ) -> Self {
        Self {
            parent: parent_id,
            timestamp,
            height: parent_height + 1,
            unit_price: ectx.next_unit_price,
            unit_window: ectx.next_unit_window,
            block_cost: ectx.next_block_cost,
            block_window: ectx.next_block_window,
            txs: Vec::new(),
            state_root: sha256::Digest::from([0u8; 32]),
            units_consumed: 0,
            surplus_fee: 0,
        }
    }

    /// Canonical bytes, refusing to produce an encoding over
    /// [NETWORK_SIZE_LIMIT].
    pub fn marshal(&self) -> Result<Bytes, Error> {
        if self.encode_size() > NETWORK_SIZE_LIMIT {
            return Err(Error::InvalidObject);
        }
        Ok(self.encode())
    }

    /// Decode canonical bytes, rejecting oversized input and trailing bytes.
    pub fn unmarshal(source: &[u8]) -> Result<Self, Error> {
        if source.len() > NETWORK_SIZE_LIMIT {
            return Err(Error::InvalidObject);
        }
        match Self::decode(source) {
            Ok(block) => Ok(block),
            Err(CodecError::ExtraData(_)) => Err(Error::InvalidObject),
            Err(err) => Err(Error::Codec(err)),
        }
    }
}

impl Write for Block {
    fn write(&self, buf: &mut impl BufMut) {
        self.parent.write(buf);
        self.timestamp.write(buf);
        self.height.write(buf);

        self.unit_price.write(buf);
        self.unit_window.write(buf);

        self.block_cost.write(buf);
        self.block_window.write(buf);

        (self.txs.len() as u32).write(buf);
        for tx in &self.txs {
            tx.write(buf);
        }

        self.state_root.write(buf);
        self.units_consumed.write(buf);
        self.surplus_fee.write(buf);
    }
}

impl EncodeSize for Block {
    fn encode_size(&self) -> usize {
        BlockId::SIZE
            + i64::SIZE
            + u64::SIZE
            + u64::SIZE
            + Window::SIZE
            + u64::SIZE
            + Window::SIZE
            + u32::SIZE
            + self.txs.iter().map(Transaction::encode_size).sum::<usize>()
            + sha256::Digest::SIZE
            + u64::SIZE
            + u64::SIZE
    }
}

impl Read for Block {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let parent = BlockId::read(buf)?;
        let timestamp = i64::read(buf)?;
        let height = u64::read(buf)?;

        let unit_price = u64::read(buf)?;
        let unit_window = Window::read(buf)?;

        let block_cost = u64::read(buf)?;
        let block_window = Window::read(buf)?;

        // The count is attacker-controlled: grow as transactions decode
        // instead of preallocating (zero in genesis).
        let tx_count = u32::read(buf)?;
        let mut txs = Vec::new();
        for _ in 0..tx_count {
            txs.push(Transaction::read(buf)?);
        }

        let state_root = sha256::Digest::read(buf)?;
        let units_consumed = u64::read(buf)?;
        let surplus_fee = u64::read(buf)?;

        Ok(Self {
            parent,
            timestamp,
            height,
            unit_price,
            unit_window,
            block_cost,
            block_window,
            txs,
            state_root,
            units_consumed,
            surplus_fee,
        })
    }
}
