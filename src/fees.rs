//! Fee-market accounting.
//!
//! Unit prices and block costs follow an EIP-1559-style controller: each block
//! carries a rolling [Window] of recent consumption, and the parameters for a
//! child block are a pure function of its parent and the elapsed time. Both the
//! builder (to stamp a proposal) and verification (to check the stamp) derive
//! the same [ExecutionContext], so any disagreement is detected field-by-field.

use crate::{block::Block, host::Rules};
use bytes::{Buf, BufMut};
use commonware_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};

/// Number of one-second buckets tracked by a [Window].
pub const WINDOW_SIZE: usize = 10;

/// Rolling per-second consumption history.
///
/// The last bucket is the most recent second; rolling by `elapsed` seconds
/// shifts buckets toward the front and zero-fills the newly exposed tail.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Window([u64; WINDOW_SIZE]);

impl Window {
    /// Age the window by `elapsed` seconds.
    pub fn roll(&self, elapsed: u64) -> Self {
        let mut next = [0u64; WINDOW_SIZE];
        let elapsed = elapsed.min(WINDOW_SIZE as u64) as usize;
        for (slot, value) in self.0.iter().enumerate().skip(elapsed) {
            next[slot - elapsed] = *value;
        }
        Self(next)
    }

    /// Add consumption into a bucket.
    ///
    /// # Panics
    ///
    /// Panics if `slot >= WINDOW_SIZE`.
    pub fn record(&mut self, slot: usize, value: u64) {
        self.0[slot] = self.0[slot].saturating_add(value);
    }

    /// Total consumption across all buckets.
    pub fn sum(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, v| acc.saturating_add(*v))
    }
}

impl Write for Window {
    fn write(&self, buf: &mut impl BufMut) {
        for value in &self.0 {
            value.write(buf);
        }
    }
}

impl Read for Window {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let mut buckets = [0u64; WINDOW_SIZE];
        for bucket in &mut buckets {
            *bucket = u64::read(buf)?;
        }
        Ok(Self(buckets))
    }
}

impl FixedSize for Window {
    const SIZE: usize = WINDOW_SIZE * u64::SIZE;
}

/// Fee parameters a child block must carry, derived from its parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    pub next_unit_price: u64,
    pub next_unit_window: Window,
    pub next_block_cost: u64,
    pub next_block_window: Window,
}

impl ExecutionContext {
    /// Derive the fee parameters for a block produced at `timestamp` on top of
    /// `parent`.
    ///
    /// Deterministic: two calls with equal inputs return equal contexts.
    pub fn generate<R: Rules>(parent: &Block, timestamp: i64, rules: &R) -> Self {
        let elapsed = timestamp.saturating_sub(parent.timestamp).max(0) as u64;
        let (next_unit_window, next_unit_price) = advance(
            &parent.unit_window,
            parent.units_consumed,
            elapsed,
            parent.unit_price,
            rules.window_target_units(),
            rules.min_unit_price(),
        );
        let (next_block_window, next_block_cost) = advance(
            &parent.block_window,
            1,
            elapsed,
            parent.block_cost,
            rules.window_target_blocks(),
            rules.min_block_cost(),
        );
        Self {
            next_unit_price,
            next_unit_window,
            next_block_cost,
            next_block_window,
        }
    }
}

/// Roll a parent window forward and derive the next scalar.
///
/// The parent's consumption lands in the bucket matching its own slot (it
/// happened `elapsed` seconds before the child), then total window pressure is
/// compared against the target: above raises the scalar by one, below decays
/// it by one toward `floor`.
fn advance(
    window: &Window,
    consumed: u64,
    elapsed: u64,
    current: u64,
    target: u64,
    floor: u64,
) -> (Window, u64) {
    let mut next = window.roll(elapsed);
    if (elapsed as usize) < WINDOW_SIZE {
        next.record(WINDOW_SIZE - 1 - elapsed as usize, consumed);
    }
    let usage = next.sum();
    let value = match usage.cmp(&target) {
        std::cmp::Ordering::Greater => current.saturating_add(1),
        std::cmp::Ordering::Less => current.saturating_sub(1).max(floor),
        std::cmp::Ordering::Equal => current,
    };
    (next, value)
}
