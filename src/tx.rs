//! Transactions: a fee-bearing base, an action, and an ed25519 authorization.
//!
//! A transaction is content-addressed (`id = sha256(canonical bytes)`) and
//! signed over its base and action under [TRANSACTION_NAMESPACE] so a
//! signature produced for one domain can never authorize work in another.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use commonware_codec::{EncodeSize, Error as CodecError, FixedSize, Read, ReadExt, Write};
use commonware_cryptography::{
    ed25519, sha256, Digestible, Hasher as _, Sha256, Signer as _, Verifier as _,
};

/// Domain separator for transaction signatures.
pub const TRANSACTION_NAMESPACE: &[u8] = b"_QUARRY_TX";

/// Compute units consumed by a transfer.
pub const TRANSFER_COMPUTE_UNITS: u64 = 1;

/// Compute units consumed by a burn.
pub const BURN_COMPUTE_UNITS: u64 = 1;

/// Content address of a transaction (SHA-256 of its canonical bytes).
pub type TxId = sha256::Digest;

const BALANCE_PREFIX: u8 = 0x00;

/// Storage key holding an account balance.
pub fn balance_key(key: &ed25519::PublicKey) -> Bytes {
    let mut out = Vec::with_capacity(1 + ed25519::PublicKey::SIZE);
    out.push(BALANCE_PREFIX);
    out.extend_from_slice(key.as_ref());
    out.into()
}

/// Encode a balance for storage.
pub fn encode_balance(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

/// Decode a stored balance (a missing or malformed value reads as zero).
pub fn decode_balance(value: Option<Bytes>) -> u64 {
    value
        .as_deref()
        .and_then(|raw| raw.try_into().ok())
        .map_or(0, u64::from_be_bytes)
}

/// Fields common to every transaction.
///
/// `timestamp` is the expiry: the transaction is only includable in a block
/// whose timestamp is at or before it (and within the validity window of it,
/// so the host's expiring replay map can prune). `unit_price` is the per-unit
/// fee bid and must meet the block's unit price.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Base {
    pub timestamp: i64,
    pub unit_price: u64,
}

impl Write for Base {
    fn write(&self, buf: &mut impl BufMut) {
        self.timestamp.write(buf);
        self.unit_price.write(buf);
    }
}

impl Read for Base {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let timestamp = i64::read(buf)?;
        let unit_price = u64::read(buf)?;
        Ok(Self {
            timestamp,
            unit_price,
        })
    }
}

impl FixedSize for Base {
    const SIZE: usize = i64::SIZE + u64::SIZE;
}

/// State transition requested by a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Move `value` from the signer's balance to `to`.
    Transfer { to: ed25519::PublicKey, value: u64 },
    /// Destroy `value` from the signer's balance; a zero value fails
    /// execution.
    Burn { value: u64 },
}

const TRANSFER_TAG: u8 = 0;
const BURN_TAG: u8 = 1;

impl Action {
    /// Compute units this action consumes, whether or not it succeeds.
    pub fn units(&self) -> u64 {
        match self {
            Self::Transfer { .. } => TRANSFER_COMPUTE_UNITS,
            Self::Burn { .. } => BURN_COMPUTE_UNITS,
        }
    }

    /// State keys this action may read or write, beyond the signer's balance.
    pub fn state_keys(&self) -> Vec<Bytes> {
        match self {
            Self::Transfer { to, .. } => vec![balance_key(to)],
            Self::Burn { .. } => Vec::new(),
        }
    }
}

impl Write for Action {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Self::Transfer { to, value } => {
                TRANSFER_TAG.write(buf);
                to.write(buf);
                value.write(buf);
            }
            Self::Burn { value } => {
                BURN_TAG.write(buf);
                value.write(buf);
            }
        }
    }
}

impl EncodeSize for Action {
    fn encode_size(&self) -> usize {
        u8::SIZE
            + match self {
                Self::Transfer { .. } => ed25519::PublicKey::SIZE + u64::SIZE,
                Self::Burn { .. } => u64::SIZE,
            }
    }
}

impl Read for Action {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            TRANSFER_TAG => {
                let to = ed25519::PublicKey::read(buf)?;
                let value = u64::read(buf)?;
                Ok(Self::Transfer { to, value })
            }
            BURN_TAG => {
                let value = u64::read(buf)?;
                Ok(Self::Burn { value })
            }
            _ => Err(CodecError::Invalid("quarry::tx::Action", "unknown tag")),
        }
    }
}

/// Signature over a transaction's base and action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Auth {
    pub signer: ed25519::PublicKey,
    pub signature: ed25519::Signature,
}

impl Auth {
    /// Check the signature over `payload` (the encoded base and action).
    pub fn verify(&self, payload: &[u8]) -> bool {
        self.signer
            .verify(TRANSACTION_NAMESPACE, payload, &self.signature)
    }
}

impl Write for Auth {
    fn write(&self, buf: &mut impl BufMut) {
        self.signer.write(buf);
        self.signature.write(buf);
    }
}

impl Read for Auth {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let signer = ed25519::PublicKey::read(buf)?;
        let signature = ed25519::Signature::read(buf)?;
        Ok(Self { signer, signature })
    }
}

impl FixedSize for Auth {
    const SIZE: usize = ed25519::PublicKey::SIZE + ed25519::Signature::SIZE;
}

/// A signed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub base: Base,
    pub action: Action,
    pub auth: Auth,

    /// Pre-computed content address.
    id: TxId,
}

impl Transaction {
    /// Sign `base` and `action` with `signer`.
    pub fn sign(base: Base, action: Action, signer: &ed25519::PrivateKey) -> Self {
        let payload = payload(&base, &action);
        let signature = signer.sign(TRANSACTION_NAMESPACE, &payload);
        let auth = Auth {
            signer: signer.public_key(),
            signature,
        };
        let id = compute_id(&base, &action, &auth);
        Self {
            base,
            action,
            auth,
            id,
        }
    }

    /// Assemble a transaction from parts without signing (the signature is
    /// checked later by the block's signature job, not here).
    pub fn new(base: Base, action: Action, auth: Auth) -> Self {
        let id = compute_id(&base, &action, &auth);
        Self {
            base,
            action,
            auth,
            id,
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// Compute units this transaction consumes.
    pub fn units(&self) -> u64 {
        self.action.units()
    }

    /// The bytes covered by the signature.
    pub fn payload(&self) -> Vec<u8> {
        payload(&self.base, &self.action)
    }

    /// State keys this transaction may read or write.
    pub fn state_keys(&self) -> Vec<Bytes> {
        let mut keys = vec![balance_key(&self.auth.signer)];
        keys.extend(self.action.state_keys());
        keys
    }
}

impl Digestible for Transaction {
    type Digest = TxId;

    fn digest(&self) -> TxId {
        self.id
    }
}

fn payload(base: &Base, action: &Action) -> Vec<u8> {
    let mut buf = Vec::with_capacity(Base::SIZE + action.encode_size());
    base.write(&mut buf);
    action.write(&mut buf);
    buf
}

fn compute_id(base: &Base, action: &Action, auth: &Auth) -> TxId {
    let mut buf = BytesMut::with_capacity(Base::SIZE + action.encode_size() + Auth::SIZE);
    base.write(&mut buf);
    action.write(&mut buf);
    auth.write(&mut buf);
    let mut hasher = Sha256::new();
    hasher.update(&buf);
    hasher.finalize()
}

impl Write for Transaction {
    fn write(&self, buf: &mut impl BufMut) {
        self.base.write(buf);
        self.action.write(buf);
        self.auth.write(buf);
    }
}

impl EncodeSize for Transaction {
    fn encode_size(&self) -> usize {
        Base::SIZE + self.action.encode_size() + Auth::SIZE
    }
}

impl Read for Transaction {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &Self::Cfg) -> Result<Self, CodecError> {
        let base = Base::read(buf)?;
        let action = Action::read(buf)?;
        let auth = Auth::read(buf)?;
        Ok(Self::new(base, action, auth))
    }
}
