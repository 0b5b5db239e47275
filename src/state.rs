//! Narrow interface to the canonical Merkle state, plus a bundled in-memory
//! implementation.
//!
//! The lifecycle core never talks to a trie directly: it opens a writable
//! [View] over some base (the canonical [Database] or another block's
//! post-state), mutates it, computes its root, and either discards it or
//! commits it. Sibling blocks verified concurrently each fork an independent
//! view from the shared parent post-state, so their writes never collide.

use crate::Error;
use bytes::Bytes;
use commonware_cryptography::{sha256, Hasher as _, Sha256};
use commonware_storage::bmt::Builder;
use futures::lock::Mutex;
use std::{collections::BTreeMap, future::Future, sync::Arc};

/// Canonical state handle.
pub trait Database: Clone + Send + Sync + 'static {
    type View: View;

    /// Open a fresh writable view over the canonical state, sized for
    /// `estimated_changes` key changes.
    fn view(&self, estimated_changes: usize) -> impl Future<Output = Self::View> + Send;
}

/// A mutable overlay over some base state.
pub trait View: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> impl Future<Output = Result<Option<Bytes>, Error>> + Send;

    fn insert(&mut self, key: Bytes, value: Bytes)
        -> impl Future<Output = Result<(), Error>> + Send;

    fn remove(&mut self, key: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;

    /// Merkle root of the view's full contents (base plus overlay).
    fn root(&self) -> impl Future<Output = Result<sha256::Digest, Error>> + Send;

    /// Fork a child view rooted at this view's current contents.
    fn fork(&self, estimated_changes: usize) -> Self;

    /// Promote this view's changes into the canonical store.
    ///
    /// Ancestors commit before descendants (consensus accepts in order), so
    /// only the view's own overlay is applied.
    fn commit(self) -> impl Future<Output = Result<(), Error>> + Send
    where
        Self: Sized;
}

/// In-memory [Database] backed by a sorted map.
#[derive(Clone, Default)]
pub struct Store {
    canonical: Arc<Mutex<BTreeMap<Bytes, Bytes>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key directly in the canonical state (genesis allocation).
    pub async fn seed(&self, key: Bytes, value: Bytes) {
        self.canonical.lock().await.insert(key, value);
    }

    /// Merkle root of the canonical state.
    pub async fn root(&self) -> sha256::Digest {
        merkle_root(&*self.canonical.lock().await)
    }
}

impl Database for Store {
    type View = Overlay;

    async fn view(&self, _estimated_changes: usize) -> Overlay {
        let snapshot = self.canonical.lock().await.clone();
        Overlay {
            store: self.clone(),
            base: Arc::new(snapshot),
            changes: BTreeMap::new(),
        }
    }
}

/// Copy-on-write [View] over a frozen snapshot.
pub struct Overlay {
    store: Store,
    base: Arc<BTreeMap<Bytes, Bytes>>,
    /// `None` marks a deletion.
    changes: BTreeMap<Bytes, Option<Bytes>>,
}

impl Overlay {
    fn merged(&self) -> BTreeMap<Bytes, Bytes> {
        let mut merged = (*self.base).clone();
        for (key, value) in &self.changes {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged
    }
}

impl View for Overlay {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        if let Some(change) = self.changes.get(key) {
            return Ok(change.clone());
        }
        Ok(self.base.get(key).cloned())
    }

    async fn insert(&mut self, key: Bytes, value: Bytes) -> Result<(), Error> {
        self.changes.insert(key, Some(value));
        Ok(())
    }

    async fn remove(&mut self, key: &[u8]) -> Result<(), Error> {
        self.changes.insert(Bytes::copy_from_slice(key), None);
        Ok(())
    }

    async fn root(&self) -> Result<sha256::Digest, Error> {
        Ok(merkle_root(&self.merged()))
    }

    fn fork(&self, _estimated_changes: usize) -> Self {
        Self {
            store: self.store.clone(),
            base: Arc::new(self.merged()),
            changes: BTreeMap::new(),
        }
    }

    async fn commit(self) -> Result<(), Error> {
        let Self { store, changes, .. } = self;
        let mut canonical = store.canonical.lock().await;
        for (key, value) in changes {
            match value {
                Some(value) => {
                    canonical.insert(key, value);
                }
                None => {
                    canonical.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Binary Merkle tree root over the sorted key/value pairs.
///
/// Leaves are `sha256(len(key) || key || value)`; an empty state commits to
/// the zero digest.
fn merkle_root(entries: &BTreeMap<Bytes, Bytes>) -> sha256::Digest {
    if entries.is_empty() {
        return sha256::Digest::from([0u8; 32]);
    }
    let mut builder = Builder::<Sha256>::new(entries.len());
    for (key, value) in entries {
        let mut hasher = Sha256::new();
        hasher.update(&(key.len() as u32).to_be_bytes());
        hasher.update(key);
        hasher.update(value);
        builder.add(&hasher.finalize());
    }
    builder.build().root()
}
