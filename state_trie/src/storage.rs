//! The contract every persistence backend must satisfy, plus the in-memory
//! reference backend.
//!
//! Nodes are keyed by the hash of their canonical encoding and contract code
//! by the hash of the raw bytecode, so every `put` is idempotent: two writers
//! racing on the same key are by construction writing identical bytes. The
//! core imposes no ordering or durability guarantees beyond a successful
//! `put` being visible to a later `get` on the same backend instance.

use std::collections::HashMap;

use ethereum_types::H256;
use parking_lot::RwLock;
use thiserror::Error;

/// An error produced by a storage backend.
///
/// Backend failures (I/O errors, timeouts) pass through this layer unchanged;
/// the core never retries on its own.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StorageError {
    /// The backend failed to serve the request.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// The backend gave up waiting on the request.
    #[error("storage operation timed out")]
    Timeout,
}

/// Content-addressed storage for trie nodes and contract code.
///
/// Methods take `&self` so a backend can be shared behind an
/// [`Arc`](std::sync::Arc); implementations are expected to synchronize
/// internally.
pub trait Storage: Send + Sync {
    /// Fetches a node's canonical encoding by its content hash.
    fn get(&self, key: H256) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores a node's canonical encoding under its content hash.
    fn put(&self, key: H256, value: Vec<u8>) -> Result<(), StorageError>;

    /// Fetches contract code by its hash.
    fn get_code(&self, hash: H256) -> Result<Option<Vec<u8>>, StorageError>;

    /// Stores contract code under its hash.
    fn put_code(&self, hash: H256, code: Vec<u8>) -> Result<(), StorageError>;
}

/// An in-memory [`Storage`] backend.
///
/// The reference implementation of the contract; also what the tests run
/// against.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    nodes: RwLock<HashMap<H256, Vec<u8>>>,
    code: RwLock<HashMap<H256, Vec<u8>>>,
}

impl MemoryStorage {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of stored nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// The number of stored code blobs.
    pub fn code_count(&self) -> usize {
        self.code.read().len()
    }

    /// Returns `true` if a node is stored under `key`.
    pub fn contains_node(&self, key: H256) -> bool {
        self.nodes.read().contains_key(&key)
    }

    /// Returns `true` if code is stored under `hash`.
    pub fn contains_code(&self, hash: H256) -> bool {
        self.code.read().contains_key(&hash)
    }

    /// All node keys currently stored. For corrupting stores in tests.
    #[cfg(test)]
    pub(crate) fn node_keys(&self) -> Vec<H256> {
        self.nodes.read().keys().copied().collect()
    }

    /// Drops a stored node. For corrupting stores in tests.
    #[cfg(test)]
    pub(crate) fn remove_node(&self, key: H256) {
        self.nodes.write().remove(&key);
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: H256) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.nodes.read().get(&key).cloned())
    }

    fn put(&self, key: H256, value: Vec<u8>) -> Result<(), StorageError> {
        self.nodes.write().insert(key, value);
        Ok(())
    }

    fn get_code(&self, hash: H256) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.code.read().get(&hash).cloned())
    }

    fn put_code(&self, hash: H256, code: Vec<u8>) -> Result<(), StorageError> {
        self.code.write().insert(hash, code);
        Ok(())
    }
}
