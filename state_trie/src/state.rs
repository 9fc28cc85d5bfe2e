//! The registry of committed state roots and the snapshot views bound to
//! them.

use std::collections::HashMap;
use std::sync::Arc;

use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use log::trace;
use parking_lot::RwLock;
use thiserror::Error;

use crate::account::Account;
use crate::storage::{Storage, StorageError};
use crate::trie::{Trie, TrieError};

/// An error type for state and snapshot operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// A trie operation underneath failed.
    #[error(transparent)]
    Trie(#[from] TrieError),

    /// Bytes stored under an account key did not decode as an account
    /// record.
    #[error("stored bytes are not a valid account record: {0}")]
    Account(rlp::DecoderError),

    /// Bytes stored under a storage-slot key did not decode as a slot value.
    #[error("stored bytes are not a valid storage value: {0}")]
    SlotValue(rlp::DecoderError),

    /// The storage backend failed; passed through unchanged.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A change to one storage slot of an account.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StorageSlot {
    /// The raw (unhashed) slot key.
    pub key: H256,
    /// The new value. `None` or zero clears the slot.
    pub value: Option<U256>,
}

/// A batched change to a single account, applied by [`Snapshot::commit`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StateObject {
    /// The account's address.
    pub address: Address,
    /// New nonce.
    pub nonce: u64,
    /// New balance.
    pub balance: U256,
    /// New contract code, if it changed. Stored in the code namespace under
    /// its own hash.
    pub code: Option<Vec<u8>>,
    /// Slot writes against the account's own storage trie.
    pub storage: Vec<StorageSlot>,
    /// When set, the account leaf is removed outright and the other fields
    /// are ignored.
    pub deleted: bool,
}

impl StateObject {
    /// Creates a change record for `address` with everything else default.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ..Self::default()
        }
    }
}

/// The process-wide registry of committed roots.
///
/// Maps each root hash to its trie over one shared storage backend. The map
/// only ever grows; dropping history is an explicit migration concern (see
/// [`copy`](crate::copy)), never garbage collection. Cloning a `State` is
/// cheap and yields a handle onto the same registry.
#[derive(Debug)]
pub struct State<S> {
    storage: Arc<S>,
    tries: Arc<RwLock<HashMap<H256, Trie<S>>>>,
}

impl<S> Clone for State<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            tries: Arc::clone(&self.tries),
        }
    }
}

impl<S: Storage> State<S> {
    /// Creates a state over `storage`.
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            tries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The shared storage backend.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Opens a snapshot of the empty state.
    pub fn new_snapshot(&self) -> Snapshot<S> {
        Snapshot {
            state: self.clone(),
            trie: Trie::empty(Arc::clone(&self.storage)),
        }
    }

    /// Opens a snapshot at a historical root.
    ///
    /// The root must be resolvable in storage; an unknown root fails with
    /// [`TrieError::NotFound`] instead of producing an empty view.
    pub fn new_snapshot_at(&self, root: H256) -> Result<Snapshot<S>, StateError> {
        if let Some(trie) = self.tries.read().get(&root) {
            return Ok(Snapshot {
                state: self.clone(),
                trie: trie.clone(),
            });
        }

        let trie = Trie::new_at_root(Arc::clone(&self.storage), root)?;
        self.tries.write().insert(root, trie.clone());

        Ok(Snapshot {
            state: self.clone(),
            trie,
        })
    }
}

/// An immutable read/write view of the state at one root.
///
/// Reads are pure; [`commit`](Self::commit) never mutates the snapshot it is
/// called on, it registers a new root and hands back a fresh snapshot bound
/// to it. The old snapshot stays valid and keeps answering from its frozen
/// view.
#[derive(Debug)]
pub struct Snapshot<S> {
    state: State<S>,
    trie: Trie<S>,
}

impl<S: Storage> Snapshot<S> {
    /// The root hash this snapshot is bound to.
    pub fn root(&self) -> H256 {
        self.trie.root_hash()
    }

    /// Looks up the account stored under `address`.
    ///
    /// A missing account is `Ok(None)`, not an error.
    pub fn get_account(&self, address: Address) -> Result<Option<Account>, StateError> {
        let key = keccak(address.as_bytes());
        let Some(bytes) = self.trie.get(key.as_bytes())? else {
            return Ok(None);
        };

        let account = rlp::decode::<Account>(&bytes).map_err(StateError::Account)?;
        Ok(Some(account))
    }

    /// Reads one storage slot of the account at `address`.
    ///
    /// Returns zero for missing accounts, accounts without storage, and
    /// unset slots, mirroring how the slot would read during execution.
    pub fn get_storage(&self, address: Address, slot: H256) -> Result<U256, StateError> {
        let Some(account) = self.get_account(address)? else {
            return Ok(U256::zero());
        };
        if !account.has_storage() {
            return Ok(U256::zero());
        }

        let sub_trie = Trie::new_at_root(
            Arc::clone(self.state.storage()),
            account.storage_root,
        )?;
        let key = keccak(slot.as_bytes());
        let Some(bytes) = sub_trie.get(key.as_bytes())? else {
            return Ok(U256::zero());
        };

        let value = rlp::decode::<U256>(&bytes).map_err(StateError::SlotValue)?;
        Ok(value)
    }

    /// Fetches contract code by its hash.
    pub fn get_code(&self, hash: H256) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.state.storage().get_code(hash)?)
    }

    /// Applies a batch of account changes and commits the result.
    ///
    /// Every changed account's storage writes go through its own storage
    /// sub-trie first, then the updated account records are committed into
    /// the top-level trie. Returns the snapshot at the new root, which is
    /// also registered with the [`State`].
    pub fn commit(
        &self,
        objects: &[StateObject],
    ) -> Result<(Snapshot<S>, H256), StateError> {
        let storage = self.state.storage();
        let mut txn = self.trie.txn();

        for object in objects {
            let key = keccak(object.address.as_bytes());

            if object.deleted {
                trace!("Commit deleting account {}", object.address);
                txn.delete(key.as_bytes())?;
                continue;
            }

            let mut account = match txn.get(key.as_bytes())? {
                Some(bytes) => rlp::decode::<Account>(&bytes).map_err(StateError::Account)?,
                None => Account::default(),
            };
            account.nonce = object.nonce;
            account.balance = object.balance;

            if let Some(code) = &object.code {
                let code_hash = keccak(code);
                storage.put_code(code_hash, code.clone())?;
                account.code_hash = code_hash;
            }

            if !object.storage.is_empty() {
                let sub_trie = Trie::new_at_root(
                    Arc::clone(storage),
                    account.storage_root,
                )?;
                let mut sub_txn = sub_trie.txn();

                for slot in &object.storage {
                    let slot_key = keccak(slot.key.as_bytes());
                    match slot.value {
                        Some(value) if !value.is_zero() => {
                            sub_txn.insert(
                                slot_key.as_bytes(),
                                rlp::encode(&value).to_vec(),
                            )?;
                        }
                        _ => {
                            sub_txn.delete(slot_key.as_bytes())?;
                        }
                    }
                }

                let (_, storage_root) = sub_txn.commit()?;
                account.storage_root = storage_root;
            }

            trace!("Commit upserting account {}", object.address);
            txn.insert(key.as_bytes(), rlp::encode(&account).to_vec())?;
        }

        let (trie, root) = txn.commit()?;
        self.state.tries.write().insert(root, trie.clone());

        Ok((
            Snapshot {
                state: self.state.clone(),
                trie,
            },
            root,
        ))
    }
}
