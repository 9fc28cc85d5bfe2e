//! Store-to-store compaction: copy everything reachable from a root into a
//! destination store and prove the copy preserved the root hash.
//!
//! The walk follows branch children, short children, and hash references;
//! whenever it lands on an inline value that decodes as an account record it
//! also pulls the account's contract code across and descends into the
//! account's own storage trie as a nested root. Because node storage is
//! content-addressed, a node shared by several accounts is copied once and
//! every later visit degenerates into re-putting identical bytes.

use ethereum_types::H256;
use log::{debug, info, warn};
use thiserror::Error;

use crate::account::Account;
use crate::hasher::Hasher;
use crate::nibbles::{Nibble, Nibbles};
use crate::node::{decode_node, Node, ValueNode};
use crate::storage::Storage;
use crate::trie::{TrieError, EMPTY_ROOT};

/// An error type for copy and verification operations.
#[derive(Debug, Error)]
pub enum CopyError {
    /// A trie operation underneath failed (missing node, decode failure, or
    /// a backend error).
    #[error(transparent)]
    Trie(#[from] TrieError),

    /// A leaf did not decode as an account record and the options demanded
    /// that it must.
    #[error("leaf at path {path} does not decode as an account record")]
    MalformedLeaf {
        /// The nibble path from the root at which the leaf was found.
        path: Nibbles,
    },

    /// The recomputed destination root differed from the source root. The
    /// copy missed or corrupted reachable data; the migration that produced
    /// this must not be trusted.
    #[error("root hash mismatch after copy: expected {expected}, recomputed {actual}")]
    IntegrityMismatch {
        /// The root the copy started from.
        expected: H256,
        /// The root recomputed from the destination store.
        actual: H256,
    },
}

/// What to do with an inline leaf that does not decode as an account record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum MalformedLeafPolicy {
    /// Treat it as ordinary leaf data: keep its (already copied) bytes, skip
    /// the account-specific steps, and stop descending. This is the right
    /// choice whenever the walk can enter per-account storage tries, whose
    /// leaves are plain slot values.
    #[default]
    Skip,

    /// Abort the copy. Only sound when the caller knows every leaf of the
    /// walked trie is an account record.
    Fail,
}

/// Options controlling a copy run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CopyOptions {
    /// Policy for inline leaves that are not account records.
    pub malformed_leaf: MalformedLeafPolicy,
}

/// Counters describing what a copy run moved.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CopyStats {
    /// Nodes copied (including revisits of shared nodes).
    pub nodes: u64,
    /// Contract code blobs copied.
    pub code_blobs: u64,
    /// Per-account storage tries descended into.
    pub storage_tries: u64,
    /// Inline leaves skipped as non-account data.
    pub skipped_leaves: u64,
}

/// Copies every node reachable from `root` in `source` into `dest`,
/// together with referenced contract code and per-account storage tries.
///
/// Raw node encodings are moved verbatim under their existing hashes, so the
/// destination subtree is bit-identical to the source one. Running the same
/// copy twice is a no-op by content addressing. The empty root copies
/// nothing.
pub fn copy_trie<S: Storage, D: Storage>(
    root: H256,
    source: &S,
    dest: &D,
    options: CopyOptions,
) -> Result<CopyStats, CopyError> {
    let mut stats = CopyStats::default();

    if root == EMPTY_ROOT || root.is_zero() {
        return Ok(stats);
    }

    copy_root(root, source, dest, &Nibbles::new(), options, &mut stats)?;
    info!(
        "copied {} nodes, {} code blobs, {} storage tries from root {} ({} non-account leaves)",
        stats.nodes, stats.code_blobs, stats.storage_tries, root, stats.skipped_leaves
    );

    Ok(stats)
}

/// Recomputes the hash of the subtree stored under `root` in `storage`,
/// without writing anything.
pub fn verify_root<S: Storage>(storage: &S, root: H256) -> Result<H256, CopyError> {
    Ok(Hasher::new().check_root(root, storage)?)
}

/// Copies `root` from `source` into `dest`, then recomputes the root from
/// the destination store and fails with [`CopyError::IntegrityMismatch`]
/// unless it equals `root`.
pub fn copy_and_verify<S: Storage, D: Storage>(
    root: H256,
    source: &S,
    dest: &D,
    options: CopyOptions,
) -> Result<CopyStats, CopyError> {
    let stats = copy_trie(root, source, dest, options)?;

    let actual = verify_root(dest, root)?;
    if actual != root {
        return Err(CopyError::IntegrityMismatch {
            expected: root,
            actual,
        });
    }

    Ok(stats)
}

/// Resolves `hash` in the source, copies its raw encoding across, and walks
/// into it. Also the entry point for every nested root met along the way.
fn copy_root<S: Storage, D: Storage>(
    hash: H256,
    source: &S,
    dest: &D,
    path: &Nibbles,
    options: CopyOptions,
    stats: &mut CopyStats,
) -> Result<(), CopyError> {
    let bytes = source
        .get(hash)
        .map_err(TrieError::from)?
        .ok_or(TrieError::NotFound(hash))?;
    let node = decode_node(&bytes).map_err(TrieError::from)?;

    dest.put(hash, bytes).map_err(TrieError::from)?;
    stats.nodes += 1;

    copy_node(&node, source, dest, path, options, stats)
}

fn copy_node<S: Storage, D: Storage>(
    node: &Node,
    source: &S,
    dest: &D,
    path: &Nibbles,
    options: CopyOptions,
    stats: &mut CopyStats,
) -> Result<(), CopyError> {
    match node {
        Node::Branch { children, .. } => {
            for (i, child) in children.iter().enumerate() {
                if let Some(child) = child {
                    copy_node(
                        child,
                        source,
                        dest,
                        &path.merge_nibble(i as Nibble),
                        options,
                        stats,
                    )?;
                }
            }

            Ok(())
        }
        Node::Short { key, child, .. } => copy_node(
            child,
            source,
            dest,
            &path.merge_nibbles(key),
            options,
            stats,
        ),
        // A reference is a nested root: either a child that crossed the
        // inlining threshold, or an account's storage root.
        Node::Value(ValueNode::Hash(h)) => {
            copy_root(*h, source, dest, path, options, stats)
        }
        Node::Value(ValueNode::Inline(bytes)) => {
            copy_leaf(bytes, source, dest, path, options, stats)
        }
    }
}

/// Handles an inline leaf: if it is an account record, pull the account's
/// code and storage trie along; otherwise it is plain data and the walk ends
/// here.
fn copy_leaf<S: Storage, D: Storage>(
    bytes: &[u8],
    source: &S,
    dest: &D,
    path: &Nibbles,
    options: CopyOptions,
    stats: &mut CopyStats,
) -> Result<(), CopyError> {
    let account = match rlp::decode::<Account>(bytes) {
        Ok(account) => account,
        Err(err) => match options.malformed_leaf {
            MalformedLeafPolicy::Skip => {
                debug!("leaf at {} is not an account record ({}), keeping as plain data", path, err);
                stats.skipped_leaves += 1;
                return Ok(());
            }
            MalformedLeafPolicy::Fail => {
                return Err(CopyError::MalformedLeaf { path: path.clone() })
            }
        },
    };

    if account.has_code() {
        match source.get_code(account.code_hash).map_err(TrieError::from)? {
            Some(code) => {
                dest.put_code(account.code_hash, code)
                    .map_err(TrieError::from)?;
                stats.code_blobs += 1;
            }
            // The account record itself is intact, so this is recoverable;
            // flag it and move on.
            None => warn!(
                "code {} referenced by account at {} is missing from the source store",
                account.code_hash, path
            ),
        }
    }

    if account.has_storage() {
        stats.storage_tries += 1;
        copy_root(
            account.storage_root,
            source,
            dest,
            &Nibbles::new(),
            options,
            stats,
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ethereum_types::{Address, H256, U256};

    use super::{
        copy_and_verify, copy_trie, verify_root, CopyError, CopyOptions, MalformedLeafPolicy,
    };
    use crate::state::{State, StateObject, StorageSlot};
    use crate::storage::MemoryStorage;
    use crate::testing_utils::common_setup;
    use crate::trie::{Trie, TrieError, EMPTY_ROOT};

    /// Commits a few accounts with code and storage and returns the source
    /// store with the root.
    fn populated_state() -> (Arc<MemoryStorage>, H256) {
        let storage = Arc::new(MemoryStorage::new());
        let state = State::new(Arc::clone(&storage));

        let objects: Vec<StateObject> = (0u8..20)
            .map(|i| {
                let mut object = StateObject::new(Address::repeat_byte(i + 1));
                object.nonce = u64::from(i);
                object.balance = U256::from(1000 + u64::from(i));
                if i % 2 == 0 {
                    object.code = Some(vec![0x60, i, 0x60, 0x40, 0x52]);
                }
                if i % 3 == 0 {
                    object.storage = (0..4)
                        .map(|s| StorageSlot {
                            key: H256::from_low_u64_be(s),
                            value: Some(U256::from(100 * (s + 1))),
                        })
                        .collect();
                }
                object
            })
            .collect();

        let (_, root) = state.new_snapshot().commit(&objects).unwrap();
        (storage, root)
    }

    #[test]
    fn copy_reproduces_the_root_in_an_empty_store() {
        common_setup();

        let (source, root) = populated_state();
        let dest = Arc::new(MemoryStorage::new());

        let stats = copy_trie(root, &*source, &*dest, CopyOptions::default()).unwrap();
        assert!(stats.nodes > 0);
        assert_eq!(stats.code_blobs, 10);
        assert_eq!(stats.storage_tries, 7);

        assert_eq!(verify_root(&*dest, root).unwrap(), root);

        // Every account, code blob, and storage slot answers from the copy.
        let copied = State::new(Arc::clone(&dest));
        let snap = copied.new_snapshot_at(root).unwrap();
        for i in 0u8..20 {
            let address = Address::repeat_byte(i + 1);
            let account = snap.get_account(address).unwrap().unwrap();
            assert_eq!(account.nonce, u64::from(i));
            if i % 2 == 0 {
                assert!(dest.contains_code(account.code_hash));
            }
            if i % 3 == 0 {
                assert_eq!(
                    snap.get_storage(address, H256::from_low_u64_be(2)).unwrap(),
                    U256::from(300)
                );
            }
        }
    }

    #[test]
    fn copying_twice_changes_nothing_and_does_not_fail() {
        common_setup();

        let (source, root) = populated_state();
        let dest = Arc::new(MemoryStorage::new());

        let first = copy_trie(root, &*source, &*dest, CopyOptions::default()).unwrap();
        let nodes_after_first = dest.node_count();
        let code_after_first = dest.code_count();

        let second = copy_trie(root, &*source, &*dest, CopyOptions::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(dest.node_count(), nodes_after_first);
        assert_eq!(dest.code_count(), code_after_first);
        assert_eq!(verify_root(&*dest, root).unwrap(), root);
    }

    #[test]
    fn copy_and_verify_accepts_a_faithful_copy() {
        common_setup();

        let (source, root) = populated_state();
        let dest = MemoryStorage::new();

        copy_and_verify(root, &*source, &dest, CopyOptions::default()).unwrap();
    }

    #[test]
    fn copying_a_missing_root_fails_with_not_found() {
        common_setup();

        let source = MemoryStorage::new();
        let dest = MemoryStorage::new();
        let bogus = H256::repeat_byte(0x66);

        match copy_trie(bogus, &source, &dest, CopyOptions::default()) {
            Err(CopyError::Trie(TrieError::NotFound(h))) => assert_eq!(h, bogus),
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[test]
    fn copying_the_empty_root_copies_nothing() {
        common_setup();

        let source = MemoryStorage::new();
        let dest = MemoryStorage::new();

        let stats = copy_trie(EMPTY_ROOT, &source, &dest, CopyOptions::default()).unwrap();
        assert_eq!(stats.nodes, 0);
        assert_eq!(dest.node_count(), 0);
    }

    #[test]
    fn plain_value_tries_copy_under_the_skip_policy() {
        common_setup();

        // A trie of arbitrary values, none of which is an account record;
        // exactly what the walk meets inside per-account storage tries.
        let source = Arc::new(MemoryStorage::new());
        let mut txn = Trie::empty(Arc::clone(&source)).txn();
        for i in 0u8..50 {
            txn.insert(&[i; 32], vec![i; 40]).unwrap();
        }
        let (_, root) = txn.commit().unwrap();

        let dest = MemoryStorage::new();
        let stats = copy_trie(root, &*source, &dest, CopyOptions::default()).unwrap();

        assert_eq!(stats.skipped_leaves, 50);
        assert_eq!(verify_root(&dest, root).unwrap(), root);
    }

    #[test]
    fn strict_policy_rejects_non_account_leaves() {
        common_setup();

        let source = Arc::new(MemoryStorage::new());
        let mut txn = Trie::empty(Arc::clone(&source)).txn();
        for i in 0u8..10 {
            txn.insert(&[i; 32], vec![i; 40]).unwrap();
        }
        let (_, root) = txn.commit().unwrap();

        let dest = MemoryStorage::new();
        let options = CopyOptions {
            malformed_leaf: MalformedLeafPolicy::Fail,
        };

        assert!(matches!(
            copy_trie(root, &*source, &dest, options),
            Err(CopyError::MalformedLeaf { .. })
        ));
    }

    #[test]
    fn an_incomplete_copy_fails_verification() {
        common_setup();

        let (source, root) = populated_state();

        // Copy, then knock one interior node out of the destination.
        let dest = Arc::new(MemoryStorage::new());
        copy_trie(root, &*source, &*dest, CopyOptions::default()).unwrap();

        let victim = dest
            .node_keys()
            .into_iter()
            .find(|k| *k != root)
            .unwrap();
        dest.remove_node(victim);

        // The hole surfaces as either a missing node or a hash mismatch,
        // depending on where it sat; it must never verify clean.
        match copy_and_verify(root, &*dest, &MemoryStorage::new(), CopyOptions::default()) {
            Err(_) => {}
            Ok(_) => panic!("verification accepted a store with a missing node"),
        }
    }
}
