//! The persistent trie: lazy node materialization by hash, copy-on-write
//! mutation, and commits that produce a new root without touching the old
//! one.

use std::sync::Arc;

use ethereum_types::H256;
use log::trace;
use thiserror::Error;

use crate::hasher::Hasher;
use crate::nibbles::{Nibble, Nibbles};
use crate::node::{decode_node, Node, NodeDecodeError, NodeRef, ValueNode};
use crate::storage::{Storage, StorageError};

/// Root hash of the empty trie.
pub const EMPTY_ROOT: H256 = keccak_hash::KECCAK_NULL_RLP;

/// Stores the result of trie operations. Returns a [`TrieError`] upon
/// failure.
pub type TrieResult<T> = Result<T, TrieError>;

/// An error type for trie operations.
#[derive(Debug, Error)]
pub enum TrieError {
    /// A referenced node was absent from storage when dereferencing it was
    /// required. This is corruption and is always surfaced, never treated as
    /// an empty subtree.
    #[error("trie node {0} is missing from storage")]
    NotFound(H256),

    /// Stored bytes failed to parse as a node.
    #[error("stored node failed to decode: {0}")]
    Decode(#[from] NodeDecodeError),

    /// The storage backend failed; passed through unchanged.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Resolves a node from storage by its hash.
pub(crate) fn get_node<S: Storage>(storage: &S, hash: H256) -> TrieResult<NodeRef> {
    let bytes = storage.get(hash)?.ok_or(TrieError::NotFound(hash))?;
    let node = decode_node(&bytes)?;

    Ok(Arc::new(node))
}

/// An immutable trie: a root node and the storage it was built against.
///
/// Only the root is materialized up front; every other node is resolved from
/// storage the first time a traversal reaches it. A `Trie` never changes —
/// mutations go through a [`Txn`] and end in a commit that yields a new
/// `Trie`.
#[derive(Debug)]
pub struct Trie<S> {
    root: Option<NodeRef>,
    root_hash: H256,
    storage: Arc<S>,
}

impl<S> Clone for Trie<S> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            root_hash: self.root_hash,
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: Storage> Trie<S> {
    /// Creates the empty trie over `storage`.
    pub fn empty(storage: Arc<S>) -> Self {
        Self {
            root: None,
            root_hash: EMPTY_ROOT,
            storage,
        }
    }

    /// Opens the trie rooted at `root`.
    ///
    /// The root must resolve in storage; a missing root fails with
    /// [`TrieError::NotFound`] rather than yielding an empty trie. The
    /// well-known empty root (and the all-zero hash) short-circuit to the
    /// empty trie without touching storage.
    pub fn new_at_root(storage: Arc<S>, root: H256) -> TrieResult<Self> {
        if root == EMPTY_ROOT || root.is_zero() {
            return Ok(Self::empty(storage));
        }

        let node = get_node(&*storage, root)?;
        Ok(Self {
            root: Some(node),
            root_hash: root,
            storage,
        })
    }

    /// The hash this trie is rooted at.
    pub fn root_hash(&self) -> H256 {
        self.root_hash
    }

    /// Looks up the value stored under `key`.
    ///
    /// Returns `Ok(None)` when the key path ends in a missing branch slot or
    /// a prefix mismatch; a dangling hash reference is an error.
    pub fn get(&self, key: &[u8]) -> TrieResult<Option<Vec<u8>>> {
        lookup(&*self.storage, self.root.as_ref(), key)
    }

    /// Starts a copy-on-write transaction from this trie's root.
    pub fn txn(&self) -> Txn<S> {
        Txn {
            root: self.root.clone(),
            storage: Arc::clone(&self.storage),
        }
    }
}

fn lookup<S: Storage>(
    storage: &S,
    root: Option<&NodeRef>,
    key: &[u8],
) -> TrieResult<Option<Vec<u8>>> {
    let Some(root) = root else {
        return Ok(None);
    };

    let path = Nibbles::from_bytes_be(key);
    let path = path.as_slice();
    let mut node = Arc::clone(root);
    let mut offset = 0;

    loop {
        let next;
        match node.as_ref() {
            Node::Value(ValueNode::Hash(h)) => {
                next = get_node(storage, *h)?;
            }
            Node::Value(ValueNode::Inline(bytes)) => {
                trace!("Get traversed Value");
                return Ok((offset == path.len()).then(|| bytes.clone()));
            }
            Node::Short { key, child, .. } => {
                trace!("Get traversed Short (key: {})", key);
                let rest = &path[offset..];
                if rest.len() < key.len() || rest[..key.len()] != *key.as_slice() {
                    return Ok(None);
                }

                offset += key.len();
                next = Arc::clone(child);
            }
            Node::Branch {
                children, value, ..
            } => {
                if offset == path.len() {
                    return Ok(value.clone());
                }

                let nib = path[offset];
                trace!("Get traversed Branch (nibble: {:x})", nib);
                match &children[nib as usize] {
                    None => return Ok(None),
                    Some(child) => {
                        offset += 1;
                        next = Arc::clone(child);
                    }
                }
            }
        }

        node = next;
    }
}

/// A copy-on-write transaction over a trie.
///
/// Mutations rebuild only the path from the changed position up to the root;
/// everything else is shared with the parent trie by reference. The parent
/// trie and every previously committed root stay intact whatever happens
/// here.
#[derive(Debug)]
pub struct Txn<S> {
    root: Option<NodeRef>,
    storage: Arc<S>,
}

impl<S: Storage> Txn<S> {
    /// Looks up `key` in the transaction's current (uncommitted) state.
    pub fn get(&self, key: &[u8]) -> TrieResult<Option<Vec<u8>>> {
        lookup(&*self.storage, self.root.as_ref(), key)
    }

    /// Inserts or replaces the value under `key`.
    pub fn insert(&mut self, key: &[u8], value: Vec<u8>) -> TrieResult<()> {
        let path = Nibbles::from_bytes_be(key);
        trace!("Inserting key {}...", path);

        let new_root = self.insert_rec(self.root.clone(), path.as_slice(), value)?;
        self.root = Some(new_root);

        Ok(())
    }

    /// Deletes the value under `key`, returning it when it was present.
    pub fn delete(&mut self, key: &[u8]) -> TrieResult<Option<Vec<u8>>> {
        let path = Nibbles::from_bytes_be(key);
        trace!("Deleting key {} if it exists", path);

        let Some(root) = self.root.clone() else {
            return Ok(None);
        };

        match self.delete_rec(&root, path.as_slice())? {
            None => Ok(None),
            Some((new_root, deleted)) => {
                self.root = new_root;
                Ok(Some(deleted))
            }
        }
    }

    /// Hashes the transaction's current root, persisting new nodes.
    ///
    /// Also usable mid-transaction; the final call is what
    /// [`commit`](Self::commit) performs.
    pub fn root_hash(&self) -> TrieResult<H256> {
        Hasher::new().hash_root(self.root.as_deref(), &*self.storage)
    }

    /// Hashes and persists the new root, consuming the transaction.
    ///
    /// Returns the committed trie and its root hash. Nodes of the base trie
    /// were never touched, so snapshots of older roots keep working.
    pub fn commit(self) -> TrieResult<(Trie<S>, H256)> {
        let root_hash = self.root_hash()?;

        Ok((
            Trie {
                root: self.root,
                root_hash,
                storage: self.storage,
            },
            root_hash,
        ))
    }

    fn insert_rec(
        &self,
        node: Option<NodeRef>,
        path: &[Nibble],
        value: Vec<u8>,
    ) -> TrieResult<NodeRef> {
        let Some(node) = node else {
            return Ok(Node::leaf(Nibbles::from_nibbles(path), value));
        };

        match node.as_ref() {
            Node::Value(ValueNode::Hash(h)) => {
                let resolved = get_node(&*self.storage, *h)?;
                self.insert_rec(Some(resolved), path, value)
            }
            Node::Value(ValueNode::Inline(old)) => {
                trace!("Insert traversed Value");
                if path.is_empty() {
                    return Ok(Node::inline(value));
                }

                // The old value ends at a strict prefix of the new key, so a
                // branch holding it as its value takes this position.
                let mut children = Node::empty_children();
                children[path[0] as usize] =
                    Some(self.insert_rec(None, &path[1..], value)?);

                Ok(Node::branch(children, Some(old.clone())))
            }
            Node::Short { key, child, .. } => {
                trace!("Insert traversed Short (key: {})", key);
                let common = key
                    .as_slice()
                    .iter()
                    .zip(path.iter())
                    .take_while(|(a, b)| a == b)
                    .count();

                // The whole short key matched; carry on below it.
                if common == key.len() {
                    let new_child =
                        self.insert_rec(Some(Arc::clone(child)), &path[common..], value)?;
                    return Ok(Node::short(key.clone(), new_child));
                }

                // Diverged inside the compressed run: split it with a branch
                // at the first differing nibble.
                let mut children = Node::empty_children();
                let mut branch_value = None;

                // When nothing of the run remains, an interior child drops
                // straight into the branch slot; an inline value keeps an
                // (empty-keyed) leaf around it so the slot stays a node.
                let existing_rest = key.suffix(common + 1);
                let existing = if existing_rest.is_empty()
                    && !matches!(child.as_ref(), Node::Value(ValueNode::Inline(_)))
                {
                    Arc::clone(child)
                } else {
                    Node::short(existing_rest, Arc::clone(child))
                };
                children[key.at(common) as usize] = Some(existing);

                match path.len() == common {
                    true => branch_value = Some(value),
                    false => {
                        children[path[common] as usize] =
                            Some(self.insert_rec(None, &path[common + 1..], value)?);
                    }
                }

                let branch = Node::branch(children, branch_value);
                Ok(match common {
                    0 => branch,
                    _ => Node::short(key.prefix(common), branch),
                })
            }
            Node::Branch {
                children, value: branch_value, ..
            } => {
                if path.is_empty() {
                    trace!("Insert placed value in Branch");
                    return Ok(Node::branch(children.clone(), Some(value)));
                }

                let nib = path[0] as usize;
                trace!("Insert traversed Branch (nibble: {:x})", nib);
                let new_child = self.insert_rec(children[nib].clone(), &path[1..], value)?;

                let mut new_children = children.clone();
                new_children[nib] = Some(new_child);
                Ok(Node::branch(new_children, branch_value.clone()))
            }
        }
    }

    /// Deletes `path` under `node`.
    ///
    /// `Ok(None)` means the key was not present; otherwise the replacement
    /// node (`None` when the whole subtree vanished) and the deleted value
    /// are returned.
    #[allow(clippy::type_complexity)]
    fn delete_rec(
        &self,
        node: &NodeRef,
        path: &[Nibble],
    ) -> TrieResult<Option<(Option<NodeRef>, Vec<u8>)>> {
        match node.as_ref() {
            Node::Value(ValueNode::Hash(h)) => {
                let resolved = get_node(&*self.storage, *h)?;
                self.delete_rec(&resolved, path)
            }
            Node::Value(ValueNode::Inline(bytes)) => {
                trace!("Delete traversed Value");
                Ok(path.is_empty().then(|| (None, bytes.clone())))
            }
            Node::Short { key, child, .. } => {
                trace!("Delete traversed Short (key: {})", key);
                if path.len() < key.len() || path[..key.len()] != *key.as_slice() {
                    return Ok(None);
                }

                match self.delete_rec(child, &path[key.len()..])? {
                    None => Ok(None),
                    Some((None, deleted)) => Ok(Some((None, deleted))),
                    Some((Some(new_child), deleted)) => {
                        // A short child merges into this node's key run.
                        let merged = match new_child.as_ref() {
                            Node::Short {
                                key: child_key,
                                child: grandchild,
                                ..
                            } => Node::short(
                                key.merge_nibbles(child_key),
                                Arc::clone(grandchild),
                            ),
                            _ => Node::short(key.clone(), new_child),
                        };

                        Ok(Some((Some(merged), deleted)))
                    }
                }
            }
            Node::Branch {
                children, value, ..
            } => {
                if path.is_empty() {
                    let Some(deleted) = value.clone() else {
                        return Ok(None);
                    };

                    let replacement = self.collapse_branch(children.clone(), None)?;
                    return Ok(Some((replacement, deleted)));
                }

                let nib = path[0] as usize;
                trace!("Delete traversed Branch (nibble: {:x})", nib);
                let Some(child) = &children[nib] else {
                    return Ok(None);
                };

                match self.delete_rec(child, &path[1..])? {
                    None => Ok(None),
                    Some((new_child, deleted)) => {
                        let mut new_children = children.clone();
                        let child_remains = new_child.is_some();
                        new_children[nib] = new_child;

                        let replacement = match child_remains {
                            true => Some(Node::branch(new_children, value.clone())),
                            false => self.collapse_branch(new_children, value.clone())?,
                        };

                        Ok(Some((replacement, deleted)))
                    }
                }
            }
        }
    }

    /// Re-canonicalizes a branch that just lost a child.
    ///
    /// A branch left with a single child and no value is folded into a short
    /// node (merging key runs where the child is itself short, which may
    /// require resolving a hash reference to learn its shape); one left with
    /// only a value becomes a bare value for the parent to absorb.
    fn collapse_branch(
        &self,
        children: [Option<NodeRef>; 16],
        value: Option<Vec<u8>>,
    ) -> TrieResult<Option<NodeRef>> {
        let mut count = 0;
        let mut single = None;
        for (i, child) in children.iter().enumerate() {
            if let Some(child) = child {
                count += 1;
                if count == 1 {
                    single = Some((i as Nibble, Arc::clone(child)));
                }
            }
        }

        match (count, value) {
            (0, None) => Ok(None),
            (0, Some(v)) => Ok(Some(Node::inline(v))),
            (1, None) => {
                let Some((nib, child)) = single else {
                    unreachable!("branch with one child had no occupied slot")
                };

                let resolved = match child.as_ref() {
                    Node::Value(ValueNode::Hash(h)) => get_node(&*self.storage, *h)?,
                    _ => Arc::clone(&child),
                };
                trace!(
                    "Collapsing branch into slot {:x} ({})",
                    nib,
                    resolved.kind()
                );

                let merged = match resolved.as_ref() {
                    Node::Short {
                        key,
                        child: grandchild,
                        ..
                    } => Node::short(
                        Nibbles::from_nibble(nib).merge_nibbles(key),
                        Arc::clone(grandchild),
                    ),
                    _ => Node::short(Nibbles::from_nibble(nib), child),
                };

                Ok(Some(merged))
            }
            (_, value) => Ok(Some(Node::branch(children, value))),
        }
    }
}
