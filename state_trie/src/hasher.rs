//! Canonical node serialization and hashing.
//!
//! A node's cryptographic identity is the keccak hash of its canonical RLP
//! array encoding. Encodings shorter than 32 bytes never get an identity of
//! their own: they are embedded verbatim in their parent's encoding, which is
//! what keeps shallow fan-out cheap. Everything at or above the threshold is
//! hashed, persisted under that hash, and referenced from the parent by the
//! hash alone. The root is the one exception: it is always hashed and
//! persisted, whatever its size, since its hash is the identity of the whole
//! trie.

use bytes::{Bytes, BytesMut};
use ethereum_types::H256;
use keccak_hash::keccak;
use rlp::RlpStream;

use crate::node::{Node, ValueNode};
use crate::storage::Storage;
use crate::trie::{get_node, TrieError, EMPTY_ROOT};

/// The result of encoding a node subtree.
#[derive(Clone, Debug)]
pub enum EncodedNode {
    /// Encoding below the inlining threshold, embedded in the parent as is.
    Raw(Bytes),
    /// Encoding at or above the threshold, replaced by its hash.
    Hashed([u8; 32]),
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum Mode {
    /// Hash a transaction's new nodes and persist them: hash-reference
    /// children stand for already-stored subtrees and pass through untouched.
    Commit,
    /// Recompute a hash from storage alone without writing anything:
    /// hash-reference children are resolved and re-encoded, so a missing or
    /// corrupt subtree surfaces instead of being taken on faith.
    Check,
}

/// Encodes and hashes node subtrees.
///
/// Owns a depth-indexed pool of scratch buffers: each recursion depth
/// acquires its own buffer before encoding its children and releases it once
/// the node's serialization has been copied out, so sibling subtrees at the
/// same depth reuse a single allocation. One `Hasher` serves one top-level
/// hash computation; concurrent commits each build their own.
pub(crate) struct Hasher {
    pool: Vec<Option<BytesMut>>,
}

impl Hasher {
    pub(crate) fn new() -> Self {
        Self { pool: Vec::new() }
    }

    /// Hashes a transaction's root node, persisting every node that is big
    /// enough to live on its own, plus the root itself.
    pub(crate) fn hash_root<S: Storage>(
        &mut self,
        root: Option<&Node>,
        storage: &S,
    ) -> Result<H256, TrieError> {
        let Some(root) = root else {
            return Ok(EMPTY_ROOT);
        };

        match self.encode_node(root, storage, 0, Mode::Commit)? {
            EncodedNode::Hashed(h) => Ok(H256(h)),
            EncodedNode::Raw(bytes) => {
                // A root below the threshold is still stored under its hash.
                let hash = keccak(&bytes);
                storage.put(hash, bytes.to_vec())?;
                if let Some(cache) = root.cache() {
                    cache.set(hash);
                }

                Ok(hash)
            }
        }
    }

    /// Recomputes the hash of the subtree stored under `root`, reading from
    /// `storage` only.
    pub(crate) fn check_root<S: Storage>(
        &mut self,
        root: H256,
        storage: &S,
    ) -> Result<H256, TrieError> {
        if root == EMPTY_ROOT {
            return Ok(EMPTY_ROOT);
        }

        let node = get_node(storage, root)?;
        match self.encode_node(&node, storage, 0, Mode::Check)? {
            EncodedNode::Hashed(h) => Ok(H256(h)),
            EncodedNode::Raw(bytes) => Ok(keccak(&bytes)),
        }
    }

    fn encode_node<S: Storage>(
        &mut self,
        node: &Node,
        storage: &S,
        depth: usize,
        mode: Mode,
    ) -> Result<EncodedNode, TrieError> {
        match node {
            Node::Value(ValueNode::Hash(h)) => match mode {
                Mode::Commit => Ok(EncodedNode::Hashed(h.0)),
                Mode::Check => {
                    let resolved = get_node(storage, *h)?;
                    self.encode_node(&resolved, storage, depth, mode)
                }
            },
            // Only reachable when the trie root itself is a bare value.
            Node::Value(ValueNode::Inline(bytes)) => {
                Ok(EncodedNode::Raw(rlp::encode(bytes).freeze()))
            }
            Node::Short { key, child, cache } => {
                if mode == Mode::Commit {
                    if let Some(h) = cache.get() {
                        return Ok(EncodedNode::Hashed(h.0));
                    }
                }

                let is_leaf = matches!(child.as_ref(), Node::Value(ValueNode::Inline(_)));
                let buf = self.acquire(depth);
                let mut stream = RlpStream::new_list_with_buffer(buf, 2);
                stream.append(&key.to_hex_prefix_encoding(is_leaf));
                self.encode_child(&mut stream, child, storage, depth + 1, mode)?;

                self.seal(stream.out(), depth, node, storage, mode)
            }
            Node::Branch {
                children,
                value,
                cache,
            } => {
                if mode == Mode::Commit {
                    if let Some(h) = cache.get() {
                        return Ok(EncodedNode::Hashed(h.0));
                    }
                }

                let buf = self.acquire(depth);
                let mut stream = RlpStream::new_list_with_buffer(buf, 17);
                for child in children.iter() {
                    match child {
                        Some(c) => {
                            self.encode_child(&mut stream, c, storage, depth + 1, mode)?
                        }
                        None => {
                            stream.append_empty_data();
                        }
                    }
                }
                match value {
                    Some(v) => {
                        stream.append(v);
                    }
                    None => {
                        stream.append_empty_data();
                    }
                }

                self.seal(stream.out(), depth, node, storage, mode)
            }
        }
    }

    /// Appends a child's encoding to its parent's stream.
    fn encode_child<S: Storage>(
        &mut self,
        stream: &mut RlpStream,
        child: &Node,
        storage: &S,
        depth: usize,
        mode: Mode,
    ) -> Result<(), TrieError> {
        match child {
            Node::Value(ValueNode::Hash(h)) => match mode {
                Mode::Commit => {
                    stream.append(&h.as_bytes());
                }
                Mode::Check => {
                    let resolved = get_node(storage, *h)?;
                    self.encode_child(stream, &resolved, storage, depth, mode)?;
                }
            },
            // A value's encoding is its raw bytes; values are never hashed
            // out of their parent.
            Node::Value(ValueNode::Inline(bytes)) => {
                stream.append(bytes);
            }
            Node::Short { .. } | Node::Branch { .. } => {
                match self.encode_node(child, storage, depth, mode)? {
                    EncodedNode::Raw(b) => {
                        stream.append_raw(&b, 1);
                    }
                    EncodedNode::Hashed(h) => {
                        stream.append(&h.as_ref());
                    }
                }
            }
        }

        Ok(())
    }

    /// Applies the inlining threshold to a finished serialization and, on the
    /// commit path, persists and caches what crossed it.
    fn seal<S: Storage>(
        &mut self,
        out: BytesMut,
        depth: usize,
        node: &Node,
        storage: &S,
        mode: Mode,
    ) -> Result<EncodedNode, TrieError> {
        if out.len() < 32 {
            let encoded = EncodedNode::Raw(Bytes::copy_from_slice(&out));
            self.release(depth, out);
            return Ok(encoded);
        }

        let hash = keccak(&out);
        if mode == Mode::Commit {
            storage.put(hash, out.to_vec())?;
            if let Some(cache) = node.cache() {
                cache.set(hash);
            }
        }
        self.release(depth, out);

        Ok(EncodedNode::Hashed(hash.0))
    }

    fn acquire(&mut self, depth: usize) -> BytesMut {
        if self.pool.len() <= depth {
            self.pool.resize_with(depth + 1, || None);
        }

        self.pool[depth].take().unwrap_or_default()
    }

    fn release(&mut self, depth: usize, mut buf: BytesMut) {
        buf.clear();
        self.pool[depth] = Some(buf);
    }
}
