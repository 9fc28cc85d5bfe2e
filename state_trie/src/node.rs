//! The trie node model and decoding of nodes from their stored encoding.

use std::fmt::{self, Display};
use std::sync::Arc;

use ethereum_types::H256;
use parking_lot::RwLock;
use rlp::{Prototype, Rlp};
use thiserror::Error;

use crate::nibbles::{FromHexPrefixError, Nibbles};

/// Alias for a shared, immutable reference to a node.
///
/// Committed nodes are never mutated in place; structural sharing between a
/// trie and the tries derived from it is all done through these references.
pub type NodeRef = Arc<Node>;

/// An error that occurs when stored bytes fail to parse as a trie node.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NodeDecodeError {
    /// The stored item was not an RLP array.
    #[error("stored node is not an RLP array: {0}")]
    Rlp(#[from] rlp::DecoderError),

    /// The array had neither branch (17) nor short (2) arity.
    #[error("stored node array has {0} items, expected 2 or 17")]
    UnexpectedArity(usize),

    /// A child slot held a byte string that is not empty and not a 32-byte
    /// hash reference.
    #[error("child reference has invalid length {0}")]
    InvalidChildReference(usize),

    /// The compact-encoded key of a short node was malformed.
    #[error(transparent)]
    HexPrefix(#[from] FromHexPrefixError),

    /// A leaf carried something other than a byte string as its value.
    #[error("leaf value is not a byte string")]
    NonDataLeafValue,
}

/// A per-node cache of the node's own hash.
///
/// Populated exactly once, when the node is first hashed during a commit;
/// never invalidated, since a node whose content would change is always
/// rebuilt as a new node instead. Clones share the cache, as clones represent
/// the same content.
#[derive(Clone, Debug, Default)]
pub struct HashCache(Arc<RwLock<Option<H256>>>);

impl HashCache {
    /// The cached hash, if this node has been hashed before.
    pub fn get(&self) -> Option<H256> {
        *self.0.read()
    }

    /// Records the node's hash.
    pub(crate) fn set(&self, h: H256) {
        *self.0.write() = Some(h);
    }
}

/// The payload of a [`Node::Value`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ValueNode {
    /// Payload bytes embedded directly in the parent node.
    Inline(Vec<u8>),

    /// A subtree that lives in storage under this hash and is only
    /// materialized when the traversal actually needs it.
    Hash(H256),
}

/// A node in the trie.
#[derive(Clone, Debug)]
pub enum Node {
    /// Leaf data, or an unresolved reference to a stored subtree.
    Value(ValueNode),

    /// A compressed run of nibbles with exactly one child: an extension when
    /// the child is another interior node, a leaf when the child is an
    /// inline value. Which of the two it is gets baked into the key's
    /// compact encoding.
    Short {
        /// The nibbles this node compresses.
        key: Nibbles,
        /// The single child below the compressed run.
        child: NodeRef,
        /// Cache of this node's hash.
        cache: HashCache,
    },

    /// A sixteen-way fork, one slot per hex nibble, plus an optional value
    /// for a key that ends exactly here.
    Branch {
        /// The children, indexed by the next nibble of the key.
        children: [Option<NodeRef>; 16],
        /// The value stored at this exact path, if any.
        value: Option<Vec<u8>>,
        /// Cache of this node's hash.
        cache: HashCache,
    },
}

impl Node {
    /// Creates an inline value node.
    pub fn inline(bytes: Vec<u8>) -> NodeRef {
        Arc::new(Node::Value(ValueNode::Inline(bytes)))
    }

    /// Creates an unresolved hash-reference node.
    pub fn hash_ref(h: H256) -> NodeRef {
        Arc::new(Node::Value(ValueNode::Hash(h)))
    }

    /// Creates a short node.
    pub fn short(key: Nibbles, child: NodeRef) -> NodeRef {
        Arc::new(Node::Short {
            key,
            child,
            cache: HashCache::default(),
        })
    }

    /// Creates a leaf: a short node holding an inline value.
    pub fn leaf(key: Nibbles, value: Vec<u8>) -> NodeRef {
        Self::short(key, Self::inline(value))
    }

    /// Creates a branch node.
    pub fn branch(children: [Option<NodeRef>; 16], value: Option<Vec<u8>>) -> NodeRef {
        Arc::new(Node::Branch {
            children,
            value,
            cache: HashCache::default(),
        })
    }

    /// A fresh, fully empty child array.
    pub fn empty_children() -> [Option<NodeRef>; 16] {
        std::array::from_fn(|_| None)
    }

    /// The hash cache of this node, for the node kinds that carry one.
    pub(crate) fn cache(&self) -> Option<&HashCache> {
        match self {
            Node::Value(_) => None,
            Node::Short { cache, .. } | Node::Branch { cache, .. } => Some(cache),
        }
    }

    /// The simplified kind of this node, for logging.
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Value(ValueNode::Inline(_)) => NodeKind::Value,
            Node::Value(ValueNode::Hash(_)) => NodeKind::HashRef,
            Node::Short { .. } => NodeKind::Short,
            Node::Branch { .. } => NodeKind::Branch,
        }
    }
}

/// Simplified node type to make logging cleaner.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NodeKind {
    /// Inline value node.
    Value,
    /// Unresolved hash reference.
    HashRef,
    /// Short (extension or leaf) node.
    Short,
    /// Branch node.
    Branch,
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeKind::Value => "Value",
            NodeKind::HashRef => "HashRef",
            NodeKind::Short => "Short",
            NodeKind::Branch => "Branch",
        };

        write!(f, "{}", s)
    }
}

/// Decodes a node from its canonical stored encoding.
///
/// Branch children and extension children may appear either as an empty
/// placeholder, a 32-byte hash reference, or — when the child's own encoding
/// was under 32 bytes — as a nested array embedded right in the parent.
pub fn decode_node(bytes: &[u8]) -> Result<Node, NodeDecodeError> {
    let rlp = Rlp::new(bytes);

    match rlp.prototype()? {
        Prototype::List(17) => decode_branch(&rlp),
        Prototype::List(2) => decode_short(&rlp),
        Prototype::List(n) => Err(NodeDecodeError::UnexpectedArity(n)),
        _ => Err(NodeDecodeError::Rlp(rlp::DecoderError::RlpExpectedToBeList)),
    }
}

fn decode_branch(rlp: &Rlp<'_>) -> Result<Node, NodeDecodeError> {
    let mut children = Node::empty_children();
    for (i, slot) in children.iter_mut().enumerate() {
        *slot = decode_child(&rlp.at(i)?)?;
    }

    let value_item = rlp.at(16)?;
    let value = match value_item.prototype()? {
        Prototype::Data(0) => None,
        Prototype::Data(_) => Some(value_item.data()?.to_vec()),
        _ => return Err(NodeDecodeError::NonDataLeafValue),
    };

    Ok(Node::Branch {
        children,
        value,
        cache: HashCache::default(),
    })
}

fn decode_short(rlp: &Rlp<'_>) -> Result<Node, NodeDecodeError> {
    let (key, is_leaf) = Nibbles::from_hex_prefix_encoding(rlp.at(0)?.data()?)?;

    let child = match is_leaf {
        true => {
            let value_item = rlp.at(1)?;
            match value_item.prototype()? {
                Prototype::Data(_) => Node::inline(value_item.data()?.to_vec()),
                _ => return Err(NodeDecodeError::NonDataLeafValue),
            }
        }
        false => decode_child(&rlp.at(1)?)?
            .ok_or(NodeDecodeError::InvalidChildReference(0))?,
    };

    Ok(Node::Short {
        key,
        child,
        cache: HashCache::default(),
    })
}

/// Decodes a child slot: empty placeholder, hash reference, or inlined node.
fn decode_child(item: &Rlp<'_>) -> Result<Option<NodeRef>, NodeDecodeError> {
    match item.prototype()? {
        Prototype::Data(0) => Ok(None),
        Prototype::Data(32) => Ok(Some(Node::hash_ref(H256::from_slice(item.data()?)))),
        Prototype::Data(n) => Err(NodeDecodeError::InvalidChildReference(n)),
        Prototype::List(_) => Ok(Some(Arc::new(decode_node(item.as_raw())?))),
        Prototype::Null => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use ethereum_types::H256;
    use rlp::RlpStream;

    use super::{decode_node, Node, NodeDecodeError, ValueNode};
    use crate::nibbles::Nibbles;

    #[test]
    fn decodes_a_leaf() {
        let key = Nibbles::from_nibbles(&[0x1, 0x2, 0x3]);
        let mut stream = RlpStream::new_list(2);
        stream.append(&key.to_hex_prefix_encoding(true));
        stream.append(&vec![0xde, 0xad]);

        let node = decode_node(&stream.out()).unwrap();
        match node {
            Node::Short { key: k, child, .. } => {
                assert_eq!(k, key);
                assert!(matches!(
                    child.as_ref(),
                    Node::Value(ValueNode::Inline(v)) if *v == [0xde, 0xad]
                ));
            }
            other => panic!("expected a short node, got {:?}", other),
        }
    }

    #[test]
    fn decodes_an_extension_with_a_hash_child() {
        let key = Nibbles::from_nibbles(&[0xa, 0xb]);
        let target = H256::repeat_byte(0x42);

        let mut stream = RlpStream::new_list(2);
        stream.append(&key.to_hex_prefix_encoding(false));
        stream.append(&target.as_bytes());

        let node = decode_node(&stream.out()).unwrap();
        match node {
            Node::Short { key: k, child, .. } => {
                assert_eq!(k, key);
                assert!(matches!(
                    child.as_ref(),
                    Node::Value(ValueNode::Hash(h)) if *h == target
                ));
            }
            other => panic!("expected a short node, got {:?}", other),
        }
    }

    #[test]
    fn decodes_a_branch_with_mixed_slots() {
        let target = H256::repeat_byte(0x17);

        // An inlined leaf, small enough to sit inside the branch.
        let mut leaf = RlpStream::new_list(2);
        leaf.append(&Nibbles::from_nibble(0x5).to_hex_prefix_encoding(true));
        leaf.append(&vec![0x7]);
        let leaf_bytes = leaf.out();

        let mut stream = RlpStream::new_list(17);
        stream.append(&target.as_bytes());
        stream.append_raw(&leaf_bytes, 1);
        for _ in 2..16 {
            stream.append_empty_data();
        }
        stream.append(&vec![0x99]);

        let node = decode_node(&stream.out()).unwrap();
        match node {
            Node::Branch {
                children, value, ..
            } => {
                assert!(matches!(
                    children[0].as_deref(),
                    Some(Node::Value(ValueNode::Hash(h))) if *h == target
                ));
                assert!(matches!(children[1].as_deref(), Some(Node::Short { .. })));
                assert!(children[2..].iter().all(|c| c.is_none()));
                assert_eq!(value, Some(vec![0x99]));
            }
            other => panic!("expected a branch node, got {:?}", other),
        }
    }

    #[test]
    fn rejects_invalid_arity_and_child_references() {
        let mut three = RlpStream::new_list(3);
        for _ in 0..3 {
            three.append_empty_data();
        }
        assert!(matches!(
            decode_node(&three.out()),
            Err(NodeDecodeError::UnexpectedArity(3))
        ));

        // A 5-byte child slot is neither empty, inlined, nor a hash.
        let mut bad_child = RlpStream::new_list(17);
        bad_child.append(&vec![1u8, 2, 3, 4, 5]);
        for _ in 1..17 {
            bad_child.append_empty_data();
        }
        assert!(matches!(
            decode_node(&bad_child.out()),
            Err(NodeDecodeError::InvalidChildReference(5))
        ));

        // A bare byte string is not a node.
        let data = rlp::encode(&vec![1u8, 2, 3]);
        assert!(decode_node(&data).is_err());
    }
}
