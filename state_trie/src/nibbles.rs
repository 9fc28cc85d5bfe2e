//! Nibble paths and their compact ("hex prefix") byte encoding.
//!
//! Trie keys are walked one 4-bit nibble per level, so every key is expanded
//! into twice as many nibbles before it enters the trie. Short-node keys are
//! serialized with a leading flag nibble that records whether the node is a
//! leaf or an extension, and whether the nibble count is odd, so the original
//! path is recoverable from the encoded bytes alone.

use std::fmt::{self, Display};

use bytes::{BufMut, Bytes, BytesMut};
use ethereum_types::H256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single nibble. Only the low 4 bits are ever populated.
pub type Nibble = u8;

/// Flag nibble of a compact-encoded extension key with an even nibble count.
const FLAG_EXTENSION_EVEN: u8 = 0x0;
/// Flag nibble of a compact-encoded extension key with an odd nibble count.
const FLAG_EXTENSION_ODD: u8 = 0x1;
/// Flag nibble of a compact-encoded leaf key with an even nibble count.
const FLAG_LEAF_EVEN: u8 = 0x2;
/// Flag nibble of a compact-encoded leaf key with an odd nibble count.
const FLAG_LEAF_ODD: u8 = 0x3;

/// An error that occurs when decoding compact-encoded key bytes.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FromHexPrefixError {
    /// The encoded key was empty. Even an empty path encodes to one flag
    /// byte.
    #[error("tried to decode an empty hex prefix encoding")]
    Empty,

    /// The flag nibble was outside the four defined values.
    #[error("invalid flag nibble in hex prefix encoding: {0:#x}")]
    InvalidFlag(u8),

    /// An even-length encoding carried a non-zero padding nibble.
    #[error("non-zero padding nibble in hex prefix encoding: {0:#x}")]
    InvalidPadding(u8),
}

/// A sequence of nibbles addressing a path through the trie.
///
/// Stored unpacked (one nibble per byte) since paths here are walked and
/// split far more often than they are serialized.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Nibbles(Vec<Nibble>);

impl Nibbles {
    /// Creates an empty path.
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Creates a path holding a single nibble.
    pub fn from_nibble(n: Nibble) -> Self {
        Self(vec![n & 0xf])
    }

    /// Creates a path from raw nibbles. Values must already be in `0..16`.
    pub fn from_nibbles(nibbles: &[Nibble]) -> Self {
        debug_assert!(nibbles.iter().all(|n| *n < 16));
        Self(nibbles.to_vec())
    }

    /// Expands big-endian key bytes into nibbles, high nibble first.
    pub fn from_bytes_be(bytes: &[u8]) -> Self {
        let mut nibbles = Vec::with_capacity(bytes.len() * 2);
        for b in bytes {
            nibbles.push(b >> 4);
            nibbles.push(b & 0xf);
        }

        Self(nibbles)
    }

    /// Expands a hash into its 64-nibble path.
    pub fn from_h256_be(h: H256) -> Self {
        Self::from_bytes_be(h.as_bytes())
    }

    /// The number of nibbles in the path.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the path contains no nibbles.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The nibble at `idx`. Panics when out of bounds, like slice indexing.
    pub fn at(&self, idx: usize) -> Nibble {
        self.0[idx]
    }

    /// The raw nibble slice.
    pub fn as_slice(&self) -> &[Nibble] {
        &self.0
    }

    /// The first `n` nibbles as a new path.
    pub fn prefix(&self, n: usize) -> Self {
        Self(self.0[..n].to_vec())
    }

    /// Everything from nibble `n` onwards as a new path.
    pub fn suffix(&self, n: usize) -> Self {
        Self(self.0[n..].to_vec())
    }

    /// Number of leading nibbles shared with `other`.
    pub fn common_prefix_len(&self, other: &Self) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Returns a new path with `post` appended.
    pub fn merge_nibble(&self, post: Nibble) -> Self {
        let mut nibbles = Vec::with_capacity(self.0.len() + 1);
        nibbles.extend_from_slice(&self.0);
        nibbles.push(post & 0xf);

        Self(nibbles)
    }

    /// Returns a new path with all of `post` appended.
    pub fn merge_nibbles(&self, post: &Self) -> Self {
        let mut nibbles = Vec::with_capacity(self.0.len() + post.0.len());
        nibbles.extend_from_slice(&self.0);
        nibbles.extend_from_slice(&post.0);

        Self(nibbles)
    }

    /// Compact-encodes the path into bytes.
    ///
    /// The high nibble of the first byte carries the leaf/extension flag and
    /// the parity bit; an odd-length path packs its first nibble into the low
    /// half of the flag byte so the output is always whole bytes.
    pub fn to_hex_prefix_encoding(&self, is_leaf: bool) -> Bytes {
        let odd = self.0.len() % 2 == 1;
        let flag = match (is_leaf, odd) {
            (false, false) => FLAG_EXTENSION_EVEN,
            (false, true) => FLAG_EXTENSION_ODD,
            (true, false) => FLAG_LEAF_EVEN,
            (true, true) => FLAG_LEAF_ODD,
        };

        let mut out = BytesMut::with_capacity(self.0.len() / 2 + 1);
        let mut rest = self.0.as_slice();

        match odd {
            true => {
                out.put_u8(flag << 4 | rest[0]);
                rest = &rest[1..];
            }
            false => out.put_u8(flag << 4),
        }

        for pair in rest.chunks(2) {
            out.put_u8(pair[0] << 4 | pair[1]);
        }

        out.freeze()
    }

    /// Inverts [`to_hex_prefix_encoding`](Self::to_hex_prefix_encoding),
    /// returning the path and whether the leaf flag was set.
    pub fn from_hex_prefix_encoding(bytes: &[u8]) -> Result<(Self, bool), FromHexPrefixError> {
        let first = *bytes.first().ok_or(FromHexPrefixError::Empty)?;
        let flag = first >> 4;

        let (is_leaf, odd) = match flag {
            FLAG_EXTENSION_EVEN => (false, false),
            FLAG_EXTENSION_ODD => (false, true),
            FLAG_LEAF_EVEN => (true, false),
            FLAG_LEAF_ODD => (true, true),
            _ => return Err(FromHexPrefixError::InvalidFlag(flag)),
        };

        if !odd && first & 0xf != 0 {
            return Err(FromHexPrefixError::InvalidPadding(first & 0xf));
        }

        let mut nibbles = Vec::with_capacity(bytes.len() * 2);
        if odd {
            nibbles.push(first & 0xf);
        }
        for b in &bytes[1..] {
            nibbles.push(b >> 4);
            nibbles.push(b & 0xf);
        }

        Ok((Self(nibbles), is_leaf))
    }
}

impl Display for Nibbles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for n in &self.0 {
            write!(f, "{:x}", n)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FromHexPrefixError, Nibbles};

    fn nibbles(v: &[u8]) -> Nibbles {
        Nibbles::from_nibbles(v)
    }

    #[test]
    fn from_bytes_be_expands_two_nibbles_per_byte() {
        assert_eq!(
            Nibbles::from_bytes_be(&[0x12, 0xab]),
            nibbles(&[0x1, 0x2, 0xa, 0xb])
        );
        assert!(Nibbles::from_bytes_be(&[]).is_empty());
    }

    #[test]
    fn hex_prefix_encoding_works() {
        // Even extension gets a bare `0x00` flag byte.
        assert_eq!(
            nibbles(&[0x1, 0x2, 0x3, 0x4]).to_hex_prefix_encoding(false)[..],
            [0x00, 0x12, 0x34]
        );
        // Odd extension packs the first nibble into the flag byte.
        assert_eq!(
            nibbles(&[0x1, 0x2, 0x3, 0x4, 0x5]).to_hex_prefix_encoding(false)[..],
            [0x11, 0x23, 0x45]
        );
        assert_eq!(
            nibbles(&[0x1, 0x2, 0x3, 0x4]).to_hex_prefix_encoding(true)[..],
            [0x20, 0x12, 0x34]
        );
        assert_eq!(
            nibbles(&[0x1, 0x2, 0x3, 0x4, 0x5]).to_hex_prefix_encoding(true)[..],
            [0x31, 0x23, 0x45]
        );
        // The empty path still encodes to a flag byte.
        assert_eq!(Nibbles::new().to_hex_prefix_encoding(true)[..], [0x20]);
    }

    #[test]
    fn hex_prefix_encoding_round_trips() {
        for is_leaf in [false, true] {
            for len in 0..8 {
                let path = nibbles(&(0..len).map(|i| i as u8 + 1).collect::<Vec<_>>());
                let encoded = path.to_hex_prefix_encoding(is_leaf);
                let (decoded, decoded_is_leaf) =
                    Nibbles::from_hex_prefix_encoding(&encoded).unwrap();

                assert_eq!(decoded, path);
                assert_eq!(decoded_is_leaf, is_leaf);
            }
        }
    }

    #[test]
    fn hex_prefix_decoding_rejects_garbage() {
        assert_eq!(
            Nibbles::from_hex_prefix_encoding(&[]),
            Err(FromHexPrefixError::Empty)
        );
        assert_eq!(
            Nibbles::from_hex_prefix_encoding(&[0x41, 0x23]),
            Err(FromHexPrefixError::InvalidFlag(0x4))
        );
        assert_eq!(
            Nibbles::from_hex_prefix_encoding(&[0x07, 0x23]),
            Err(FromHexPrefixError::InvalidPadding(0x7))
        );
    }

    #[test]
    fn common_prefix_len_works() {
        let a = nibbles(&[0x1, 0x2, 0x3]);
        assert_eq!(a.common_prefix_len(&nibbles(&[0x1, 0x2, 0x4])), 2);
        assert_eq!(a.common_prefix_len(&nibbles(&[0x5])), 0);
        assert_eq!(a.common_prefix_len(&a), 3);
        assert_eq!(a.common_prefix_len(&Nibbles::new()), 0);
    }

    #[test]
    fn prefix_suffix_and_merge_work() {
        let a = nibbles(&[0x1, 0x2, 0x3, 0x4]);

        assert_eq!(a.prefix(2), nibbles(&[0x1, 0x2]));
        assert_eq!(a.suffix(2), nibbles(&[0x3, 0x4]));
        assert_eq!(a.prefix(2).merge_nibbles(&a.suffix(2)), a);
        assert_eq!(Nibbles::from_nibble(0x7).merge_nibble(0x8), nibbles(&[0x7, 0x8]));
    }

    #[test]
    fn display_formats_as_hex() {
        assert_eq!(format!("{}", nibbles(&[0x1, 0xa, 0xf])), "0x1af");
        assert_eq!(format!("{}", Nibbles::new()), "0x");
    }
}
