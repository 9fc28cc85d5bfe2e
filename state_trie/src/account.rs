//! The account record stored at the leaves of the top-level state trie.

use ethereum_types::{H256, U256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Serialize};

use crate::trie::EMPTY_ROOT;

/// Hash of empty contract code.
pub const EMPTY_CODE_HASH: H256 = keccak_hash::KECCAK_EMPTY;

/// The per-address ledger entry.
///
/// The canonical encoding is a 4-element array in exactly this field order;
/// the account's hash identity in the trie depends on it.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Account {
    /// Number of transactions sent from this account.
    pub nonce: u64,
    /// Balance in the smallest currency unit.
    pub balance: U256,
    /// Root hash of the account's own storage trie, or [`EMPTY_ROOT`] when
    /// the account has no storage.
    pub storage_root: H256,
    /// Hash of the account's contract code, or [`EMPTY_CODE_HASH`] when the
    /// account has no code.
    pub code_hash: H256,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            storage_root: EMPTY_ROOT,
            code_hash: EMPTY_CODE_HASH,
        }
    }
}

impl Account {
    /// Returns `true` if the account references contract code.
    pub fn has_code(&self) -> bool {
        self.code_hash != EMPTY_CODE_HASH && !self.code_hash.is_zero()
    }

    /// Returns `true` if the account references a non-empty storage trie.
    pub fn has_storage(&self) -> bool {
        self.storage_root != EMPTY_ROOT && !self.storage_root.is_zero()
    }
}

impl Encodable for Account {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.nonce);
        s.append(&self.balance);
        s.append(&self.storage_root);
        s.append(&self.code_hash);
    }
}

impl Decodable for Account {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.item_count()? != 4 {
            return Err(DecoderError::RlpIncorrectListLen);
        }

        Ok(Self {
            nonce: rlp.val_at(0)?,
            balance: rlp.val_at(1)?,
            storage_root: rlp.val_at(2)?,
            code_hash: rlp.val_at(3)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use ethereum_types::{H256, U256};
    use hex_literal::hex;
    use rlp_derive::RlpEncodable;

    use super::{Account, EMPTY_CODE_HASH};
    use crate::trie::EMPTY_ROOT;

    #[test]
    fn well_known_constants_have_their_canonical_values() {
        assert_eq!(
            EMPTY_ROOT.as_bytes(),
            hex!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421")
        );
        assert_eq!(
            EMPTY_CODE_HASH.as_bytes(),
            hex!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470")
        );
    }

    #[test]
    fn encoding_round_trips() {
        let account = Account {
            nonce: 9,
            balance: U256::from(1_000_000_007u64),
            storage_root: H256::repeat_byte(0xaa),
            code_hash: H256::repeat_byte(0xbb),
        };

        let encoded = rlp::encode(&account);
        assert_eq!(rlp::decode::<Account>(&encoded).unwrap(), account);
    }

    #[test]
    fn encoding_matches_the_derived_form() {
        // Field order is hash-critical, so pin it against an independently
        // derived encoder.
        #[derive(RlpEncodable)]
        struct AccountEntry {
            nonce: u64,
            balance: U256,
            storage_root: H256,
            code_hash: H256,
        }

        let account = Account {
            nonce: 3,
            balance: U256::from(42u64),
            storage_root: H256::repeat_byte(1),
            code_hash: H256::repeat_byte(2),
        };
        let derived = AccountEntry {
            nonce: 3,
            balance: U256::from(42u64),
            storage_root: H256::repeat_byte(1),
            code_hash: H256::repeat_byte(2),
        };

        assert_eq!(rlp::encode(&account), rlp::encode(&derived));
    }

    #[test]
    fn default_account_has_no_code_or_storage() {
        let account = Account::default();

        assert!(!account.has_code());
        assert!(!account.has_storage());
        assert_eq!(account.storage_root, EMPTY_ROOT);
        assert_eq!(account.code_hash, EMPTY_CODE_HASH);
    }

    #[test]
    fn non_account_bytes_fail_to_decode() {
        // A storage-slot value: a single short byte string.
        let slot_value = rlp::encode(&U256::from(77u64));
        assert!(rlp::decode::<Account>(&slot_value).is_err());

        // Right arity, wrong field widths.
        let mut stream = rlp::RlpStream::new_list(4);
        stream.append(&1u64);
        stream.append(&2u64);
        stream.append(&vec![0u8; 5]);
        stream.append(&vec![0u8; 5]);
        assert!(rlp::decode::<Account>(&stream.out()).is_err());
    }
}
