use crate::trie::{EMPTY_ROOT, NodeHash};
use codec::{Decode, Encode};

/// State of a contract account.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AccountState {
    /// Hash of the deployed code.
    pub code_hash: [u8; 32],
    /// Root of the account storage trie.
    pub storage_root: NodeHash,
    /// Name of the contract type the code declares.
    pub type_name: String,
    /// Funds held by the contract, in satoshis.
    pub balance: u64,
}

impl AccountState {
    pub fn new(code_hash: [u8; 32], type_name: String) -> Self {
        Self {
            code_hash,
            storage_root: EMPTY_ROOT,
            type_name,
            balance: 0,
        }
    }
}
