use super::{KeyHash, NodeHash};
use codec::{Decode, Encode};
use sha2::{Digest, Sha256};

/// Root of the empty trie.
pub const EMPTY_ROOT: NodeHash = [0u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Node {
    /// Up to 16 children, sorted by nibble.
    #[codec(index = 0)]
    Internal(InternalNode),
    #[codec(index = 1)]
    Leaf(LeafNode),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct InternalNode {
    pub children: Vec<(u8, NodeHash)>,
}

impl InternalNode {
    pub fn child(&self, nibble: u8) -> Option<NodeHash> {
        self.children
            .iter()
            .find(|(n, _)| *n == nibble)
            .map(|(_, hash)| *hash)
    }

    /// Replaces the child at `nibble`, removing it when `hash` is the empty root.
    pub fn set_child(&mut self, nibble: u8, hash: NodeHash) {
        self.children.retain(|(n, _)| *n != nibble);
        if hash != EMPTY_ROOT {
            let position = self
                .children
                .iter()
                .position(|(n, _)| *n > nibble)
                .unwrap_or(self.children.len());
            self.children.insert(position, (nibble, hash));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct LeafNode {
    pub key: KeyHash,
    pub value: Vec<u8>,
}

impl Node {
    pub fn hash(&self) -> NodeHash {
        Sha256::digest(self.encode()).into()
    }
}

/// Hashes a trie key.
pub fn key_hash(key: &[u8]) -> KeyHash {
    Sha256::digest(key).into()
}
