//! Content addressed radix-16 trie.
//!
//! Keys are hashed to 32 bytes and addressed nibble by nibble. A leaf sits at the shallowest
//! depth that distinguishes it from its siblings, so a given key set always yields the same
//! root whatever the order of updates.

mod nibble;
mod node;
mod store;

pub use self::node::{EMPTY_ROOT, InternalNode, LeafNode, Node, key_hash};
pub use self::store::{MemoryNodeStore, NodeStore, PersistentNodeStore};

use self::nibble::{common_prefix_from, nibble_at};
use crate::{Error, Result};
use std::collections::HashMap;

pub type NodeHash = [u8; 32];
pub type KeyHash = [u8; 32];

/// Returns the value stored under `key` in the trie rooted at `root`.
pub fn get(store: &dyn NodeStore, root: NodeHash, key: &[u8]) -> Result<Option<Vec<u8>>> {
    let key = key_hash(key);
    let mut hash = root;
    let mut depth = 0;

    loop {
        if hash == EMPTY_ROOT {
            return Ok(None);
        }

        match load(store, &hash)? {
            Node::Leaf(leaf) => return Ok((leaf.key == key).then_some(leaf.value)),
            Node::Internal(node) => match node.child(nibble_at(&key, depth)) {
                Some(child) => {
                    hash = child;
                    depth += 1;
                }
                None => return Ok(None),
            },
        }
    }
}

/// Applies `changes` on top of `root` and returns the new root.
///
/// `None` deletes the key. New nodes are written to the store, existing roots are untouched.
pub fn update<I>(store: &dyn NodeStore, root: NodeHash, changes: I) -> Result<NodeHash>
where
    I: IntoIterator<Item = (Vec<u8>, Option<Vec<u8>>)>,
{
    let mut update = TrieUpdate {
        store,
        pending: HashMap::new(),
    };

    let mut root = root;
    for (key, value) in changes {
        let key = key_hash(&key);
        root = match value {
            Some(value) => update.insert(root, 0, key, value)?,
            None => update.delete(root, 0, &key)?,
        };
    }

    if !update.pending.is_empty() {
        store.insert(update.pending.into_iter().collect())?;
    }

    Ok(root)
}

fn load(store: &dyn NodeStore, hash: &NodeHash) -> Result<Node> {
    store
        .get(hash)?
        .ok_or_else(|| Error::MissingTrieNode(hex::encode(hash)))
}

struct TrieUpdate<'a> {
    store: &'a dyn NodeStore,
    pending: HashMap<NodeHash, Node>,
}

impl TrieUpdate<'_> {
    fn load(&self, hash: &NodeHash) -> Result<Node> {
        match self.pending.get(hash) {
            Some(node) => Ok(node.clone()),
            None => load(self.store, hash),
        }
    }

    fn put(&mut self, node: Node) -> NodeHash {
        let hash = node.hash();
        self.pending.insert(hash, node);
        hash
    }

    fn insert(&mut self, hash: NodeHash, depth: usize, key: KeyHash, value: Vec<u8>) -> Result<NodeHash> {
        if hash == EMPTY_ROOT {
            return Ok(self.put(Node::Leaf(LeafNode { key, value })));
        }

        match self.load(&hash)? {
            Node::Leaf(leaf) if leaf.key == key => Ok(self.put(Node::Leaf(LeafNode { key, value }))),
            Node::Leaf(leaf) => {
                let split = common_prefix_from(&leaf.key, &key, depth);

                let mut node = InternalNode::default();
                node.set_child(nibble_at(&leaf.key, split), hash);
                let new_leaf = self.put(Node::Leaf(LeafNode { key, value }));
                node.set_child(nibble_at(&key, split), new_leaf);

                let mut child = self.put(Node::Internal(node));
                for level in (depth..split).rev() {
                    let mut parent = InternalNode::default();
                    parent.set_child(nibble_at(&key, level), child);
                    child = self.put(Node::Internal(parent));
                }

                Ok(child)
            }
            Node::Internal(mut node) => {
                let nibble = nibble_at(&key, depth);
                let child = node.child(nibble).unwrap_or(EMPTY_ROOT);
                let new_child = self.insert(child, depth + 1, key, value)?;
                node.set_child(nibble, new_child);
                Ok(self.put(Node::Internal(node)))
            }
        }
    }

    fn delete(&mut self, hash: NodeHash, depth: usize, key: &KeyHash) -> Result<NodeHash> {
        if hash == EMPTY_ROOT {
            return Ok(EMPTY_ROOT);
        }

        match self.load(&hash)? {
            Node::Leaf(leaf) => Ok(if leaf.key == *key { EMPTY_ROOT } else { hash }),
            Node::Internal(mut node) => {
                let nibble = nibble_at(key, depth);
                let Some(child) = node.child(nibble) else {
                    return Ok(hash);
                };

                let new_child = self.delete(child, depth + 1, key)?;
                if new_child == child {
                    return Ok(hash);
                }
                node.set_child(nibble, new_child);

                if node.children.is_empty() {
                    return Ok(EMPTY_ROOT);
                }
                // A lone leaf moves up to where it is distinguished from its siblings.
                if let [(_, only)] = node.children[..] {
                    if matches!(self.load(&only)?, Node::Leaf(_)) {
                        return Ok(only);
                    }
                }

                Ok(self.put(Node::Internal(node)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(i: u32) -> (Vec<u8>, Option<Vec<u8>>) {
        (i.to_le_bytes().to_vec(), Some(format!("value-{i}").into_bytes()))
    }

    #[test]
    fn insert_get_and_delete() {
        let store = MemoryNodeStore::new();
        let root = update(&store, EMPTY_ROOT, (0..50).map(kv)).unwrap();
        assert_ne!(root, EMPTY_ROOT);

        for i in 0..50u32 {
            assert_eq!(
                get(&store, root, &i.to_le_bytes()).unwrap(),
                Some(format!("value-{i}").into_bytes())
            );
        }
        assert_eq!(get(&store, root, b"missing").unwrap(), None);

        let emptied = update(&store, root, (0..50u32).map(|i| (i.to_le_bytes().to_vec(), None))).unwrap();
        assert_eq!(emptied, EMPTY_ROOT);
        // Old roots stay readable.
        assert!(get(&store, root, &7u32.to_le_bytes()).unwrap().is_some());
    }

    #[test]
    fn root_is_independent_of_update_order() {
        let store = MemoryNodeStore::new();
        let mut entries = (0..64).map(kv).collect::<Vec<_>>();
        let expected = update(&store, EMPTY_ROOT, entries.clone()).unwrap();

        let mut rng = fastrand::Rng::with_seed(11);
        for _ in 0..5 {
            rng.shuffle(&mut entries);
            assert_eq!(update(&store, EMPTY_ROOT, entries.clone()).unwrap(), expected);
        }
    }

    #[test]
    fn delete_restores_previous_root() {
        let store = MemoryNodeStore::new();
        let base = update(&store, EMPTY_ROOT, (0..20).map(kv)).unwrap();
        let extended = update(&store, base, (20..30).map(kv)).unwrap();
        let shrunk = update(&store, extended, (20..30u32).map(|i| (i.to_le_bytes().to_vec(), None))).unwrap();
        assert_eq!(shrunk, base);
    }

    #[test]
    fn overwrite_changes_root() {
        let store = MemoryNodeStore::new();
        let root = update(&store, EMPTY_ROOT, vec![(b"k".to_vec(), Some(b"1".to_vec()))]).unwrap();
        let other = update(&store, root, vec![(b"k".to_vec(), Some(b"2".to_vec()))]).unwrap();
        assert_ne!(root, other);
        assert_eq!(get(&store, other, b"k").unwrap(), Some(b"2".to_vec()));
        assert_eq!(get(&store, root, b"k").unwrap(), Some(b"1".to_vec()));
    }
}
