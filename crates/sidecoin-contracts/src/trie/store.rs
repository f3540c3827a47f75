use super::{Node, NodeHash};
use crate::Result;
use codec::{Decode, Encode};
use parking_lot::RwLock;
use sidecoin_storage::{Column, KeyValueStore, WriteBatch};
use std::collections::HashMap;
use std::sync::Arc;

/// Append-only store of trie nodes addressed by their hash.
///
/// Nodes are never removed, every root ever written stays readable.
pub trait NodeStore: Send + Sync {
    fn get(&self, hash: &NodeHash) -> Result<Option<Node>>;

    fn insert(&self, nodes: Vec<(NodeHash, Node)>) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<NodeHash, Node>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, hash: &NodeHash) -> Result<Option<Node>> {
        Ok(self.nodes.read().get(hash).cloned())
    }

    fn insert(&self, nodes: Vec<(NodeHash, Node)>) -> Result<()> {
        self.nodes.write().extend(nodes);
        Ok(())
    }
}

/// Node store persisted in the node database.
pub struct PersistentNodeStore<S: ?Sized> {
    db: Arc<S>,
}

impl<S: KeyValueStore + ?Sized> PersistentNodeStore<S> {
    pub fn new(db: Arc<S>) -> Self {
        Self { db }
    }
}

impl<S: KeyValueStore + ?Sized> NodeStore for PersistentNodeStore<S> {
    fn get(&self, hash: &NodeHash) -> Result<Option<Node>> {
        Ok(self
            .db
            .get(Column::TrieNodes, hash)?
            .map(|bytes| Node::decode(&mut bytes.as_slice()))
            .transpose()?)
    }

    fn insert(&self, nodes: Vec<(NodeHash, Node)>) -> Result<()> {
        let mut batch = WriteBatch::new();
        for (hash, node) in nodes {
            batch.put(Column::TrieNodes, hash.to_vec(), node.encode());
        }
        Ok(self.db.write(batch)?)
    }
}
