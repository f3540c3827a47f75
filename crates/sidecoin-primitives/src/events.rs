//! Publish/subscribe notifications emitted by the chain-state engine.

use crate::{Height, SidechainBlock};
use bitcoin::{BlockHash, Txid};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Chain-state notification.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A fully validated block has been connected to the best chain.
    BlockConnected {
        block: Arc<SidechainBlock>,
        height: Height,
    },
    /// A block has been disconnected from the best chain.
    BlockDisconnected {
        block: Arc<SidechainBlock>,
        height: Height,
    },
    /// A transaction failed mempool validation.
    TransactionRejected { txid: Txid, reason: String },
}

impl ChainEvent {
    /// Hash of the block the event refers to, if any.
    pub fn block_hash(&self) -> Option<BlockHash> {
        match self {
            Self::BlockConnected { block, .. } | Self::BlockDisconnected { block, .. } => {
                Some(block.block_hash())
            }
            Self::TransactionRejected { .. } => None,
        }
    }
}

/// Identifies a subscription to the [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ChainEvent) + Send + Sync>;

/// Synchronous event bus.
///
/// Handlers run on the publishing thread in subscription order and must not call back into
/// the publisher.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&ChainEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|(sub_id, _)| *sub_id != id);
    }

    pub fn publish(&self, event: &ChainEvent) {
        // Clone the handlers so that no lock is held while they run.
        let handlers = self
            .subscribers
            .read()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect::<Vec<_>>();

        tracing::trace!(?event, subscribers = handlers.len(), "Publishing chain event");

        for handler in handlers {
            handler(event);
        }
    }
}
