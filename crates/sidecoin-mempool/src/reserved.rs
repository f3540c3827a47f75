use bitcoin::{OutPoint, Txid};
use parking_lot::Mutex;
use sidecoin_primitives::{ChainEvent, EventBus, SubscriptionId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct Reservations {
    outpoints: HashSet<OutPoint>,
    by_tx: HashMap<Txid, Vec<OutPoint>>,
}

/// Outputs claimed by transactions being built or broadcast, so that concurrent builders do not
/// pick the same coins.
///
/// Reservations of a transaction are released once it is mined or rejected.
#[derive(Default)]
pub struct ReservedUtxos {
    inner: Mutex<Reservations>,
}

impl ReservedUtxos {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `outpoints` for `txid`, all or nothing.
    ///
    /// Returns `false` if any of them is already reserved.
    pub fn reserve(&self, txid: Txid, outpoints: &[OutPoint]) -> bool {
        let mut inner = self.inner.lock();
        if outpoints
            .iter()
            .any(|outpoint| inner.outpoints.contains(outpoint))
        {
            return false;
        }
        inner.outpoints.extend(outpoints.iter().copied());
        inner
            .by_tx
            .entry(txid)
            .or_default()
            .extend_from_slice(outpoints);
        true
    }

    pub fn is_reserved(&self, outpoint: &OutPoint) -> bool {
        self.inner.lock().outpoints.contains(outpoint)
    }

    /// Releases every reservation of `txid`, returns the number of released outputs.
    pub fn release(&self, txid: &Txid) -> usize {
        let mut inner = self.inner.lock();
        let Some(outpoints) = inner.by_tx.remove(txid) else {
            return 0;
        };
        for outpoint in &outpoints {
            inner.outpoints.remove(outpoint);
        }
        tracing::trace!(%txid, released = outpoints.len(), "Released reserved outputs");
        outpoints.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().outpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn on_event(&self, event: &ChainEvent) {
        match event {
            ChainEvent::BlockConnected { block, .. } => {
                for tx in &block.txdata {
                    self.release(&tx.compute_txid());
                }
            }
            ChainEvent::TransactionRejected { txid, .. } => {
                self.release(txid);
            }
            ChainEvent::BlockDisconnected { .. } => {}
        }
    }

    /// Keeps the reservations in sync with the chain.
    pub fn subscribe(self: &Arc<Self>, events: &EventBus) -> SubscriptionId {
        let reserved = Arc::downgrade(self);
        events.subscribe(move |event| {
            if let Some(reserved) = reserved.upgrade() {
                reserved.on_event(event);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn outpoint(seed: u8) -> OutPoint {
        OutPoint::new(Txid::from_byte_array([seed; 32]), 0)
    }

    #[test]
    fn reservations_are_exclusive() {
        let reserved = ReservedUtxos::new();
        let a = Txid::from_byte_array([0xa; 32]);
        let b = Txid::from_byte_array([0xb; 32]);

        assert!(reserved.reserve(a, &[outpoint(1), outpoint(2)]));
        assert!(!reserved.reserve(b, &[outpoint(3), outpoint(2)]));
        // Nothing of the failed attempt is kept.
        assert!(!reserved.is_reserved(&outpoint(3)));
        assert_eq!(reserved.len(), 2);

        assert_eq!(reserved.release(&a), 2);
        assert!(reserved.is_empty());
        assert!(reserved.reserve(b, &[outpoint(3), outpoint(2)]));
    }

    #[test]
    fn rejection_event_releases() {
        let events = EventBus::new();
        let reserved = Arc::new(ReservedUtxos::new());
        reserved.subscribe(&events);

        let txid = Txid::from_byte_array([0xc; 32]);
        reserved.reserve(txid, &[outpoint(1)]);

        events.publish(&ChainEvent::TransactionRejected {
            txid,
            reason: "bad-txns-in-belowout".into(),
        });
        assert!(!reserved.is_reserved(&outpoint(1)));
    }
}
