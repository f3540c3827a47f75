//! Deterministic ordering of outpoints.

use bitcoin::OutPoint;
use bitcoin::hashes::Hash;
use std::cmp::Ordering;

/// Compares outpoints by transaction id, read as a 256-bit number, then by output index.
///
/// The txid is compared from its most significant byte, which is the last byte of its
/// internal representation. This is a strict total order.
pub fn compare_outpoints(a: &OutPoint, b: &OutPoint) -> Ordering {
    let a_txid = a.txid.as_byte_array();
    let b_txid = b.txid.as_byte_array();
    a_txid
        .iter()
        .rev()
        .cmp(b_txid.iter().rev())
        .then(a.vout.cmp(&b.vout))
}

/// [`OutPoint`] ordered by [`compare_outpoints`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OrderedOutPoint(pub OutPoint);

impl Ord for OrderedOutPoint {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_outpoints(&self.0, &other.0)
    }
}

impl PartialOrd for OrderedOutPoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;

    fn outpoint(txid_byte_pairs: &[(usize, u8)], vout: u32) -> OutPoint {
        let mut txid = [0u8; 32];
        for (index, byte) in txid_byte_pairs {
            txid[*index] = *byte;
        }
        OutPoint {
            txid: Txid::from_byte_array(txid),
            vout,
        }
    }

    #[test]
    fn most_significant_byte_decides() {
        // Byte 31 is the most significant.
        let low = outpoint(&[(0, 0xff)], 9);
        let high = outpoint(&[(31, 0x01)], 0);
        assert_eq!(compare_outpoints(&low, &high), Ordering::Less);
        assert_eq!(compare_outpoints(&high, &low), Ordering::Greater);
    }

    #[test]
    fn vout_breaks_ties() {
        let a = outpoint(&[(5, 7)], 1);
        let b = outpoint(&[(5, 7)], 2);
        assert_eq!(compare_outpoints(&a, &b), Ordering::Less);
        assert_eq!(compare_outpoints(&a, &a), Ordering::Equal);
    }

    #[test]
    fn strict_total_order_on_random_outpoints() {
        let mut rng = fastrand::Rng::with_seed(7);
        let outpoints = (0..40)
            .map(|_| {
                let mut txid = [0u8; 32];
                // Few distinct values so that ties and shared prefixes are common.
                for byte in txid.iter_mut().skip(28) {
                    *byte = rng.u8(0..3);
                }
                OutPoint {
                    txid: Txid::from_byte_array(txid),
                    vout: rng.u32(0..3),
                }
            })
            .collect::<Vec<_>>();

        for a in &outpoints {
            for b in &outpoints {
                let ab = compare_outpoints(a, b);
                assert_eq!(ab, compare_outpoints(b, a).reverse());
                assert_eq!(ab == Ordering::Equal, a == b);
                for c in &outpoints {
                    if ab != Ordering::Greater && compare_outpoints(b, c) != Ordering::Greater {
                        assert_ne!(compare_outpoints(a, c), Ordering::Greater);
                    }
                }
            }
        }

        let mut sorted = outpoints.iter().copied().map(OrderedOutPoint).collect::<Vec<_>>();
        sorted.sort();
        let mut shuffled = sorted.clone();
        rng.shuffle(&mut shuffled);
        shuffled.sort();
        assert_eq!(sorted, shuffled);
    }
}
