use crate::Coin;
use bitcoin::{BlockHash, OutPoint};
use serde::{Deserialize, Serialize};

/// Everything needed to disconnect a block from the coin view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewindData {
    /// Tip of the view before the block was connected.
    pub previous_tip: Option<BlockHash>,
    /// Outputs spent by the block, restored on rewind.
    pub spent: Vec<(OutPoint, Coin)>,
    /// Outputs created by the block, removed on rewind.
    pub created: Vec<OutPoint>,
}

impl RewindData {
    pub fn new(previous_tip: Option<BlockHash>) -> Self {
        Self {
            previous_tip,
            ..Default::default()
        }
    }

    pub fn record_spend(&mut self, outpoint: OutPoint, coin: Coin) {
        self.spent.push((outpoint, coin));
    }

    pub fn record_create(&mut self, outpoint: OutPoint) {
        self.created.push(outpoint);
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("RewindData serialization should not fail")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    #[test]
    fn rewind_data_roundtrip() {
        let mut rewind = RewindData::new(Some(BlockHash::from_byte_array([1u8; 32])));
        rewind.record_spend(
            OutPoint::null(),
            Coin {
                is_coinbase: true,
                is_coinstake: false,
                amount: 5_000_000_000,
                height: 3,
                script_pubkey: vec![0x51],
            },
        );
        rewind.record_create(OutPoint {
            txid: bitcoin::Txid::from_byte_array([2u8; 32]),
            vout: 1,
        });

        assert_eq!(RewindData::decode(&rewind.encode()).unwrap(), rewind);
    }
}
