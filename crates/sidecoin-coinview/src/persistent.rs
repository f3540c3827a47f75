use crate::{Coin, CoinChanges, CoinView, Error, Result, RewindData, UnspentOutput};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, OutPoint};
use codec::{Decode, Encode};
use parking_lot::RwLock;
use sidecoin_primitives::Height;
use sidecoin_storage::{Column, KeyValueStore, WriteBatch};
use std::sync::Arc;

const TIP_KEY: &[u8] = b"tip";

/// Format: txid (32 bytes, raw) || vout (4 bytes, little-endian)
fn outpoint_to_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(outpoint.txid.as_ref());
    key[32..].copy_from_slice(&outpoint.vout.to_le_bytes());
    key
}

fn rewind_key(height: Height) -> [u8; 4] {
    height.to_be_bytes()
}

/// Coin view backed by the node store.
///
/// Commits and rewinds hold the write lock, lookups observe either the state before or the
/// state after a block, never a partial one.
pub struct PersistentCoinView<S: ?Sized> {
    db: Arc<S>,
    lock: RwLock<()>,
}

impl<S: KeyValueStore + ?Sized> PersistentCoinView<S> {
    pub fn new(db: Arc<S>) -> Self {
        Self {
            db,
            lock: RwLock::new(()),
        }
    }

    fn read_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        self.db
            .get(Column::Coins, &outpoint_to_key(outpoint))?
            .map(|bytes| {
                Coin::decode(&mut bytes.as_slice()).map_err(|source| Error::CorruptedCoin {
                    outpoint: *outpoint,
                    source,
                })
            })
            .transpose()
    }

    fn read_tip(&self) -> Result<Option<BlockHash>> {
        Ok(self
            .db
            .get(Column::CoinMeta, TIP_KEY)?
            .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
            .map(BlockHash::from_byte_array))
    }

    /// Applies the changes of a fully validated block.
    pub fn commit(&self, changes: CoinChanges) -> Result<()> {
        let _guard = self.lock.write();

        let tip = self.read_tip()?;
        if tip != changes.rewind.previous_tip {
            return Err(Error::TipMismatch {
                expected: changes.rewind.previous_tip,
                actual: tip,
            });
        }

        let mut batch = WriteBatch::new();
        let (mut created, mut spent) = (0usize, 0usize);
        for (outpoint, coin) in &changes.coins {
            let key = outpoint_to_key(outpoint).to_vec();
            match coin {
                Some(coin) => {
                    batch.put(Column::Coins, key, coin.encode());
                    created += 1;
                }
                None => {
                    batch.delete(Column::Coins, key);
                    spent += 1;
                }
            }
        }
        batch.put(
            Column::Rewind,
            rewind_key(changes.height).to_vec(),
            changes.rewind.encode(),
        );
        batch.put(
            Column::CoinMeta,
            TIP_KEY.to_vec(),
            changes.block_hash.to_byte_array().to_vec(),
        );

        self.db.write(batch)?;

        tracing::debug!(
            height = changes.height,
            block_hash = %changes.block_hash,
            created,
            spent,
            "Committed coin view changes"
        );

        Ok(())
    }

    /// Disconnects the block at `height`, which must be the current tip.
    pub fn rewind(&self, height: Height) -> Result<RewindData> {
        let _guard = self.lock.write();

        let bytes = self
            .db
            .get(Column::Rewind, &rewind_key(height))?
            .ok_or(Error::RewindNotFound(height))?;
        let rewind = RewindData::decode(&bytes)?;

        let mut batch = WriteBatch::new();
        for (outpoint, coin) in &rewind.spent {
            batch.put(Column::Coins, outpoint_to_key(outpoint).to_vec(), coin.encode());
        }
        // Outputs both created and spent by the block end up removed.
        for outpoint in &rewind.created {
            batch.delete(Column::Coins, outpoint_to_key(outpoint).to_vec());
        }
        batch.delete(Column::Rewind, rewind_key(height).to_vec());
        match rewind.previous_tip {
            Some(hash) => batch.put(Column::CoinMeta, TIP_KEY.to_vec(), hash.to_byte_array().to_vec()),
            None => batch.delete(Column::CoinMeta, TIP_KEY.to_vec()),
        }

        self.db.write(batch)?;

        tracing::debug!(
            height,
            restored = rewind.spent.len(),
            removed = rewind.created.len(),
            "Rewound coin view"
        );

        Ok(rewind)
    }
}

impl<S: KeyValueStore + ?Sized> CoinView for PersistentCoinView<S> {
    fn fetch_coins(&self, outpoints: &[OutPoint]) -> Result<Vec<Option<UnspentOutput>>> {
        let _guard = self.lock.read();
        outpoints
            .iter()
            .map(|outpoint| {
                Ok(self.read_coin(outpoint)?.map(|coin| UnspentOutput {
                    outpoint: *outpoint,
                    coin: Some(coin),
                }))
            })
            .collect()
    }

    fn tip_hash(&self) -> Result<Option<BlockHash>> {
        let _guard = self.lock.read();
        self.read_tip()
    }
}
