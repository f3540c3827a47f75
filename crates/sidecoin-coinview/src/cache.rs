use crate::{Coin, CoinLookup, CoinView, Error, OrderedOutPoint, Result, RewindData, UnspentOutput};
use bitcoin::{BlockHash, OutPoint, Transaction, Txid};
use sidecoin_primitives::Height;
use sidecoin_script::opcodes::is_smart_contract_exec;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct CacheEntry {
    coin: Option<Coin>,
    dirty: bool,
}

/// Changes of one block, ready to be committed to the persistent view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinChanges {
    pub block_hash: BlockHash,
    pub height: Height,
    /// New state of every touched outpoint, `None` for a spent one.
    pub coins: Vec<(OutPoint, Option<Coin>)>,
    pub rewind: RewindData,
}

/// Block scoped overlay on top of a [`CoinView`].
///
/// Nothing reaches the underlying view until the changes are committed, dropping the cache
/// abandons the block.
pub struct CoinViewCache<'a, V: CoinView + ?Sized> {
    base: &'a V,
    entries: HashMap<OutPoint, CacheEntry>,
    rewind: RewindData,
}

impl<'a, V: CoinView + ?Sized> CoinViewCache<'a, V> {
    pub fn new(base: &'a V) -> Result<Self> {
        Ok(Self {
            base,
            entries: HashMap::new(),
            rewind: RewindData::new(base.tip_hash()?),
        })
    }

    /// Loads the given outpoints with a single lookup into the base view.
    pub fn prefetch(&mut self, outpoints: &[OutPoint]) -> Result<()> {
        let missing = outpoints
            .iter()
            .filter(|outpoint| !self.entries.contains_key(outpoint))
            .copied()
            .collect::<Vec<_>>();

        if missing.is_empty() {
            return Ok(());
        }

        let fetched = self.base.fetch_coins(&missing)?;
        for (outpoint, unspent) in missing.into_iter().zip(fetched) {
            self.entries.insert(
                outpoint,
                CacheEntry {
                    coin: unspent.and_then(|unspent| unspent.coin),
                    dirty: false,
                },
            );
        }

        Ok(())
    }

    /// Returns the coin if it is unspent.
    pub fn access_coin(&mut self, outpoint: &OutPoint) -> Result<Option<&Coin>> {
        self.prefetch(std::slice::from_ref(outpoint))?;
        Ok(self
            .entries
            .get(outpoint)
            .and_then(|entry| entry.coin.as_ref()))
    }

    /// Whether every input of the transaction spends an unspent coin.
    pub fn have_inputs(&mut self, tx: &Transaction) -> Result<bool> {
        let outpoints = tx
            .input
            .iter()
            .map(|input| input.previous_output)
            .collect::<Vec<_>>();
        self.prefetch(&outpoints)?;
        Ok(outpoints.iter().all(|outpoint| {
            self.entries
                .get(outpoint)
                .is_some_and(|entry| entry.coin.is_some())
        }))
    }

    /// Sum of the values spent by the transaction inputs.
    pub fn value_in(&mut self, tx: &Transaction) -> Result<u64> {
        let mut total = 0u64;
        for input in &tx.input {
            let coin = self
                .access_coin(&input.previous_output)?
                .ok_or(Error::UtxoNotFound(input.previous_output))?;
            total = total.saturating_add(coin.amount);
        }
        Ok(total)
    }

    /// Spends a coin, recording it for rewind.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Coin> {
        self.prefetch(std::slice::from_ref(outpoint))?;

        let entry = self
            .entries
            .get_mut(outpoint)
            .ok_or(Error::UtxoNotFound(*outpoint))?;
        let coin = entry.coin.take().ok_or(Error::UtxoNotFound(*outpoint))?;
        entry.dirty = true;

        self.rewind.record_spend(*outpoint, coin.clone());

        Ok(coin)
    }

    /// Spends all inputs of a non-coinbase transaction.
    pub fn spend_inputs(&mut self, tx: &Transaction) -> Result<Vec<Coin>> {
        tx.input
            .iter()
            .map(|input| self.spend_coin(&input.previous_output))
            .collect()
    }

    /// Adds the spendable outputs of a transaction.
    ///
    /// Contract create and call outputs credit contract balances instead of creating coins.
    pub fn add_outputs(&mut self, tx: &Transaction, txid: Txid, height: Height, is_coinstake: bool) {
        let is_coinbase = tx.is_coinbase();
        for (vout, output) in tx.output.iter().enumerate() {
            if output.script_pubkey.is_op_return() || is_smart_contract_exec(&output.script_pubkey) {
                continue;
            }

            let outpoint = OutPoint {
                txid,
                vout: vout as u32,
            };
            self.entries.insert(
                outpoint,
                CacheEntry {
                    coin: Some(Coin::from_txout(output, height, is_coinbase, is_coinstake)),
                    dirty: true,
                },
            );
            self.rewind.record_create(outpoint);
        }
    }

    /// Collects the changes, ordered by outpoint.
    pub fn into_changes(self, block_hash: BlockHash, height: Height) -> CoinChanges {
        let mut coins = self
            .entries
            .into_iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(outpoint, entry)| (outpoint, entry.coin))
            .collect::<Vec<_>>();
        coins.sort_by_key(|(outpoint, _)| OrderedOutPoint(*outpoint));

        CoinChanges {
            block_hash,
            height,
            coins,
            rewind: self.rewind,
        }
    }
}

impl<V: CoinView + ?Sized> CoinLookup for CoinViewCache<'_, V> {
    fn lookup(&mut self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>> {
        self.prefetch(std::slice::from_ref(outpoint))?;
        Ok(self.entries.get(outpoint).and_then(|entry| {
            // A clean entry without coin was never seen, a dirty one was spent in this block.
            (entry.coin.is_some() || entry.dirty).then(|| UnspentOutput {
                outpoint: *outpoint,
                coin: entry.coin.clone(),
            })
        }))
    }
}
