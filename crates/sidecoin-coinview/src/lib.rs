//! UTXO coin view.
//!
//! [`PersistentCoinView`] is the authoritative unspent output set. Blocks are connected through
//! a [`CoinViewCache`] whose changes are committed in one batch together with the
//! [`RewindData`] needed to disconnect the block again.

mod cache;
mod coin;
mod error;
mod outpoint;
mod persistent;
mod rewind;

pub use self::cache::{CoinChanges, CoinViewCache};
pub use self::coin::{Coin, UnspentOutput};
pub use self::error::Error;
pub use self::outpoint::{OrderedOutPoint, compare_outpoints};
pub use self::persistent::PersistentCoinView;
pub use self::rewind::RewindData;

use bitcoin::{BlockHash, OutPoint};

/// Result type for coin view operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Read access to an unspent output set.
pub trait CoinView: Send + Sync {
    /// Looks up `outpoints`, returning one entry per outpoint in the same order.
    ///
    /// `None` marks an outpoint unknown to the view, an entry without coin one the view knows
    /// to be spent. Neither is an error.
    fn fetch_coins(&self, outpoints: &[OutPoint]) -> Result<Vec<Option<UnspentOutput>>>;

    /// Block the view is synced to.
    fn tip_hash(&self) -> Result<Option<BlockHash>>;

    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>> {
        Ok(self
            .fetch_coins(std::slice::from_ref(outpoint))?
            .pop()
            .flatten()
            .and_then(|unspent| unspent.coin))
    }
}

impl<T: CoinView + ?Sized> CoinView for std::sync::Arc<T> {
    fn fetch_coins(&self, outpoints: &[OutPoint]) -> Result<Vec<Option<UnspentOutput>>> {
        (**self).fetch_coins(outpoints)
    }

    fn tip_hash(&self) -> Result<Option<BlockHash>> {
        (**self).tip_hash()
    }
}

/// Point lookups of single outputs.
pub trait CoinLookup {
    /// `None` if the output is unknown, an entry without coin if it is known to be spent.
    fn lookup(&mut self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>>;
}

impl<V: CoinView + ?Sized> CoinLookup for &V {
    fn lookup(&mut self, outpoint: &OutPoint) -> Result<Option<UnspentOutput>> {
        Ok(self
            .fetch_coins(std::slice::from_ref(outpoint))?
            .pop()
            .flatten())
    }
}
