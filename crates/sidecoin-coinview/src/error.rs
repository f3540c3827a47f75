use bitcoin::{BlockHash, OutPoint};
use sidecoin_primitives::Height;

/// Coin view errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] sidecoin_storage::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Corrupted coin for {outpoint}: {source}")]
    CorruptedCoin {
        outpoint: OutPoint,
        source: codec::Error,
    },

    /// Spending an output the view does not know.
    #[error("UTXO not found: {0}")]
    UtxoNotFound(OutPoint),

    #[error("Rewind data not found for height {0}")]
    RewindNotFound(Height),

    #[error("Coin view is at {actual:?}, expected {expected:?}")]
    TipMismatch {
        expected: Option<BlockHash>,
        actual: Option<BlockHash>,
    },
}
