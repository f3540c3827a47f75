use bitcoin::BlockHash;
use sidecoin_primitives::Height;

/// Storage errors.
///
/// All of them are fatal to the caller, a well-behaved node never reads data it did not write.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[cfg(feature = "rocksdb")]
    #[error("RocksDB error: {0}")]
    Rocksdb(#[from] rocksdb::Error),

    #[error("Failed to decode stored value: {0}")]
    Codec(#[from] codec::Error),

    #[error("Failed to decode stored header: {0}")]
    Consensus(#[from] bitcoin::consensus::encode::Error),

    /// A header referenced by the chain data is missing.
    #[error("Header {0} not found in the chain store")]
    MissingHeader(BlockHash),

    #[error("Chain data at height {0} not found")]
    MissingChainData(Height),

    #[error("Column family {0} is missing")]
    MissingColumn(&'static str),

    #[error("Corrupted entry in {column}: {reason}")]
    Corrupted { column: &'static str, reason: String },
}
