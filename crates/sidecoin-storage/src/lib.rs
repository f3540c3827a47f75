//! Persistent storage of the sidechain node.
//!
//! All data lives in a single [`KeyValueStore`] partitioned into [`Column`]s. The in-memory
//! backend is always available, the RocksDB backend requires the `rocksdb` feature.

mod backend;
mod chain_store;
mod conversion;
mod error;

pub use self::backend::{BatchOp, Column, KeyValueStore, MemoryStore, WriteBatch};
#[cfg(feature = "rocksdb")]
pub use self::backend::RocksStore;
pub use self::chain_store::{BlockSource, ChainData, ChainStore};
pub use self::conversion::{
    ConversionRequest, ConversionRequestRepository, ConversionRequestStatus,
    ConversionRequestType,
};
pub use self::error::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;
