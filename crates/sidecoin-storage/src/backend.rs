use crate::Result;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Logical table of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Column {
    /// Block hash (32 bytes) => header.
    Headers,
    /// Height (u32, big-endian) => [`crate::ChainData`].
    ChainData,
    /// Request id => [`crate::ConversionRequest`].
    ConversionRequests,
    /// Outpoint => coin.
    Coins,
    /// Height (u32, big-endian) => rewind data of the block.
    Rewind,
    /// Coin view metadata.
    CoinMeta,
    /// Node hash => trie node.
    TrieNodes,
    /// Block hash (32 bytes) => consensus encoded transactions of the block.
    Blocks,
}

impl Column {
    pub const ALL: [Column; 8] = [
        Column::Headers,
        Column::ChainData,
        Column::ConversionRequests,
        Column::Coins,
        Column::Rewind,
        Column::CoinMeta,
        Column::TrieNodes,
        Column::Blocks,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Headers => "headers",
            Self::ChainData => "chain_data",
            Self::ConversionRequests => "conversion_requests",
            Self::Coins => "coins",
            Self::Rewind => "rewind",
            Self::CoinMeta => "coin_meta",
            Self::TrieNodes => "trie_nodes",
            Self::Blocks => "blocks",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        column: Column,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        column: Column,
        key: Vec<u8>,
    },
}

/// Set of writes applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete {
            column,
            key: key.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Column-oriented key value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Applies all operations of the batch atomically, in order.
    fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Returns every entry of the column, ordered by key.
    fn entries(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    fn contains(&self, column: Column, key: &[u8]) -> Result<bool> {
        Ok(self.get(column, key)?.is_some())
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    columns: RwLock<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .columns
            .read()
            .get(&column)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut columns = self.columns.write();
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { column, key, value } => {
                    columns.entry(column).or_default().insert(key, value);
                }
                BatchOp::Delete { column, key } => {
                    if let Some(entries) = columns.get_mut(&column) {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn entries(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .columns
            .read()
            .get(&column)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(feature = "rocksdb")]
mod rocks {
    use super::{BatchOp, Column, KeyValueStore, WriteBatch};
    use crate::{Error, Result};
    use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options};
    use std::path::Path;

    /// RocksDB backed store, one column family per [`Column`].
    pub struct RocksStore {
        db: DB,
    }

    impl RocksStore {
        /// Open or create the store at the given path.
        pub fn open(path: &Path) -> Result<Self> {
            let mut db_opts = Options::default();
            db_opts.create_if_missing(true);
            db_opts.create_missing_column_families(true);

            let mut block_opts = rocksdb::BlockBasedOptions::default();
            block_opts.set_bloom_filter(10.0, false);
            db_opts.set_block_based_table_factory(&block_opts);

            let cf_descriptors = Column::ALL
                .iter()
                .map(|column| ColumnFamilyDescriptor::new(column.name(), Options::default()))
                .collect::<Vec<_>>();

            let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

            tracing::info!(path = %path.display(), "Opened sidecoin store");

            Ok(Self { db })
        }

        fn cf(&self, column: Column) -> Result<&ColumnFamily> {
            self.db
                .cf_handle(column.name())
                .ok_or(Error::MissingColumn(column.name()))
        }
    }

    impl KeyValueStore for RocksStore {
        fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(self.db.get_cf(self.cf(column)?, key)?)
        }

        fn write(&self, batch: WriteBatch) -> Result<()> {
            let mut rocks_batch = rocksdb::WriteBatch::default();
            for op in batch.into_ops() {
                match op {
                    BatchOp::Put { column, key, value } => {
                        rocks_batch.put_cf(self.cf(column)?, key, value)
                    }
                    BatchOp::Delete { column, key } => {
                        rocks_batch.delete_cf(self.cf(column)?, key)
                    }
                }
            }
            self.db.write(rocks_batch)?;
            Ok(())
        }

        fn entries(&self, column: Column) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            self.db
                .iterator_cf(self.cf(column)?, IteratorMode::Start)
                .map(|item| {
                    let (key, value) = item?;
                    Ok((key.to_vec(), value.to_vec()))
                })
                .collect()
        }
    }

}

#[cfg(feature = "rocksdb")]
pub use self::rocks::RocksStore;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_batch_is_ordered() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Headers, vec![2], vec![20]);
        batch.put(Column::Headers, vec![1], vec![10]);
        batch.delete(Column::Headers, vec![2]);
        batch.put(Column::Headers, vec![2], vec![21]);
        store.write(batch).unwrap();

        assert_eq!(
            store.entries(Column::Headers).unwrap(),
            vec![(vec![1], vec![10]), (vec![2], vec![21])]
        );
        assert!(store.contains(Column::Headers, &[1]).unwrap());
        assert!(!store.contains(Column::ChainData, &[1]).unwrap());
    }
}
