use crate::{Column, Error, KeyValueStore, Result, WriteBatch};
use bitcoin::block::Header;
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Transaction};
use codec::{Decode, Encode};
use parking_lot::Mutex;
use sidecoin_primitives::{
    ChainIndexer, ChainedHeader, ContractStateRoots, Height, SidechainBlock, SidechainHeader,
};
use std::sync::Arc;

const BASE_HEADER_SIZE: usize = 80;

/// Entry of the best chain at a given height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct ChainData {
    pub block_hash: [u8; 32],
    /// Cumulative chain work, little endian.
    pub chain_work: [u8; 32],
}

impl ChainData {
    pub fn from_header(header: &ChainedHeader) -> Self {
        Self {
            block_hash: header.hash().to_byte_array(),
            chain_work: header.chain_work().to_le_bytes(),
        }
    }

    pub fn block_hash(&self) -> BlockHash {
        BlockHash::from_byte_array(self.block_hash)
    }
}

#[derive(Encode, Decode)]
struct HeaderExtension {
    contract_state: Option<ContractStateRoots>,
    signature: Option<Vec<u8>>,
}

fn encode_header(header: &SidechainHeader) -> Vec<u8> {
    let mut bytes = serialize(&header.header);
    HeaderExtension {
        contract_state: header.contract_state,
        signature: header.signature.clone(),
    }
    .encode_to(&mut bytes);
    bytes
}

fn decode_header(bytes: &[u8]) -> Result<SidechainHeader> {
    if bytes.len() < BASE_HEADER_SIZE {
        return Err(Error::Corrupted {
            column: Column::Headers.name(),
            reason: format!("header of {} bytes", bytes.len()),
        });
    }
    let header: Header = deserialize(&bytes[..BASE_HEADER_SIZE])?;
    let extension = HeaderExtension::decode(&mut &bytes[BASE_HEADER_SIZE..])?;
    Ok(SidechainHeader {
        header,
        contract_state: extension.contract_state,
        signature: extension.signature,
    })
}

fn height_key(height: Height) -> [u8; 4] {
    height.to_be_bytes()
}

/// Persisted headers and best chain.
///
/// Writes are serialized by a dedicated lock, readers never wait for it.
pub struct ChainStore<S: ?Sized> {
    db: Arc<S>,
    write_lock: Mutex<()>,
}

impl<S: KeyValueStore + ?Sized> ChainStore<S> {
    pub fn new(db: Arc<S>) -> Self {
        Self {
            db,
            write_lock: Mutex::new(()),
        }
    }

    pub fn put_header(&self, header: &SidechainHeader) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(
            Column::Headers,
            header.block_hash().to_byte_array().to_vec(),
            encode_header(header),
        );
        let _guard = self.write_lock.lock();
        self.db.write(batch)
    }

    pub fn get_header(&self, hash: &BlockHash) -> Result<Option<SidechainHeader>> {
        self.db
            .get(Column::Headers, hash.as_byte_array())?
            .map(|bytes| decode_header(&bytes))
            .transpose()
    }

    /// Returns a header that must exist.
    pub fn header(&self, hash: &BlockHash) -> Result<SidechainHeader> {
        self.get_header(hash)?
            .ok_or(Error::MissingHeader(*hash))
    }

    /// Persists a full block, header included.
    pub fn put_block(&self, block: &SidechainBlock) -> Result<()> {
        let hash = block.block_hash().to_byte_array().to_vec();
        let mut batch = WriteBatch::new();
        batch.put(Column::Headers, hash.clone(), encode_header(&block.header));
        batch.put(Column::Blocks, hash, serialize(&block.txdata));
        let _guard = self.write_lock.lock();
        self.db.write(batch)
    }

    pub fn get_block(&self, hash: &BlockHash) -> Result<Option<SidechainBlock>> {
        let Some(body) = self.db.get(Column::Blocks, hash.as_byte_array())? else {
            return Ok(None);
        };
        let txdata: Vec<Transaction> = deserialize(&body)?;
        Ok(Some(SidechainBlock {
            header: self.header(hash)?,
            txdata,
        }))
    }

    pub fn get_chain_data(&self, height: Height) -> Result<Option<ChainData>> {
        self.db
            .get(Column::ChainData, &height_key(height))?
            .map(|bytes| ChainData::decode(&mut bytes.as_slice()).map_err(Error::from))
            .transpose()
    }

    /// Persists a header that became the tip of the best chain.
    pub fn put_tip(&self, tip: &ChainedHeader) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(
            Column::Headers,
            tip.hash().to_byte_array().to_vec(),
            encode_header(tip.header()),
        );
        batch.put(
            Column::ChainData,
            height_key(tip.height()).to_vec(),
            ChainData::from_header(tip).encode(),
        );

        let _guard = self.write_lock.lock();
        self.db.write(batch)?;

        tracing::trace!(height = tip.height(), hash = %tip.hash(), "Persisted chain tip");

        Ok(())
    }

    /// Removes the best chain entries above `height`, headers are retained.
    pub fn truncate_above(&self, height: Height) -> Result<()> {
        let _guard = self.write_lock.lock();

        let mut batch = WriteBatch::new();
        let mut next = height + 1;
        while self.db.contains(Column::ChainData, &height_key(next))? {
            batch.delete(Column::ChainData, height_key(next).to_vec());
            next += 1;
        }

        if !batch.is_empty() {
            tracing::debug!(height, removed = batch.len(), "Truncated persisted best chain");
            self.db.write(batch)?;
        }

        Ok(())
    }

    /// Rebuilds the best chain index from the persisted chain data.
    pub fn load_chain(&self, genesis: SidechainHeader) -> Result<ChainIndexer> {
        let genesis = ChainedHeader::genesis(genesis);
        let indexer = ChainIndexer::new(genesis.clone());

        let mut tip = genesis;
        let mut height = 1;
        while let Some(data) = self.get_chain_data(height)? {
            let header = self.header(&data.block_hash())?;

            if header.header.prev_blockhash != tip.hash() {
                return Err(Error::Corrupted {
                    column: Column::ChainData.name(),
                    reason: format!("block at height {height} does not extend {}", tip.hash()),
                });
            }

            let chained = ChainedHeader::new(header, tip);
            if chained.chain_work().to_le_bytes() != data.chain_work {
                return Err(Error::Corrupted {
                    column: Column::ChainData.name(),
                    reason: format!("chain work mismatch at height {height}"),
                });
            }

            tip = chained;
            height += 1;
        }

        indexer.set_tip(tip.clone());

        tracing::info!(height = tip.height(), hash = %tip.hash(), "Loaded best chain");

        Ok(indexer)
    }
}

/// Lookup of stored blocks by hash, whether or not they are on the best chain.
pub trait BlockSource: Send + Sync {
    fn block(&self, hash: &BlockHash) -> Result<Option<SidechainBlock>>;
}

impl<S: KeyValueStore + ?Sized> BlockSource for ChainStore<S> {
    fn block(&self, hash: &BlockHash) -> Result<Option<SidechainBlock>> {
        self.get_block(hash)
    }
}
