//! Block headers, the chained header graph and the best-chain index.

use crate::Height;
use bitcoin::block::Header;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{Hash, sha256d};
use bitcoin::{BlockHash, Transaction, TxMerkleNode, Work};
use codec::{Decode, Encode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Number of blocks used to compute the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Contract state commitments carried by headers of contract-enabled chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct ContractStateRoots {
    /// Root of the contract state trie after applying the block.
    pub state_root: [u8; 32],
    /// Root over the receipts produced by the block.
    pub receipt_root: [u8; 32],
}

/// Block header of the sidechain.
///
/// Wraps the Bitcoin-shaped base header with the optional contract state commitment and
/// the optional federation block signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidechainHeader {
    /// Base header fields.
    pub header: Header,
    /// Contract state metadata, present only on contract-enabled chains.
    pub contract_state: Option<ContractStateRoots>,
    /// Encoded block signature on PoA chains.
    ///
    /// Not part of the block hash since the signature commits to the hash.
    pub signature: Option<Vec<u8>>,
}

impl SidechainHeader {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            contract_state: None,
            signature: None,
        }
    }

    /// Returns the hash identifying this block.
    pub fn block_hash(&self) -> BlockHash {
        match &self.contract_state {
            None => self.header.block_hash(),
            Some(roots) => {
                let mut data = serialize(&self.header);
                data.extend_from_slice(&roots.state_root);
                data.extend_from_slice(&roots.receipt_root);
                BlockHash::from_raw_hash(sha256d::Hash::hash(&data))
            }
        }
    }

    pub fn time(&self) -> u32 {
        self.header.time
    }
}

/// A full sidechain block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidechainBlock {
    pub header: SidechainHeader,
    pub txdata: Vec<Transaction>,
}

impl SidechainBlock {
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }

    /// Computes the merkle root over the transactions in this block.
    pub fn compute_merkle_root(&self) -> Option<TxMerkleNode> {
        let hashes = self.txdata.iter().map(|tx| tx.compute_txid().to_raw_hash());
        bitcoin::merkle_tree::calculate_root(hashes).map(|h| h.into())
    }

    /// Returns the coinbase transaction, if the block has any transaction.
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.txdata.first()
    }

    /// Whether the second transaction of the block is a coinstake.
    pub fn is_proof_of_stake(&self) -> bool {
        self.txdata.get(1).is_some_and(is_coinstake)
    }
}

/// Whether `tx` is a coinstake: it spends real inputs and its first output is empty.
pub fn is_coinstake(tx: &Transaction) -> bool {
    !tx.is_coinbase()
        && !tx.input.is_empty()
        && tx.output.len() >= 2
        && tx.output[0].value.to_sat() == 0
        && tx.output[0].script_pubkey.is_empty()
}

/// A header linked to its ancestry.
///
/// Every header but genesis has exactly one previous header. Headers are shared via [`Arc`],
/// a header stays alive for as long as any descendant or index references it.
#[derive(Debug)]
pub struct ChainedHeader {
    header: SidechainHeader,
    hash: BlockHash,
    height: Height,
    chain_work: Work,
    prev: Option<Arc<ChainedHeader>>,
}

impl ChainedHeader {
    /// Creates the root of a header chain.
    pub fn genesis(header: SidechainHeader) -> Arc<Self> {
        Arc::new(Self {
            hash: header.block_hash(),
            chain_work: header.header.work(),
            header,
            height: 0,
            prev: None,
        })
    }

    /// Creates a header on top of `prev`.
    pub fn new(header: SidechainHeader, prev: Arc<ChainedHeader>) -> Arc<Self> {
        Arc::new(Self {
            hash: header.block_hash(),
            chain_work: prev.chain_work + header.header.work(),
            height: prev.height + 1,
            header,
            prev: Some(prev),
        })
    }

    pub fn header(&self) -> &SidechainHeader {
        &self.header
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn chain_work(&self) -> Work {
        self.chain_work
    }

    pub fn prev(&self) -> Option<&Arc<ChainedHeader>> {
        self.prev.as_ref()
    }

    /// Returns the ancestor at `height`, which may be the header itself.
    pub fn get_ancestor(self: &Arc<Self>, height: Height) -> Option<Arc<ChainedHeader>> {
        if height > self.height {
            return None;
        }

        let mut current = self.clone();
        while current.height > height {
            current = current.prev.clone()?;
        }

        Some(current)
    }

    /// Returns the last common ancestor of `self` and `other`.
    pub fn find_fork(self: &Arc<Self>, other: &Arc<ChainedHeader>) -> Option<Arc<ChainedHeader>> {
        let common_height = self.height.min(other.height);
        let mut left = self.get_ancestor(common_height)?;
        let mut right = other.get_ancestor(common_height)?;

        while left.hash != right.hash {
            left = left.prev.clone()?;
            right = right.prev.clone()?;
        }

        Some(left)
    }

    /// Whether `ancestor` is on the path from this header back to genesis.
    pub fn descends_from(self: &Arc<Self>, ancestor: &ChainedHeader) -> bool {
        self.get_ancestor(ancestor.height)
            .is_some_and(|header| header.hash == ancestor.hash)
    }

    /// Median of the timestamps of the last [`MEDIAN_TIME_SPAN`] headers, this one included.
    pub fn median_time_past(&self) -> u32 {
        let mut timestamps = Vec::with_capacity(MEDIAN_TIME_SPAN);
        timestamps.push(self.header.time());

        let mut current = self.prev.as_ref();
        while let Some(header) = current {
            if timestamps.len() == MEDIAN_TIME_SPAN {
                break;
            }
            timestamps.push(header.header.time());
            current = header.prev.as_ref();
        }

        timestamps.sort_unstable();

        timestamps[timestamps.len() / 2]
    }
}

// Unlink the ancestry iteratively, dropping a long chain recursively overflows the stack.
impl Drop for ChainedHeader {
    fn drop(&mut self) {
        let mut prev = self.prev.take();
        while let Some(header) = prev {
            match Arc::try_unwrap(header) {
                Ok(mut header) => prev = header.prev.take(),
                Err(_) => break,
            }
        }
    }
}

struct IndexerInner {
    /// Best chain, indexed by height.
    active: Vec<Arc<ChainedHeader>>,
    /// Every known header, including the ones disconnected by reorgs.
    known: HashMap<BlockHash, Arc<ChainedHeader>>,
}

/// Height-indexed view of the current best chain.
///
/// Headers removed from the best chain by a reorg stay reachable by hash until pruned.
pub struct ChainIndexer {
    inner: RwLock<IndexerInner>,
}

impl ChainIndexer {
    /// Constructs a new instance of [`ChainIndexer`] rooted at `genesis`.
    pub fn new(genesis: Arc<ChainedHeader>) -> Self {
        let mut known = HashMap::new();
        known.insert(genesis.hash(), genesis.clone());
        Self {
            inner: RwLock::new(IndexerInner {
                active: vec![genesis],
                known,
            }),
        }
    }

    pub fn genesis(&self) -> Arc<ChainedHeader> {
        self.inner.read().active[0].clone()
    }

    pub fn tip(&self) -> Arc<ChainedHeader> {
        self.inner
            .read()
            .active
            .last()
            .cloned()
            .expect("Active chain always contains genesis; qed")
    }

    pub fn height(&self) -> Height {
        self.tip().height()
    }

    /// Returns the header at `height` on the best chain.
    pub fn get_by_height(&self, height: Height) -> Option<Arc<ChainedHeader>> {
        self.inner.read().active.get(height as usize).cloned()
    }

    /// Returns a known header, whether or not it is on the best chain.
    pub fn get_by_hash(&self, hash: &BlockHash) -> Option<Arc<ChainedHeader>> {
        self.inner.read().known.get(hash).cloned()
    }

    /// Whether the block identified by `hash` is on the best chain.
    pub fn contains(&self, hash: &BlockHash) -> bool {
        let inner = self.inner.read();
        inner.known.get(hash).is_some_and(|header| {
            inner
                .active
                .get(header.height() as usize)
                .is_some_and(|active| active.hash() == *hash)
        })
    }

    /// Registers a header without changing the best chain.
    pub fn insert(&self, header: Arc<ChainedHeader>) {
        self.inner.write().known.insert(header.hash(), header);
    }

    /// Returns the fork point between the best chain and `header`.
    pub fn find_fork(&self, header: &Arc<ChainedHeader>) -> Option<Arc<ChainedHeader>> {
        self.tip().find_fork(header)
    }

    /// Makes `new_tip` the tip of the best chain.
    ///
    /// Returns the fork point, headers above it are disconnected from the best chain but stay
    /// known by hash.
    pub fn set_tip(&self, new_tip: Arc<ChainedHeader>) -> Option<Arc<ChainedHeader>> {
        let mut inner = self.inner.write();

        let current_tip = inner.active.last().cloned()?;
        let fork = current_tip.find_fork(&new_tip)?;

        inner.active.truncate(fork.height() as usize + 1);

        let mut branch = Vec::with_capacity((new_tip.height() - fork.height()) as usize);
        let mut current = new_tip;
        while current.height() > fork.height() {
            let prev = current
                .prev()
                .cloned()
                .expect("Non-genesis header has a previous header; qed");
            branch.push(current);
            current = prev;
        }

        for header in branch.into_iter().rev() {
            inner.known.insert(header.hash(), header.clone());
            inner.active.push(header);
        }

        tracing::debug!(
            fork = %fork.hash(),
            fork_height = fork.height(),
            tip_height = inner.active.len() - 1,
            "Best chain updated"
        );

        Some(fork)
    }

    /// Forgets headers that are not on the best chain and lie below `height`.
    pub fn prune_forks_below(&self, height: Height) -> usize {
        let mut inner = self.inner.write();
        let IndexerInner { active, known } = &mut *inner;

        let before = known.len();
        known.retain(|hash, header| {
            header.height() >= height
                || active
                    .get(header.height() as usize)
                    .is_some_and(|active| active.hash() == *hash)
        });

        before - known.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitcoin::block::Version;
    use bitcoin::{CompactTarget, TxMerkleNode};

    pub(crate) fn make_header(prev: BlockHash, time: u32, nonce: u32) -> SidechainHeader {
        SidechainHeader::new(Header {
            version: Version::from_consensus(4),
            prev_blockhash: prev,
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(0x207fffff),
            nonce,
        })
    }

    pub(crate) fn build_chain(len: u32, nonce: u32) -> Vec<Arc<ChainedHeader>> {
        let genesis = ChainedHeader::genesis(make_header(BlockHash::all_zeros(), 1_000, 0));
        extend_chain(genesis, len, nonce)
    }

    pub(crate) fn extend_chain(
        from: Arc<ChainedHeader>,
        len: u32,
        nonce: u32,
    ) -> Vec<Arc<ChainedHeader>> {
        let mut chain = vec![from];
        for i in 0..len {
            let prev = chain.last().unwrap().clone();
            let header = make_header(prev.hash(), prev.header().time() + 16, nonce + i);
            chain.push(ChainedHeader::new(header, prev));
        }
        chain
    }

    #[test]
    fn ancestor_lookup() {
        let chain = build_chain(20, 0);
        let tip = chain.last().unwrap();
        assert_eq!(tip.height(), 20);
        assert_eq!(tip.get_ancestor(7).unwrap().hash(), chain[7].hash());
        assert!(tip.get_ancestor(21).is_none());
        assert!(tip.descends_from(&chain[3]));
    }

    #[test]
    fn median_time_past_uses_last_eleven_headers() {
        let chain = build_chain(20, 0);
        // Times are 1000 + 16 * height, the median of heights 10..=20 is height 15.
        assert_eq!(chain[20].median_time_past(), 1_000 + 16 * 15);
        // Fewer than 11 ancestors.
        assert_eq!(chain[2].median_time_past(), 1_000 + 16);
    }

    #[test]
    fn contract_roots_change_block_hash() {
        let mut header = make_header(BlockHash::all_zeros(), 1, 1);
        let plain = header.block_hash();
        header.contract_state = Some(ContractStateRoots {
            state_root: [1u8; 32],
            receipt_root: [2u8; 32],
        });
        assert_ne!(plain, header.block_hash());
        header.signature = Some(vec![1, 2, 3]);
        let signed = header.block_hash();
        header.signature = None;
        assert_eq!(signed, header.block_hash());
    }

    #[test]
    fn reorg_keeps_disconnected_headers_known() {
        let chain = build_chain(10, 0);
        let indexer = ChainIndexer::new(chain[0].clone());
        let fork = indexer.set_tip(chain[10].clone()).unwrap();
        assert_eq!(fork.height(), 0);
        assert_eq!(indexer.height(), 10);

        let branch = extend_chain(chain[5].clone(), 7, 1_000);
        let new_tip = branch.last().unwrap().clone();
        let fork = indexer.set_tip(new_tip.clone()).unwrap();

        assert_eq!(fork.hash(), chain[5].hash());
        assert_eq!(indexer.tip().hash(), new_tip.hash());
        assert_eq!(indexer.height(), 12);
        assert!(!indexer.contains(&chain[8].hash()));
        assert!(indexer.get_by_hash(&chain[8].hash()).is_some());
        assert_eq!(indexer.get_by_height(6).unwrap().hash(), branch[1].hash());

        assert_eq!(indexer.prune_forks_below(9), 3);
        assert!(indexer.get_by_hash(&chain[8].hash()).is_none());
        assert!(indexer.get_by_hash(&chain[10].hash()).is_some());
    }
}
