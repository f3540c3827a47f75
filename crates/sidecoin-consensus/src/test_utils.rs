//! Block and transaction builders shared by the unit tests.

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::transaction::Version as TxVersion;
use bitcoin::{
    Amount, BlockHash, CompactTarget, OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction,
    TxIn, TxMerkleNode, TxOut, Witness,
};
use sidecoin_primitives::{ChainedHeader, Height, SidechainBlock, SidechainHeader};
use std::sync::Arc;

pub const REGTEST_BITS: u32 = 0x207fffff;

pub fn p2pkh(seed: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([seed; 20]))
}

pub fn output(value: u64, script_pubkey: ScriptBuf) -> TxOut {
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey,
    }
}

pub fn coinbase(height: Height, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: TxVersion::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Builder::new().push_slice(height.to_le_bytes()).into_script(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

pub fn spend(prevouts: &[OutPoint], outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: TxVersion::TWO,
        lock_time: LockTime::ZERO,
        input: prevouts
            .iter()
            .map(|prevout| TxIn {
                previous_output: *prevout,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

pub fn block_on(
    prev: Option<&Arc<ChainedHeader>>,
    time: u32,
    txdata: Vec<Transaction>,
) -> (Arc<ChainedHeader>, Arc<SidechainBlock>) {
    let mut block = SidechainBlock {
        header: SidechainHeader::new(Header {
            version: Version::from_consensus(0x20000000),
            prev_blockhash: prev.map(|prev| prev.hash()).unwrap_or(BlockHash::all_zeros()),
            merkle_root: TxMerkleNode::all_zeros(),
            time,
            bits: CompactTarget::from_consensus(REGTEST_BITS),
            nonce: 0,
        }),
        txdata,
    };
    if let Some(root) = block.compute_merkle_root() {
        block.header.header.merkle_root = root;
    }
    let header = match prev {
        Some(prev) => ChainedHeader::new(block.header.clone(), prev.clone()),
        None => ChainedHeader::genesis(block.header.clone()),
    };
    (header, Arc::new(block))
}

/// Chain of empty blocks, `spacing` seconds apart.
pub fn chain(len: Height, start_time: u32, spacing: u32) -> Vec<Arc<ChainedHeader>> {
    let mut chain = vec![block_on(None, start_time, vec![coinbase(0, vec![output(0, p2pkh(0))])]).0];
    for height in 1..=len {
        let (header, _) = block_on(
            chain.last(),
            start_time + height * spacing,
            vec![coinbase(height, vec![output(0, p2pkh(0))])],
        );
        chain.push(header);
    }
    chain
}

/// Coin view holding the outputs of `txs`, created at `height`.
pub fn funded_view(
    txs: &[Transaction],
    height: Height,
) -> Arc<sidecoin_coinview::PersistentCoinView<sidecoin_storage::MemoryStore>> {
    let view = Arc::new(sidecoin_coinview::PersistentCoinView::new(Arc::new(
        sidecoin_storage::MemoryStore::new(),
    )));
    let mut cache = sidecoin_coinview::CoinViewCache::new(&*view).unwrap();
    for tx in txs {
        cache.add_outputs(tx, tx.compute_txid(), height, false);
    }
    view.commit(cache.into_changes(BlockHash::from_byte_array([height as u8; 32]), height))
        .unwrap();
    view
}
