use crate::options::MempoolOptions;
use crate::rules::{
    ContractTransactionRule, MempoolRule, MempoolValidationContext, OpSpendRule,
    RewardTransactionRule, StandardOutputsRule, TransactionSanityRule, VotingRequestRule,
    check_rules,
};
use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use parking_lot::RwLock;
use sidecoin_coinview::CoinView;
use sidecoin_consensus::rules::contract_tx_data;
use sidecoin_consensus::{ConsensusError, ConsensusErrors};
use sidecoin_primitives::{
    ChainEvent, ChainedHeader, ConsensusParams, EventBus, Height, SubscriptionId, is_coinstake,
    shuffle,
};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    /// The transaction breaks an admission rule.
    #[error("Transaction rejected: {0}")]
    Rejected(#[from] ConsensusError),
    #[error(transparent)]
    CoinView(#[from] sidecoin_coinview::Error),
}

impl MempoolError {
    pub fn consensus_error(&self) -> Option<ConsensusError> {
        match self {
            Self::Rejected(err) => Some(*err),
            Self::CoinView(_) => None,
        }
    }
}

/// Transaction held by the pool.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Arc<Transaction>,
    pub fee: u64,
    /// Tip height when the transaction was accepted.
    pub height: Height,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<Txid, MempoolEntry>,
    /// Outpoint spent by a pool transaction, and that transaction.
    spent_by: HashMap<OutPoint, Txid>,
}

impl PoolInner {
    fn insert(&mut self, txid: Txid, entry: MempoolEntry) {
        for input in &entry.tx.input {
            self.spent_by.insert(input.previous_output, txid);
        }
        self.entries.insert(txid, entry);
    }

    fn remove(&mut self, txid: &Txid) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.input {
            self.spent_by.remove(&input.previous_output);
        }
        Some(entry)
    }

    /// Removes `txid` and every pool transaction spending its outputs.
    fn remove_with_descendants(&mut self, txid: Txid) -> usize {
        let mut removed = 0;
        let mut pending = vec![txid];
        while let Some(txid) = pending.pop() {
            let Some(entry) = self.remove(&txid) else {
                continue;
            };
            removed += 1;
            pending.extend((0..entry.tx.output.len() as u32).filter_map(|vout| {
                self.spent_by.get(&OutPoint::new(txid, vout)).copied()
            }));
        }
        removed
    }

    fn mempool_output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.entries
            .get(&outpoint.txid)
            .and_then(|entry| entry.tx.output.get(outpoint.vout as usize))
    }
}

#[derive(Debug, Clone, Copy)]
struct TipInfo {
    height: Height,
    time: u32,
}

/// Pool of validated transactions waiting to be mined.
///
/// Admission runs the context free rules first, then takes the write lock and validates the
/// inputs against the coin view and the pending transactions, so a coin spent by a block
/// connected in the meantime is never admitted.
pub struct Mempool {
    params: Arc<ConsensusParams>,
    options: MempoolOptions,
    coins: Arc<dyn CoinView>,
    rules: Vec<Box<dyn MempoolRule>>,
    inner: RwLock<PoolInner>,
    tip: RwLock<TipInfo>,
    events: Arc<EventBus>,
}

impl Mempool {
    pub fn new(
        params: Arc<ConsensusParams>,
        options: MempoolOptions,
        coins: Arc<dyn CoinView>,
        events: Arc<EventBus>,
        tip: &ChainedHeader,
    ) -> Self {
        let mut rules: Vec<Box<dyn MempoolRule>> = vec![
            Box::new(RewardTransactionRule),
            Box::new(TransactionSanityRule),
            Box::new(OpSpendRule),
            Box::new(VotingRequestRule),
        ];
        if params.contracts.is_some() {
            rules.push(Box::new(ContractTransactionRule::new(params.clone())));
        }
        if options.require_standard {
            rules.push(Box::new(StandardOutputsRule::new(options.max_op_return_relay)));
        }

        Self {
            params,
            options,
            coins,
            rules,
            inner: RwLock::new(PoolInner::default()),
            tip: RwLock::new(TipInfo {
                height: tip.height(),
                time: tip.header().time(),
            }),
            events,
        }
    }

    /// Appends an admission rule, run after the built-in ones.
    pub fn register_rule(&mut self, rule: impl MempoolRule + 'static) {
        self.rules.push(Box::new(rule));
    }

    pub fn options(&self) -> &MempoolOptions {
        &self.options
    }

    /// Validates `tx` and adds it to the pool.
    ///
    /// Rejections are published as [`ChainEvent::TransactionRejected`].
    pub fn accept(&self, tx: Transaction) -> Result<Txid, MempoolError> {
        let txid = tx.compute_txid();
        let result = self.accept_inner(tx, txid);

        if let Err(MempoolError::Rejected(err)) = &result {
            tracing::debug!(%txid, %err, "Transaction rejected");
            self.events.publish(&ChainEvent::TransactionRejected {
                txid,
                reason: err.code.to_string(),
            });
        }

        result
    }

    fn accept_inner(&self, tx: Transaction, txid: Txid) -> Result<Txid, MempoolError> {
        let tip = *self.tip.read();
        let ctx = MempoolValidationContext {
            tx: &tx,
            txid,
            height: tip.height + 1,
            block_time: tip.time,
        };
        check_rules(&self.rules, &ctx)?;

        let mut inner = self.inner.write();

        if inner.entries.contains_key(&txid) {
            return Err(ConsensusErrors::TX_ALREADY_IN_MEMPOOL.into());
        }
        if inner.entries.len() >= self.options.max_transactions {
            return Err(ConsensusErrors::MEMPOOL_FULL.into());
        }
        if let Some(conflict) = tx
            .input
            .iter()
            .find_map(|input| inner.spent_by.get(&input.previous_output))
        {
            tracing::trace!(%txid, %conflict, "Input already spent in the pool");
            return Err(ConsensusErrors::TX_MEMPOOL_CONFLICT.into());
        }

        let fee = self.check_inputs(&inner, &tx, tip.height + 1)?;

        tracing::debug!(%txid, fee, pool_size = inner.entries.len() + 1, "Transaction accepted");

        inner.insert(
            txid,
            MempoolEntry {
                tx: Arc::new(tx),
                fee,
                height: tip.height,
            },
        );

        Ok(txid)
    }

    /// Returns the fee paid by `tx`.
    fn check_inputs(&self, inner: &PoolInner, tx: &Transaction, height: Height) -> Result<u64, MempoolError> {
        let mut value_in = 0u64;
        for input in &tx.input {
            let prevout = input.previous_output;
            let value = match inner.mempool_output(&prevout) {
                Some(output) => output.value.to_sat(),
                None => {
                    let coin = self
                        .coins
                        .get_coin(&prevout)?
                        .ok_or(ConsensusErrors::BAD_TX_MISSING_INPUTS)?;
                    if coin.is_reward() && coin.confirmations(height) < self.params.coinbase_maturity {
                        return Err(ConsensusErrors::BAD_TX_PREMATURE_SPEND.into());
                    }
                    coin.amount
                }
            };
            value_in = value_in.saturating_add(value);
        }

        let value_out = tx
            .output
            .iter()
            .fold(0u64, |total, output| total.saturating_add(output.value.to_sat()));
        if value_in < value_out {
            return Err(ConsensusErrors::BAD_TX_IN_BELOW_OUT.into());
        }

        let fee = value_in - value_out;
        if let Some(data) = contract_tx_data(tx)? {
            if fee < data.gas_cost() {
                return Err(ConsensusErrors::FEE_TOO_SMALL_FOR_GAS.into());
            }
        }

        Ok(fee)
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.inner.read().entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Txid) -> Option<MempoolEntry> {
        self.inner.read().entries.get(txid).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pool transaction spending `outpoint`, if any.
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Txid> {
        self.inner.read().spent_by.get(outpoint).copied()
    }

    /// Removes `txid` and the transactions depending on it.
    pub fn remove(&self, txid: &Txid) -> usize {
        self.inner.write().remove_with_descendants(*txid)
    }

    /// Random subset of the pool to announce, drawn from `rng`.
    pub fn relay_sample(&self, rng: &mut fastrand::Rng) -> Vec<Txid> {
        let mut txids = self.inner.read().entries.keys().copied().collect::<Vec<_>>();
        // Hash map order is not reproducible.
        txids.sort_unstable();
        shuffle(&mut txids, rng);
        txids.truncate(self.options.relay_sample_size);
        txids
    }

    /// Drops the transactions whose inputs are gone from both the coin view and the pool.
    pub fn revalidate(&self) -> Result<usize, MempoolError> {
        let mut inner = self.inner.write();

        let mut invalid = Vec::new();
        for (txid, entry) in &inner.entries {
            for input in &entry.tx.input {
                let prevout = input.previous_output;
                if inner.mempool_output(&prevout).is_none() && self.coins.get_coin(&prevout)?.is_none() {
                    invalid.push(*txid);
                    break;
                }
            }
        }

        let removed = invalid
            .into_iter()
            .map(|txid| inner.remove_with_descendants(txid))
            .sum();
        if removed > 0 {
            tracing::debug!(removed, "Dropped transactions with missing inputs");
        }
        Ok(removed)
    }

    fn block_connected(&self, txdata: &[Transaction], height: Height, time: u32) {
        *self.tip.write() = TipInfo { height, time };

        let mut inner = self.inner.write();
        let (mut mined, mut conflicts) = (0usize, 0usize);
        for tx in txdata {
            // Mined transactions leave, their children now spend confirmed coins.
            if inner.remove(&tx.compute_txid()).is_some() {
                mined += 1;
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.input {
                if let Some(conflict) = inner.spent_by.get(&input.previous_output).copied() {
                    conflicts += inner.remove_with_descendants(conflict);
                }
            }
        }

        tracing::debug!(height, mined, conflicts, pool_size = inner.entries.len(), "Mempool updated");
    }

    fn block_disconnected(&self, txdata: &[Transaction], height: Height) {
        {
            let mut tip = self.tip.write();
            tip.height = height.saturating_sub(1);
        }

        // Transactions of the disconnected block go back to the pool when still valid.
        let mut restored = 0;
        for tx in txdata {
            if tx.is_coinbase() || is_coinstake(tx) {
                continue;
            }
            if self.accept_inner(tx.clone(), tx.compute_txid()).is_ok() {
                restored += 1;
            }
        }

        tracing::debug!(height, restored, "Restored transactions of disconnected block");
    }

    /// Keeps the pool in sync with the best chain.
    pub fn subscribe(self: &Arc<Self>, events: &EventBus) -> SubscriptionId {
        let pool = Arc::downgrade(self);
        events.subscribe(move |event| {
            let Some(pool) = pool.upgrade() else {
                return;
            };
            match event {
                ChainEvent::BlockConnected { block, height } => {
                    pool.block_connected(&block.txdata, *height, block.header.time());
                }
                ChainEvent::BlockDisconnected { block, height } => {
                    pool.block_disconnected(&block.txdata, *height);
                }
                ChainEvent::TransactionRejected { .. } => {}
            }
        })
    }
}
