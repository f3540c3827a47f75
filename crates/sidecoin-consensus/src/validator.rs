//! Chain validator serialising block connection and disconnection.

use crate::context::{RuleContext, TimeProvider};
use crate::deployments::ThresholdConditionCache;
use crate::engine::{EngineSetupError, RuleEngine, RuleServices};
use crate::rules::{CounterChainTip, Federation, RuleEngineError, RulePhase};
use bitcoin::BlockHash;
use parking_lot::Mutex;
use sidecoin_coinview::{CoinView, PersistentCoinView};
use sidecoin_contracts::ContractExecutor;
use sidecoin_contracts::trie::{EMPTY_ROOT, NodeHash};
use sidecoin_primitives::{
    ChainEvent, ChainIndexer, ChainedHeader, ConsensusParams, EventBus, Height, SidechainBlock,
    SidechainHeader,
};
use sidecoin_storage::{BlockSource, ChainStore, KeyValueStore};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    #[error("Unknown parent block {0}")]
    UnknownParent(BlockHash),
    #[error("Block {hash} does not extend the best chain tip {tip}")]
    NotExtendingTip { hash: BlockHash, tip: BlockHash },
    #[error("Genesis block cannot be disconnected")]
    CannotDisconnectGenesis,
    #[error("Block body of {0} is not stored")]
    MissingBlock(BlockHash),
    #[error("Block {0} is not on the best chain")]
    NotOnBestChain(BlockHash),
    #[error(transparent)]
    Rule(#[from] RuleEngineError),
    #[error(transparent)]
    Setup(#[from] EngineSetupError),
    #[error(transparent)]
    Storage(#[from] sidecoin_storage::Error),
    #[error(transparent)]
    CoinView(#[from] sidecoin_coinview::Error),
    #[error(transparent)]
    Contracts(#[from] sidecoin_contracts::Error),
}

impl ValidatorError {
    /// The consensus error, if the block was rejected by a rule.
    pub fn consensus_error(&self) -> Option<crate::ConsensusError> {
        match self {
            Self::Rule(err) => err.consensus_error(),
            _ => None,
        }
    }
}

/// Collaborators of a [`ChainValidator`].
pub struct ValidatorServices {
    pub federation: Option<Arc<Federation>>,
    pub contracts: Option<Arc<ContractExecutor>>,
    pub counter_chain: Option<Arc<dyn CounterChainTip>>,
    pub events: Arc<EventBus>,
    pub time: Arc<dyn TimeProvider>,
}

/// Validates blocks and applies them to the best chain.
///
/// Block connection and disconnection are serialised by a single lock, held across a whole
/// reorganisation. The coin view and the contract state only change once a block passed every rule.
pub struct ChainValidator<S> {
    params: Arc<ConsensusParams>,
    indexer: ChainIndexer,
    store: Arc<ChainStore<S>>,
    coins: Arc<PersistentCoinView<S>>,
    contracts: Option<Arc<ContractExecutor>>,
    engine: RuleEngine,
    deployments: ThresholdConditionCache,
    events: Arc<EventBus>,
    time: Arc<dyn TimeProvider>,
    connect_lock: Mutex<()>,
}

impl<S: KeyValueStore + 'static> ChainValidator<S> {
    /// Opens the chain persisted in `db`, seeding it with `genesis` when empty.
    pub fn new(
        params: Arc<ConsensusParams>,
        db: Arc<S>,
        genesis: &SidechainBlock,
        services: ValidatorServices,
    ) -> Result<Self, ValidatorError> {
        let store = Arc::new(ChainStore::new(db.clone()));

        let genesis_hash = genesis.block_hash();
        if store.get_block(&genesis_hash)?.is_none() {
            store.put_block(genesis)?;
            tracing::info!(hash = %genesis_hash, "Stored genesis block");
        }

        let indexer = store.load_chain(genesis.header.clone())?;

        let coins = Arc::new(PersistentCoinView::new(db));

        let engine = RuleEngine::for_family(
            params.clone(),
            RuleServices {
                coins: coins.clone(),
                federation: services.federation,
                contracts: services.contracts.clone(),
                counter_chain: services.counter_chain,
                blocks: Some(store.clone() as Arc<dyn BlockSource>),
            },
        )?;

        let tip = indexer.tip();
        tracing::info!(
            height = tip.height(),
            hash = %tip.hash(),
            family = ?params.family,
            "Chain validator ready"
        );

        Ok(Self {
            deployments: ThresholdConditionCache::new(params.clone()),
            params,
            indexer,
            store,
            coins,
            contracts: services.contracts,
            engine,
            events: services.events,
            time: services.time,
            connect_lock: Mutex::new(()),
        })
    }

    pub fn params(&self) -> &Arc<ConsensusParams> {
        &self.params
    }

    pub fn indexer(&self) -> &ChainIndexer {
        &self.indexer
    }

    pub fn tip(&self) -> Arc<ChainedHeader> {
        self.indexer.tip()
    }

    pub fn coin_view(&self) -> Arc<dyn CoinView> {
        self.coins.clone()
    }

    pub fn deployments(&self) -> &ThresholdConditionCache {
        &self.deployments
    }

    pub fn get_block(&self, hash: &BlockHash) -> Result<Option<SidechainBlock>, ValidatorError> {
        Ok(self.store.get_block(hash)?)
    }

    fn context(
        &self,
        header: Arc<ChainedHeader>,
        block: Option<Arc<SidechainBlock>>,
    ) -> RuleContext {
        let flags = self.deployments.compute_flags(header.prev());
        RuleContext::new(header, block, flags, self.time.adjusted_time())
    }

    /// Runs the header rules and registers the header without changing the best chain.
    pub fn validate_header(&self, header: SidechainHeader) -> Result<Arc<ChainedHeader>, ValidatorError> {
        let prev_hash = header.header.prev_blockhash;
        let prev = self
            .indexer
            .get_by_hash(&prev_hash)
            .ok_or(ValidatorError::UnknownParent(prev_hash))?;

        let chained = ChainedHeader::new(header, prev);
        if let Some(known) = self.indexer.get_by_hash(&chained.hash()) {
            return Ok(known);
        }

        let mut ctx = self.context(chained.clone(), None);
        self.engine.run_phase(RulePhase::Header, &mut ctx)?;

        self.store.put_header(chained.header())?;
        self.indexer.insert(chained.clone());

        tracing::debug!(height = chained.height(), hash = %chained.hash(), "Header accepted");

        Ok(chained)
    }


    /// Fully validates `block` on top of the current tip and makes it the new tip.
    pub fn connect_block(&self, block: SidechainBlock) -> Result<Arc<ChainedHeader>, ValidatorError> {
        let _guard = self.connect_lock.lock();
        self.connect_locked(block)
    }

    /// Disconnects the tip, restoring the coin view and the contract state of its parent.
    pub fn disconnect_tip(&self) -> Result<Arc<ChainedHeader>, ValidatorError> {
        let _guard = self.connect_lock.lock();
        self.disconnect_locked().map(|(parent, _block)| parent)
    }

    /// Disconnects blocks down to `fork` and connects `blocks` on top of it, in order.
    ///
    /// The switch is all or nothing: if any block of the new branch fails, the blocks connected
    /// so far are disconnected and the previous best chain is reconnected before the error is
    /// returned.
    pub fn reorganize(
        &self,
        fork: &Arc<ChainedHeader>,
        blocks: Vec<SidechainBlock>,
    ) -> Result<Height, ValidatorError> {
        let _guard = self.connect_lock.lock();

        if !self.indexer.contains(&fork.hash()) {
            return Err(ValidatorError::NotOnBestChain(fork.hash()));
        }

        let previous_tip = self.indexer.tip();
        let mut disconnected = Vec::new();

        match self.switch_branch(fork.height(), blocks, &mut disconnected) {
            Ok(()) => {
                let tip = self.indexer.tip();
                tracing::info!(
                    fork = fork.height(),
                    from = %previous_tip.hash(),
                    to = %tip.hash(),
                    height = tip.height(),
                    "Reorganized best chain"
                );
                Ok(tip.height())
            }
            Err(err) => {
                tracing::warn!(
                    fork = fork.height(),
                    tip = %previous_tip.hash(),
                    ?err,
                    "Reorganization failed, restoring the previous best chain"
                );
                if let Err(restore_err) = self.restore_branch(&previous_tip, disconnected) {
                    tracing::error!(?restore_err, "Failed to restore the previous best chain");
                    return Err(restore_err);
                }
                Err(err)
            }
        }
    }

    /// Caller holds `connect_lock`. Disconnected blocks are pushed tip first.
    fn switch_branch(
        &self,
        fork_height: Height,
        blocks: Vec<SidechainBlock>,
        disconnected: &mut Vec<Arc<SidechainBlock>>,
    ) -> Result<(), ValidatorError> {
        while self.indexer.height() > fork_height {
            let (_parent, block) = self.disconnect_locked()?;
            disconnected.push(block);
        }
        for block in blocks {
            self.connect_locked(block)?;
        }
        Ok(())
    }

    /// Unwinds any block not on the chain of `previous_tip` and reconnects `disconnected`.
    fn restore_branch(
        &self,
        previous_tip: &Arc<ChainedHeader>,
        disconnected: Vec<Arc<SidechainBlock>>,
    ) -> Result<(), ValidatorError> {
        while !previous_tip.descends_from(&self.indexer.tip()) {
            self.disconnect_locked()?;
        }
        for block in disconnected.into_iter().rev() {
            self.connect_locked(Arc::unwrap_or_clone(block))?;
        }
        Ok(())
    }

    fn connect_locked(&self, block: SidechainBlock) -> Result<Arc<ChainedHeader>, ValidatorError> {
        let tip = self.indexer.tip();
        let hash = block.block_hash();
        if block.header.header.prev_blockhash != tip.hash() {
            return Err(ValidatorError::NotExtendingTip {
                hash,
                tip: tip.hash(),
            });
        }

        let header = ChainedHeader::new(block.header.clone(), tip);
        let block = Arc::new(block);
        let mut ctx = self.context(header.clone(), Some(block.clone()));

        self.engine.run_all(&mut ctx)?;

        // Every rule passed, nothing below may reject the block.
        self.store.put_block(&block)?;
        self.apply_connect(&header, &mut ctx)?;
        self.indexer.set_tip(header.clone());

        tracing::info!(
            height = header.height(),
            %hash,
            txs = block.txdata.len(),
            "Connected block"
        );

        self.events.publish(&ChainEvent::BlockConnected {
            block,
            height: header.height(),
        });

        Ok(header)
    }

    /// Writes the contract state, the chain tip and the coin view of a validated block.
    ///
    /// The coin view commit is atomic and goes last, a failure before it is undone here.
    fn apply_connect(&self, header: &Arc<ChainedHeader>, ctx: &mut RuleContext) -> Result<(), ValidatorError> {
        let previous_root = self.contract_root();

        if let (Some(executor), Some(execution)) = (&self.contracts, &ctx.contract_execution) {
            executor.commit(execution)?;
        }

        if let Err(err) = self.store.put_tip(header) {
            self.restore_contract_root(previous_root);
            return Err(err.into());
        }

        if let Some(changes) = ctx.coin_changes.take() {
            if let Err(err) = self.coins.commit(changes) {
                self.restore_contract_root(previous_root);
                if let Err(undo) = self.store.truncate_above(header.height() - 1) {
                    tracing::error!(?undo, height = header.height(), "Failed to remove the stored chain tip");
                }
                return Err(err.into());
            }
        }

        Ok(())
    }

    fn disconnect_locked(&self) -> Result<(Arc<ChainedHeader>, Arc<SidechainBlock>), ValidatorError> {
        let tip = self.indexer.tip();
        let parent = tip
            .prev()
            .cloned()
            .ok_or(ValidatorError::CannotDisconnectGenesis)?;
        let block = self
            .store
            .get_block(&tip.hash())?
            .map(Arc::new)
            .ok_or(ValidatorError::MissingBlock(tip.hash()))?;

        // Same order as connecting: the atomic coin view rewind goes last.
        self.store.truncate_above(parent.height())?;

        let tip_root = self.contract_root();
        if let Some(executor) = &self.contracts {
            let root = parent
                .header()
                .contract_state
                .map(|roots| roots.state_root)
                .unwrap_or(EMPTY_ROOT);
            if let Err(err) = executor.repository().sync_to_root(root) {
                self.restore_stored_tip(&tip);
                return Err(err.into());
            }
        }

        if let Err(err) = self.coins.rewind(tip.height()) {
            self.restore_contract_root(tip_root);
            self.restore_stored_tip(&tip);
            return Err(err.into());
        }

        self.indexer.set_tip(parent.clone());

        tracing::info!(height = tip.height(), hash = %tip.hash(), "Disconnected block");

        self.events.publish(&ChainEvent::BlockDisconnected {
            block: block.clone(),
            height: tip.height(),
        });

        Ok((parent, block))
    }

    fn contract_root(&self) -> Option<NodeHash> {
        self.contracts
            .as_ref()
            .map(|executor| executor.repository().root())
    }

    fn restore_contract_root(&self, root: Option<NodeHash>) {
        if let (Some(executor), Some(root)) = (&self.contracts, root) {
            if let Err(err) = executor.repository().sync_to_root(root) {
                tracing::error!(?err, root = %hex::encode(root), "Failed to restore the contract state root");
            }
        }
    }

    fn restore_stored_tip(&self, tip: &Arc<ChainedHeader>) {
        if let Err(err) = self.store.put_tip(tip) {
            tracing::error!(?err, height = tip.height(), "Failed to restore the stored chain tip");
        }
    }
}
