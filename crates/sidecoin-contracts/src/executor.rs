//! Execution of the contract transactions of a block.

use crate::sender::{SenderError, address_from_script, get_sender};
use crate::state::{StateReader, StateRepositoryRoot};
use crate::transition::{
    ExecutionMessage, Log, MessageKind, StateTransitionError, TransferInfo, TxEnvironment, apply,
};
use crate::trie::{self, EMPTY_ROOT, MemoryNodeStore, NodeHash};
use crate::tx_data::{ContractPayload, ContractTxData, ContractTxDataError};
use crate::Error;
use bitcoin::hashes::Hash;
use bitcoin::{Transaction, TxOut, Txid};
use codec::{Decode, Encode};
use sidecoin_coinview::CoinLookup;
use sidecoin_primitives::{
    Address, ContractParams, Height, SidechainBlock, SidechainHeader, is_coinstake,
};
use sidecoin_script::opcodes::is_smart_contract_exec;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    State(#[from] Error),

    #[error("Invalid contract transaction {txid}: {source}")]
    InvalidContractTx {
        txid: Txid,
        source: ContractTxDataError,
    },

    #[error("Cannot resolve the sender of {txid}: {source}")]
    Sender { txid: Txid, source: SenderError },

    #[error("Gas price {gas_price} of {txid} out of range")]
    GasPriceOutOfRange { txid: Txid, gas_price: u64 },

    #[error("Gas limit {gas_limit} of {txid} out of range")]
    GasLimitOutOfRange { txid: Txid, gas_limit: u64 },

    #[error("Block gas limit exceeded: {gas_used} > {limit}")]
    BlockGasLimitExceeded { gas_used: u64, limit: u64 },

    #[error("Refund of {txid} overflows")]
    RefundOverflow { txid: Txid },
}

/// Outcome of one contract transaction.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Receipt {
    pub txid: [u8; 32],
    pub from: Address,
    /// Called contract, or the created one.
    pub contract_address: Address,
    pub is_create: bool,
    pub gas_used: u64,
    pub success: bool,
    pub logs: Vec<Log>,
    pub internal_transfers: Vec<TransferInfo>,
    pub error: Option<String>,
}

/// Result of executing the contract transactions of a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockExecution {
    pub state_root: NodeHash,
    pub receipt_root: NodeHash,
    pub receipts: Vec<Receipt>,
    /// Unused gas, and the value of failed executions, owed back to each sender.
    pub refunds: Vec<(Address, u64)>,
    pub gas_used: u64,
}

/// Finds the contract output of a transaction.
pub fn contract_output(tx: &Transaction) -> Option<(usize, &TxOut)> {
    tx.output
        .iter()
        .enumerate()
        .find(|(_, output)| is_smart_contract_exec(&output.script_pubkey))
}

/// Executes contract transactions against the state repository.
pub struct ContractExecutor {
    repository: Arc<StateRepositoryRoot>,
    params: ContractParams,
}

impl ContractExecutor {
    pub fn new(repository: Arc<StateRepositoryRoot>, params: ContractParams) -> Self {
        Self { repository, params }
    }

    pub fn repository(&self) -> &Arc<StateRepositoryRoot> {
        &self.repository
    }

    /// Executes the contract transactions of `block` on top of `pre_root`.
    ///
    /// The new trie nodes are written to the shared store, but the repository root is only
    /// moved by [`Self::commit`].
    pub fn execute_block(
        &self,
        block: &SidechainBlock,
        height: Height,
        coins: &mut dyn CoinLookup,
        pre_root: NodeHash,
    ) -> Result<BlockExecution, ExecutorError> {
        let snapshot = self.repository.get_snapshot_to(pre_root)?;
        let mut state = snapshot.start_tracking();

        let coinbase = block
            .coinbase()
            .and_then(|tx| tx.output.first())
            .and_then(|output| address_from_script(&output.script_pubkey))
            .unwrap_or(Address::ZERO);

        let mut receipts = Vec::new();
        let mut refunds = Vec::new();
        let mut gas_used = 0u64;

        for (index, tx) in block.txdata.iter().enumerate() {
            if tx.is_coinbase() || is_coinstake(tx) {
                continue;
            }
            let Some((_, output)) = contract_output(tx) else {
                continue;
            };

            let txid = tx.compute_txid();
            let data = ContractTxData::from_script(&output.script_pubkey)
                .map_err(|source| ExecutorError::InvalidContractTx { txid, source })?;
            self.check_gas(txid, &data)?;

            let sender = get_sender(tx, Some(&mut *coins), Some(&block.txdata[..index]))
                .map_err(|source| ExecutorError::Sender { txid, source })?;

            let message = to_message(sender, output.value.to_sat(), data);
            let env = TxEnvironment {
                txid,
                block_height: height,
                coinbase,
            };

            let result = apply(&mut state, &message, &env)?;

            gas_used = gas_used.saturating_add(result.gas_consumed);
            if gas_used > self.params.block_gas_limit {
                return Err(ExecutorError::BlockGasLimitExceeded {
                    gas_used,
                    limit: self.params.block_gas_limit,
                });
            }

            let refund = gas_refund(&message, result.gas_consumed, result.is_success())
                .ok_or(ExecutorError::RefundOverflow { txid })?;
            if refund > 0 {
                refunds.push((sender, refund));
            }

            tracing::debug!(
                %txid,
                contract = %result.contract_address,
                gas_consumed = result.gas_consumed,
                success = result.is_success(),
                "Executed contract transaction"
            );

            receipts.push(Receipt {
                txid: txid.to_byte_array(),
                from: sender,
                contract_address: result.contract_address,
                is_create: matches!(message.kind, MessageKind::Create { .. }),
                gas_used: result.gas_consumed,
                success: result.is_success(),
                logs: result.logs,
                internal_transfers: result.internal_transfers,
                error: result.error.map(|err| err.to_string()),
            });
        }

        let state_root = snapshot.apply(state.into_changes())?;
        let receipt_root = receipt_root(&receipts)?;

        Ok(BlockExecution {
            state_root,
            receipt_root,
            receipts,
            refunds,
            gas_used,
        })
    }

    /// Moves the repository to the state produced by a connected block.
    pub fn commit(&self, execution: &BlockExecution) -> Result<(), Error> {
        if execution.state_root != self.repository.root() {
            self.repository.sync_to_root(execution.state_root)?;
        }
        Ok(())
    }

    fn check_gas(&self, txid: Txid, data: &ContractTxData) -> Result<(), ExecutorError> {
        if !(self.params.min_gas_price..=self.params.max_gas_price).contains(&data.gas_price) {
            return Err(ExecutorError::GasPriceOutOfRange {
                txid,
                gas_price: data.gas_price,
            });
        }
        if !(self.params.min_gas_limit..=self.params.max_gas_limit).contains(&data.gas_limit) {
            return Err(ExecutorError::GasLimitOutOfRange {
                txid,
                gas_limit: data.gas_limit,
            });
        }
        Ok(())
    }
}

/// Unused gas paid back to the sender, plus the sent value when execution failed.
fn gas_refund(message: &ExecutionMessage, gas_consumed: u64, success: bool) -> Option<u64> {
    let refund = message
        .gas_limit
        .saturating_sub(gas_consumed)
        .checked_mul(message.gas_price)?;
    if success {
        Some(refund)
    } else {
        refund.checked_add(message.value)
    }
}

fn to_message(sender: Address, value: u64, data: ContractTxData) -> ExecutionMessage {
    let kind = match data.payload {
        ContractPayload::Create { code, params } => MessageKind::Create { code, params },
        ContractPayload::Call {
            contract_address,
            method_name,
            params,
        } => MessageKind::Call {
            to: contract_address,
            method: method_name,
            params,
        },
    };
    ExecutionMessage {
        sender,
        value,
        gas_limit: data.gas_limit,
        gas_price: data.gas_price,
        kind,
    }
}

/// Root of a trie keyed by receipt index.
pub fn receipt_root(receipts: &[Receipt]) -> Result<NodeHash, Error> {
    if receipts.is_empty() {
        return Ok(EMPTY_ROOT);
    }
    let store = MemoryNodeStore::new();
    trie::update(
        &store,
        EMPTY_ROOT,
        receipts
            .iter()
            .enumerate()
            .map(|(index, receipt)| ((index as u32).to_be_bytes().to_vec(), Some(receipt.encode()))),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocalExecutionError {
    #[error("Block header carries no contract state")]
    MissingContractState,
    #[error("State root of the block is unknown")]
    UnknownStateRoot,
    #[error("Contract state unavailable: {0}")]
    State(String),
    #[error(transparent)]
    Execution(#[from] StateTransitionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalExecutionResult {
    pub gas_consumed: u64,
    pub logs: Vec<Log>,
    pub internal_transfers: Vec<TransferInfo>,
    pub return_value: Option<Vec<u8>>,
    pub error: Option<LocalExecutionError>,
}

impl LocalExecutionResult {
    fn failed(error: LocalExecutionError) -> Self {
        Self {
            gas_consumed: 0,
            logs: Vec::new(),
            internal_transfers: Vec::new(),
            return_value: None,
            error: Some(error),
        }
    }
}

/// Read-only execution against the state of a block.
///
/// Never moves the repository root. Nodes written while computing the result are unreachable
/// from any committed root.
pub struct LocalExecutor {
    repository: Arc<StateRepositoryRoot>,
}

impl LocalExecutor {
    pub fn new(repository: Arc<StateRepositoryRoot>) -> Self {
        Self { repository }
    }

    pub fn execute(
        &self,
        header: &SidechainHeader,
        height: Height,
        sender: Address,
        value: u64,
        data: &ContractTxData,
    ) -> LocalExecutionResult {
        let Some(roots) = header.contract_state else {
            return LocalExecutionResult::failed(LocalExecutionError::MissingContractState);
        };

        let snapshot = match self.repository.get_snapshot_to(roots.state_root) {
            Ok(snapshot) => snapshot,
            Err(Error::UnknownRoot(_)) => {
                return LocalExecutionResult::failed(LocalExecutionError::UnknownStateRoot);
            }
            Err(err) => return LocalExecutionResult::failed(LocalExecutionError::State(err.to_string())),
        };

        let mut state = snapshot.start_tracking();
        let message = to_message(sender, value, data.clone());
        let env = TxEnvironment {
            txid: Txid::all_zeros(),
            block_height: height,
            coinbase: Address::ZERO,
        };

        match apply(&mut state, &message, &env) {
            Ok(result) => LocalExecutionResult {
                gas_consumed: result.gas_consumed,
                logs: result.logs,
                internal_transfers: result.internal_transfers,
                return_value: result.return_value,
                error: result.error.map(Into::into),
            },
            Err(err) => LocalExecutionResult::failed(LocalExecutionError::State(err.to_string())),
        }
    }

    /// Reads a storage entry of a contract at the state of `header`.
    pub fn storage(
        &self,
        header: &SidechainHeader,
        address: &Address,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, LocalExecutionError> {
        let roots = header
            .contract_state
            .ok_or(LocalExecutionError::MissingContractState)?;
        let snapshot = self
            .repository
            .get_snapshot_to(roots.state_root)
            .map_err(|_| LocalExecutionError::UnknownStateRoot)?;
        snapshot
            .storage(address, key)
            .map_err(|err| LocalExecutionError::State(err.to_string()))
    }
}
