//! Smart contract rules.

use super::{ConsensusRule, RuleEngineError};
use crate::context::RuleContext;
use crate::errors::{ConsensusError, ConsensusErrors};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{PubkeyHash, ScriptBuf, Transaction};
use sidecoin_coinview::CoinView;
use sidecoin_contracts::trie::EMPTY_ROOT;
use sidecoin_contracts::{
    BlockExecution, ContractExecutor, ContractTxData, ExecutorError, contract_output,
};
use sidecoin_primitives::{
    Address, ConsensusParams, ContractParams, Height, SidechainBlock, is_coinstake,
};
use sidecoin_script::opcodes::{is_smart_contract_exec, is_smart_contract_spend};
use std::sync::Arc;

/// Decodes the contract payload of `tx`, `None` if it carries none.
pub fn contract_tx_data(tx: &Transaction) -> Result<Option<ContractTxData>, ConsensusError> {
    let mut exec_outputs = tx
        .output
        .iter()
        .filter(|output| is_smart_contract_exec(&output.script_pubkey));

    let Some(output) = exec_outputs.next() else {
        return Ok(None);
    };
    if exec_outputs.next().is_some() {
        return Err(ConsensusErrors::CONTRACT_MULTIPLE_OUTPUTS);
    }

    ContractTxData::from_script(&output.script_pubkey)
        .map(Some)
        .map_err(|_| ConsensusErrors::CONTRACT_INVALID_FORMAT)
}

/// Gas price and limit must be within the network bounds.
pub fn check_gas_bounds(params: &ContractParams, data: &ContractTxData) -> Result<(), ConsensusError> {
    if !(params.min_gas_price..=params.max_gas_price).contains(&data.gas_price) {
        return Err(ConsensusErrors::GAS_PRICE_OUT_OF_RANGE);
    }
    if !(params.min_gas_limit..=params.max_gas_limit).contains(&data.gas_limit) {
        return Err(ConsensusErrors::GAS_LIMIT_OUT_OF_RANGE);
    }
    Ok(())
}

/// Checks the code of a contract creation against the allowed hashes and, once signed code is
/// enforced at `height`, against the required code signers.
///
/// Calls always pass.
pub fn check_contract_code(
    params: &ContractParams,
    secp: &Secp256k1<VerifyOnly>,
    data: &ContractTxData,
    height: Height,
) -> Result<(), ConsensusError> {
    let Some(hash) = data.code_hash() else {
        return Ok(());
    };

    if !params.allowed_code_hashes.is_empty() && !params.allowed_code_hashes.contains(&hash) {
        tracing::debug!(code_hash = %hex::encode(hash), "Contract code hash not allowed");
        return Err(ConsensusErrors::CONTRACT_CODE_INVALID_HASH);
    }

    if height < params.signed_code_activation_height || params.code_signers.is_empty() {
        return Ok(());
    }

    // Recovery failures of any kind reject the transaction.
    let recovered = data
        .recover_code_signers(secp)
        .map_err(|_| ConsensusErrors::CONTRACT_CODE_INVALID_SIGNATURE)?;

    let all_signed = params
        .code_signers
        .iter()
        .all(|signer| recovered.contains(&signer.inner));
    if !all_signed {
        return Err(ConsensusErrors::CONTRACT_CODE_UNSIGNED);
    }

    Ok(())
}

fn contract_params(params: &ConsensusParams) -> Option<&ContractParams> {
    params.contracts.as_ref()
}

/// Transactions subject to contract rules: everything but the block rewards.
fn user_transactions(block: &SidechainBlock) -> impl Iterator<Item = &Transaction> {
    block
        .txdata
        .iter()
        .filter(|tx| !tx.is_coinbase() && !is_coinstake(tx))
}

/// Contract outputs are well formed, unique per transaction and contract spends never appear.
pub struct ContractFormatRule;

impl ConsensusRule for ContractFormatRule {
    fn name(&self) -> &'static str {
        "contract-format"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let block = ctx.block(self.name())?;

        for tx in user_transactions(block) {
            let spends_contract = tx
                .input
                .iter()
                .any(|input| is_smart_contract_spend(&input.script_sig))
                || tx
                    .output
                    .iter()
                    .any(|output| is_smart_contract_spend(&output.script_pubkey));
            if spends_contract {
                return Err(ConsensusErrors::OP_SPEND_IN_BLOCK.into());
            }

            contract_tx_data(tx)?;
        }

        Ok(())
    }
}

/// Gas price and limit of every contract transaction are within the network bounds.
pub struct ContractGasRule {
    params: Arc<ConsensusParams>,
}

impl ContractGasRule {
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        Self { params }
    }
}

impl ConsensusRule for ContractGasRule {
    fn name(&self) -> &'static str {
        "contract-gas"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let Some(params) = contract_params(&self.params) else {
            return Ok(());
        };
        let block = ctx.block(self.name())?;

        for tx in user_transactions(block) {
            if let Some(data) = contract_tx_data(tx)? {
                check_gas_bounds(params, &data)?;
            }
        }

        Ok(())
    }
}

/// Contract creations must deploy allowed, correctly signed code.
pub struct SmartContractCodeHashRule {
    params: Arc<ConsensusParams>,
    secp: Secp256k1<VerifyOnly>,
}

impl SmartContractCodeHashRule {
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        Self {
            params,
            secp: Secp256k1::verification_only(),
        }
    }
}

impl ConsensusRule for SmartContractCodeHashRule {
    fn name(&self) -> &'static str {
        "contract-code-hash"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let Some(params) = contract_params(&self.params) else {
            return Ok(());
        };
        let height = ctx.height();
        let block = ctx.block(self.name())?;

        for tx in user_transactions(block) {
            if let Some(data) = contract_tx_data(tx)? {
                check_contract_code(params, &self.secp, &data, height)?;
            }
        }

        Ok(())
    }
}

/// Executes the contract transactions and checks the committed roots and the gas refunds.
///
/// Runs before the block is applied to the coin view, senders spending outputs of the same
/// block are resolved from the block itself.
pub struct ContractExecutionRule {
    executor: Arc<ContractExecutor>,
    coins: Arc<dyn CoinView>,
}

impl ContractExecutionRule {
    pub fn new(executor: Arc<ContractExecutor>, coins: Arc<dyn CoinView>) -> Self {
        Self { executor, coins }
    }
}

fn executor_error(err: ExecutorError) -> RuleEngineError {
    match err {
        ExecutorError::State(err) => RuleEngineError::Contracts(err),
        ExecutorError::InvalidContractTx { .. } => ConsensusErrors::CONTRACT_INVALID_FORMAT.into(),
        ExecutorError::Sender { .. } => ConsensusErrors::UNRESOLVED_SENDER.into(),
        ExecutorError::GasPriceOutOfRange { .. } => ConsensusErrors::GAS_PRICE_OUT_OF_RANGE.into(),
        ExecutorError::GasLimitOutOfRange { .. } => ConsensusErrors::GAS_LIMIT_OUT_OF_RANGE.into(),
        ExecutorError::BlockGasLimitExceeded { .. } => {
            ConsensusErrors::BLOCK_GAS_LIMIT_EXCEEDED.into()
        }
    }
}

/// Output paying a gas refund to `address`.
pub fn refund_script(address: &Address) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(*address.as_bytes()))
}

impl ConsensusRule for ContractExecutionRule {
    fn name(&self) -> &'static str {
        "contract-execution"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let roots = ctx
            .header
            .header()
            .contract_state
            .ok_or(ConsensusErrors::MISSING_CONTRACT_STATE)?;

        let pre_root = ctx
            .prev()
            .and_then(|prev| prev.header().contract_state)
            .map(|roots| roots.state_root)
            .unwrap_or(EMPTY_ROOT);

        let height = ctx.height();
        let block = ctx.block(self.name())?.clone();

        let mut coins = &*self.coins;
        let execution = self
            .executor
            .execute_block(&block, height, &mut coins, pre_root)
            .map_err(executor_error)?;

        if execution.state_root != roots.state_root {
            tracing::debug!(
                height,
                expected = %hex::encode(execution.state_root),
                got = %hex::encode(roots.state_root),
                "Contract state root mismatch"
            );
            return Err(ConsensusErrors::INVALID_STATE_ROOT.into());
        }

        if execution.receipt_root != roots.receipt_root {
            return Err(ConsensusErrors::INVALID_RECEIPT_ROOT.into());
        }

        check_refunds(&block, &execution)?;

        tracing::debug!(
            height,
            receipts = execution.receipts.len(),
            gas_used = execution.gas_used,
            "Executed contract transactions"
        );

        ctx.contract_execution = Some(execution);

        Ok(())
    }
}

/// Every refund must be paid by a distinct coinbase output of exactly the refunded amount.
fn check_refunds(block: &SidechainBlock, execution: &BlockExecution) -> Result<(), ConsensusError> {
    let Some(coinbase) = block.coinbase() else {
        return Err(ConsensusErrors::BAD_COINBASE_MISSING);
    };

    let mut used = vec![false; coinbase.output.len()];
    for (address, amount) in &execution.refunds {
        let script = refund_script(address);
        let found = coinbase.output.iter().enumerate().position(|(index, output)| {
            !used[index] && output.value.to_sat() == *amount && output.script_pubkey == script
        });
        match found {
            Some(index) => used[index] = true,
            None => {
                tracing::debug!(sender = %address, amount, "Missing gas refund");
                return Err(ConsensusErrors::MISSING_REFUND_OUTPUT);
            }
        }
    }

    Ok(())
}

/// Value sent to contracts by executions that failed, returned to the senders by the coinbase.
pub fn failed_execution_value(block: &SidechainBlock, execution: &BlockExecution) -> u64 {
    execution
        .receipts
        .iter()
        .filter(|receipt| !receipt.success)
        .filter_map(|receipt| {
            block
                .txdata
                .iter()
                .find(|tx| tx.compute_txid().to_byte_array() == receipt.txid)
                .and_then(contract_output)
                .map(|(_, output)| output.value.to_sat())
        })
        .sum()
}
