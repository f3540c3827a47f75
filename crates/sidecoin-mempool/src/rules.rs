//! Admission rules run on every candidate transaction.
//!
//! Rules are context free with respect to the pool itself, the checks against the coin view and
//! the pending transactions happen in [`crate::Mempool::accept`] under the pool lock.

use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Transaction, Txid};
use sidecoin_consensus::rules::{
    check_contract_code, check_gas_bounds, check_transaction_sanity, contract_tx_data, is_final,
};
use sidecoin_consensus::{ConsensusError, ConsensusErrors};
use sidecoin_primitives::{ConsensusParams, Height, is_coinstake};
use sidecoin_script::JoinFederationRequest;
use sidecoin_script::StandardScripts;
use sidecoin_script::opcodes::{is_smart_contract_exec, is_smart_contract_spend};
use std::sync::Arc;

/// Transaction under admission.
pub struct MempoolValidationContext<'a> {
    pub tx: &'a Transaction,
    pub txid: Txid,
    /// Height of the block the transaction would be mined in.
    pub height: Height,
    /// Time the lock time of the transaction is checked against.
    pub block_time: u32,
}

/// A single admission rule.
pub trait MempoolRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, ctx: &MempoolValidationContext<'_>) -> Result<(), ConsensusError>;
}

/// Block rewards only exist inside blocks.
pub struct RewardTransactionRule;

impl MempoolRule for RewardTransactionRule {
    fn name(&self) -> &'static str {
        "reward-transaction"
    }

    fn check(&self, ctx: &MempoolValidationContext<'_>) -> Result<(), ConsensusError> {
        if ctx.tx.is_coinbase() {
            return Err(ConsensusErrors::TX_COINBASE);
        }
        if is_coinstake(ctx.tx) {
            return Err(ConsensusErrors::TX_COINSTAKE);
        }
        Ok(())
    }
}

/// Structural checks shared with block validation, plus finality for the next block.
pub struct TransactionSanityRule;

impl MempoolRule for TransactionSanityRule {
    fn name(&self) -> &'static str {
        "transaction-sanity"
    }

    fn check(&self, ctx: &MempoolValidationContext<'_>) -> Result<(), ConsensusError> {
        check_transaction_sanity(ctx.tx)?;
        if !is_final(ctx.tx, ctx.height, ctx.block_time) {
            return Err(ConsensusErrors::BAD_TX_NON_FINAL);
        }
        Ok(())
    }
}

/// Contract spends are created by block producers only.
pub struct OpSpendRule;

impl MempoolRule for OpSpendRule {
    fn name(&self) -> &'static str {
        "opspend"
    }

    fn check(&self, ctx: &MempoolValidationContext<'_>) -> Result<(), ConsensusError> {
        let in_inputs = ctx
            .tx
            .input
            .iter()
            .any(|input| is_smart_contract_spend(&input.script_sig));
        let in_outputs = ctx
            .tx
            .output
            .iter()
            .any(|output| is_smart_contract_spend(&output.script_pubkey));

        if in_inputs || in_outputs {
            return Err(ConsensusErrors::OP_SPEND_IN_MEMPOOL);
        }
        Ok(())
    }
}

/// Join federation requests must decode.
pub struct VotingRequestRule;

impl MempoolRule for VotingRequestRule {
    fn name(&self) -> &'static str {
        "voting-request"
    }

    fn check(&self, ctx: &MempoolValidationContext<'_>) -> Result<(), ConsensusError> {
        if JoinFederationRequest::tagged_outputs(ctx.tx).any(|request| request.is_none()) {
            tracing::debug!(txid = %ctx.txid, "Malformed join federation request");
            return Err(ConsensusErrors::INVALID_VOTING_REQUEST);
        }
        Ok(())
    }
}

/// Contract payload, gas bounds and deployable code.
pub struct ContractTransactionRule {
    params: Arc<ConsensusParams>,
    secp: Secp256k1<VerifyOnly>,
}

impl ContractTransactionRule {
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        Self {
            params,
            secp: Secp256k1::verification_only(),
        }
    }
}

impl MempoolRule for ContractTransactionRule {
    fn name(&self) -> &'static str {
        "contract-transaction"
    }

    fn check(&self, ctx: &MempoolValidationContext<'_>) -> Result<(), ConsensusError> {
        let Some(data) = contract_tx_data(ctx.tx)? else {
            return Ok(());
        };
        let Some(params) = self.params.contracts.as_ref() else {
            return Err(ConsensusErrors::CONTRACT_INVALID_FORMAT);
        };

        check_gas_bounds(params, &data)?;
        check_contract_code(params, &self.secp, &data, ctx.height)
    }
}

/// Outputs must match a standard template.
///
/// Contract outputs and join federation requests are covered by their own rules.
pub struct StandardOutputsRule {
    scripts: StandardScripts,
}

impl StandardOutputsRule {
    pub fn new(max_op_return_relay: usize) -> Self {
        Self {
            scripts: StandardScripts::new(max_op_return_relay),
        }
    }
}

impl MempoolRule for StandardOutputsRule {
    fn name(&self) -> &'static str {
        "standard-outputs"
    }

    fn check(&self, ctx: &MempoolValidationContext<'_>) -> Result<(), ConsensusError> {
        let non_standard = ctx.tx.output.iter().any(|output| {
            !is_smart_contract_exec(&output.script_pubkey)
                && !JoinFederationRequest::is_tagged(&output.script_pubkey)
                && !self.scripts.is_standard(&output.script_pubkey)
        });
        if non_standard {
            return Err(ConsensusErrors::TX_NON_STANDARD_OUTPUT);
        }
        Ok(())
    }
}

/// Runs `rules` in order, stopping at the first failure.
pub fn check_rules(
    rules: &[Box<dyn MempoolRule>],
    ctx: &MempoolValidationContext<'_>,
) -> Result<(), ConsensusError> {
    for rule in rules {
        if let Err(err) = rule.check(ctx) {
            tracing::trace!(rule = rule.name(), txid = %ctx.txid, %err, "Mempool rule failed");
            return Err(err);
        }
    }
    Ok(())
}
