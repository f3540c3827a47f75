//! Consensus rules.
//!
//! Every rule validates one aspect of a block and either returns normally or fails with a named
//! [`ConsensusError`]. Rules are grouped per [`RulePhase`] by the [`crate::RuleEngine`].

mod common;
mod contracts;
mod poa;
mod pos;
mod pow;
mod utxo;

pub use self::common::{
    BlockIntegrityRule, HeaderTimeRule, TransactionFinalityRule, check_transaction_sanity,
    is_final,
};
pub use self::contracts::{
    ContractExecutionRule, ContractFormatRule, ContractGasRule, SmartContractCodeHashRule,
    check_contract_code, check_gas_bounds, contract_tx_data, failed_execution_value,
    refund_script,
};
pub use self::poa::{
    CollateralCommitmentRule, CounterChainTip, Federation, PoaHeaderSignatureRule,
    PoaSlotTimingRule,
};
pub use self::pos::{CoinstakeStructureRule, StakeKernelRule, stake_kernel_hash};
pub use self::pow::{PowDifficultyRule, calculate_next_work_required, get_next_work_required};
pub use self::utxo::UtxoConnectRule;

use crate::context::RuleContext;
use crate::errors::ConsensusError;

/// Validation phase a rule belongs to.
///
/// Phases run in declaration order, a failing phase prevents every later one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RulePhase {
    /// Checks on the header alone.
    Header,
    /// Context free checks on the block body.
    Partial,
    /// Checks against the chain state, contract execution included.
    Full,
    /// Applies the block to the coin view.
    Connect,
}

impl RulePhase {
    pub const ALL: [RulePhase; 4] = [Self::Header, Self::Partial, Self::Full, Self::Connect];
}

/// Rule pipeline error.
#[derive(Debug, thiserror::Error)]
pub enum RuleEngineError {
    /// The block is invalid.
    #[error("{0}")]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Storage(#[from] sidecoin_storage::Error),
    #[error(transparent)]
    CoinView(#[from] sidecoin_coinview::Error),
    #[error(transparent)]
    Contracts(#[from] sidecoin_contracts::Error),
    #[error("Rule {0} requires the block body")]
    MissingBlock(&'static str),
}

impl RuleEngineError {
    /// The consensus error, if the failure is a protocol level rejection.
    pub fn consensus_error(&self) -> Option<ConsensusError> {
        match self {
            Self::Consensus(err) => Some(*err),
            _ => None,
        }
    }
}

/// A single validation rule.
pub trait ConsensusRule: Send + Sync {
    /// Name identifying the rule in logs and rule states.
    fn name(&self) -> &'static str;

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError>;
}
