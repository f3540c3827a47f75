use crate::deployments::DeploymentFlags;
use crate::errors::ConsensusError;
use crate::rules::RuleEngineError;
use sidecoin_coinview::CoinChanges;
use sidecoin_contracts::BlockExecution;
use sidecoin_primitives::{ChainedHeader, Height, SidechainBlock};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Outcome of a single rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleState {
    NotRun,
    Running,
    Passed,
    Failed(ConsensusError),
}

/// Source of the network adjusted time.
pub trait TimeProvider: Send + Sync {
    /// Seconds since the UNIX epoch.
    fn adjusted_time(&self) -> u32;
}

/// Local system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn adjusted_time(&self) -> u32 {
        // A clock set before the epoch reads as zero and fails the header time checks.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as u32)
            .unwrap_or_default()
    }
}

/// State shared by the rules validating one block.
///
/// Rules later in the pipeline read what earlier rules left here, e.g. the connect phase
/// consumes the result of the contract execution.
pub struct RuleContext {
    /// Header under validation, linked to its ancestry.
    pub header: Arc<ChainedHeader>,
    /// Block body, absent when only the header is validated.
    pub block: Option<Arc<SidechainBlock>>,
    /// Deployment rules in force for this block.
    pub flags: DeploymentFlags,
    /// Network adjusted time at the start of validation.
    pub adjusted_time: u32,
    /// UTXO changes produced by the connect phase.
    pub coin_changes: Option<CoinChanges>,
    /// Result of executing the contract transactions.
    pub contract_execution: Option<BlockExecution>,
    /// Outcome of every rule scheduled so far, in execution order.
    pub states: Vec<(&'static str, RuleState)>,
}

impl RuleContext {
    pub fn new(
        header: Arc<ChainedHeader>,
        block: Option<Arc<SidechainBlock>>,
        flags: DeploymentFlags,
        adjusted_time: u32,
    ) -> Self {
        Self {
            header,
            block,
            flags,
            adjusted_time,
            coin_changes: None,
            contract_execution: None,
            states: Vec::new(),
        }
    }

    pub fn height(&self) -> Height {
        self.header.height()
    }

    /// Parent of the validated header, `None` for genesis.
    pub fn prev(&self) -> Option<&Arc<ChainedHeader>> {
        self.header.prev()
    }

    /// Block body required by `rule`.
    pub fn block(&self, rule: &'static str) -> Result<&Arc<SidechainBlock>, RuleEngineError> {
        self.block.as_ref().ok_or(RuleEngineError::MissingBlock(rule))
    }

    /// Outcome of the rule called `name`, `NotRun` if it was never scheduled.
    pub fn state_of(&self, name: &str) -> RuleState {
        self.states
            .iter()
            .rev()
            .find(|(rule, _)| *rule == name)
            .map(|(_, state)| *state)
            .unwrap_or(RuleState::NotRun)
    }

    pub(crate) fn set_state(&mut self, index: usize, state: RuleState) {
        if let Some(entry) = self.states.get_mut(index) {
            entry.1 = state;
        }
    }
}
