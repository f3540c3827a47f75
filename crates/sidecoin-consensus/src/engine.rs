//! Phased rule pipeline.

use crate::context::{RuleContext, RuleState};
use crate::rules::{
    BlockIntegrityRule, CoinstakeStructureRule, CollateralCommitmentRule, ConsensusRule,
    ContractExecutionRule, ContractFormatRule, ContractGasRule, CounterChainTip, Federation,
    HeaderTimeRule, PoaHeaderSignatureRule, PoaSlotTimingRule, PowDifficultyRule, RuleEngineError,
    RulePhase, SmartContractCodeHashRule, StakeKernelRule, TransactionFinalityRule,
    UtxoConnectRule,
};
use sidecoin_coinview::CoinView;
use sidecoin_contracts::ContractExecutor;
use sidecoin_primitives::{ConsensusFamily, ConsensusParams};
use sidecoin_storage::BlockSource;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Services the rules of a consensus family depend on.
#[derive(Clone)]
pub struct RuleServices {
    pub coins: Arc<dyn CoinView>,
    /// Required by proof of authority networks.
    pub federation: Option<Arc<Federation>>,
    /// Required by contract-enabled networks.
    pub contracts: Option<Arc<ContractExecutor>>,
    /// Enables the collateral commitment checks.
    pub counter_chain: Option<Arc<dyn CounterChainTip>>,
    /// Stored blocks, read by the collateral commitment checks.
    pub blocks: Option<Arc<dyn BlockSource>>,
}

/// Error constructing a [`RuleEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineSetupError {
    #[error("Proof of authority requires a federation")]
    MissingFederation,
    #[error("Smart contracts require a contract executor")]
    MissingContractExecutor,
    #[error("Collateral commitments require a block source")]
    MissingBlockSource,
}

/// Ordered rules grouped by [`RulePhase`].
#[derive(Default)]
pub struct RuleEngine {
    phases: BTreeMap<RulePhase, Vec<Arc<dyn ConsensusRule>>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the rule set of the consensus family configured in `params`.
    pub fn for_family(
        params: Arc<ConsensusParams>,
        services: RuleServices,
    ) -> Result<Self, EngineSetupError> {
        let mut engine = Self::new();

        engine.register(RulePhase::Header, HeaderTimeRule::new(params.clone()));
        match params.family {
            ConsensusFamily::Pow => {
                engine.register(RulePhase::Header, PowDifficultyRule::new(params.clone()));
            }
            ConsensusFamily::Pos => {}
            ConsensusFamily::Poa => {
                let federation = services
                    .federation
                    .clone()
                    .ok_or(EngineSetupError::MissingFederation)?;
                engine.register(RulePhase::Header, PoaSlotTimingRule::new(params.clone()));
                engine.register(
                    RulePhase::Header,
                    PoaHeaderSignatureRule::new(params.clone(), federation),
                );
            }
        }

        engine.register(RulePhase::Partial, BlockIntegrityRule);
        engine.register(RulePhase::Partial, TransactionFinalityRule);
        if params.family == ConsensusFamily::Pos {
            engine.register(RulePhase::Partial, CoinstakeStructureRule::new(params.clone()));
            engine.register(
                RulePhase::Full,
                StakeKernelRule::new(params.clone(), services.coins.clone()),
            );
        }

        let collateral = params.poa.as_ref().and_then(|poa| poa.collateral.as_ref());
        if let (Some(_), Some(counter_chain)) = (collateral, services.counter_chain.clone()) {
            let blocks = services
                .blocks
                .clone()
                .ok_or(EngineSetupError::MissingBlockSource)?;
            engine.register(
                RulePhase::Full,
                CollateralCommitmentRule::new(params.clone(), counter_chain, blocks),
            );
        }

        if params.contracts.is_some() {
            let executor = services
                .contracts
                .clone()
                .ok_or(EngineSetupError::MissingContractExecutor)?;
            engine.register(RulePhase::Partial, ContractFormatRule);
            engine.register(RulePhase::Partial, ContractGasRule::new(params.clone()));
            engine.register(RulePhase::Full, SmartContractCodeHashRule::new(params.clone()));
            engine.register(
                RulePhase::Full,
                ContractExecutionRule::new(executor, services.coins.clone()),
            );
        }

        engine.register(
            RulePhase::Connect,
            UtxoConnectRule::new(params, services.coins),
        );

        Ok(engine)
    }

    /// Appends `rule` to `phase`, rules of a phase run in registration order.
    pub fn register(&mut self, phase: RulePhase, rule: impl ConsensusRule + 'static) -> &mut Self {
        self.phases.entry(phase).or_default().push(Arc::new(rule));
        self
    }

    /// Names of the rules registered for `phase`.
    pub fn rule_names(&self, phase: RulePhase) -> Vec<&'static str> {
        self.phases
            .get(&phase)
            .map(|rules| rules.iter().map(|rule| rule.name()).collect())
            .unwrap_or_default()
    }

    /// Runs the rules of `phase`, stopping at the first failure.
    ///
    /// Rules of the phase are recorded as [`RuleState::NotRun`] up front so that the context
    /// tells which rules were skipped by an earlier failure.
    pub fn run_phase(&self, phase: RulePhase, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let Some(rules) = self.phases.get(&phase) else {
            return Ok(());
        };

        let first = ctx.states.len();
        ctx.states
            .extend(rules.iter().map(|rule| (rule.name(), RuleState::NotRun)));

        for (offset, rule) in rules.iter().enumerate() {
            let index = first + offset;
            ctx.set_state(index, RuleState::Running);

            match rule.check(ctx) {
                Ok(()) => ctx.set_state(index, RuleState::Passed),
                Err(err) => {
                    if let Some(consensus_error) = err.consensus_error() {
                        ctx.set_state(index, RuleState::Failed(consensus_error));
                    }
                    tracing::debug!(
                        ?phase,
                        rule = rule.name(),
                        height = ctx.height(),
                        hash = %ctx.header.hash(),
                        %err,
                        "Block failed validation"
                    );
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Runs every phase in order.
    pub fn run_all(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        RulePhase::ALL
            .into_iter()
            .try_for_each(|phase| self.run_phase(phase, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployments::DeploymentFlags;
    use crate::errors::{ConsensusError, ConsensusErrors};
    use crate::test_utils::*;
    use sidecoin_primitives::Network;

    struct Fixed(&'static str, Option<ConsensusError>);

    impl ConsensusRule for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        fn check(&self, _ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
            match self.1 {
                Some(err) => Err(err.into()),
                None => Ok(()),
            }
        }
    }

    fn context() -> RuleContext {
        let genesis = chain(0, 1_600_000, 16).remove(0);
        let (header, block) = block_on(Some(&genesis), 1_600_016, vec![coinbase(1, Vec::new())]);
        RuleContext::new(header, Some(block), DeploymentFlags::default(), 1_600_016)
    }

    #[test]
    fn failing_rule_stops_the_pipeline() {
        let mut engine = RuleEngine::new();
        engine
            .register(RulePhase::Header, Fixed("first", None))
            .register(RulePhase::Header, Fixed("second", Some(ConsensusErrors::HIGH_HASH)))
            .register(RulePhase::Header, Fixed("third", None))
            .register(RulePhase::Partial, Fixed("partial", None));

        let mut ctx = context();
        let err = engine.run_all(&mut ctx).unwrap_err();
        assert_eq!(err.consensus_error(), Some(ConsensusErrors::HIGH_HASH));

        assert_eq!(ctx.state_of("first"), RuleState::Passed);
        assert_eq!(
            ctx.state_of("second"),
            RuleState::Failed(ConsensusErrors::HIGH_HASH)
        );
        assert_eq!(ctx.state_of("third"), RuleState::NotRun);
        // Later phases are never scheduled.
        assert_eq!(ctx.state_of("partial"), RuleState::NotRun);
        assert_eq!(ctx.states.len(), 3);
    }

    #[test]
    fn phases_run_in_order() {
        let mut engine = RuleEngine::new();
        engine
            .register(RulePhase::Connect, Fixed("connect", None))
            .register(RulePhase::Header, Fixed("header", None));

        let mut ctx = context();
        engine.run_all(&mut ctx).unwrap();
        let names = ctx.states.iter().map(|(name, _)| *name).collect::<Vec<_>>();
        assert_eq!(names, vec!["header", "connect"]);
    }

    #[test]
    fn family_rule_sets() {
        let coins: Arc<dyn CoinView> = funded_view(&[], 0);
        let services = RuleServices {
            coins,
            federation: None,
            contracts: None,
            counter_chain: None,
            blocks: None,
        };

        let poa = Arc::new(ConsensusParams::new(Network::Regtest));
        assert!(matches!(
            RuleEngine::for_family(poa, services.clone()),
            Err(EngineSetupError::MissingFederation)
        ));

        let mut pow = ConsensusParams::new(Network::Regtest).with_family(ConsensusFamily::Pow);
        pow.contracts = None;
        let engine = RuleEngine::for_family(Arc::new(pow), services.clone()).unwrap();
        assert_eq!(
            engine.rule_names(RulePhase::Header),
            vec!["header-time", "pow-difficulty"]
        );
        assert_eq!(engine.rule_names(RulePhase::Connect), vec!["utxo-connect"]);

        let mut pos = ConsensusParams::new(Network::Regtest).with_family(ConsensusFamily::Pos);
        pos.contracts = None;
        let engine = RuleEngine::for_family(Arc::new(pos), services).unwrap();
        assert_eq!(
            engine.rule_names(RulePhase::Full),
            vec!["stake-kernel"]
        );
    }
}
