//! Proof of stake rules.

use super::pow::to_biguint;
use super::{ConsensusRule, RuleEngineError};
use crate::context::RuleContext;
use crate::errors::ConsensusErrors;
use bitcoin::hashes::{Hash, HashEngine, sha256d};
use bitcoin::{BlockHash, OutPoint};
use num_bigint::BigUint;
use sidecoin_coinview::CoinView;
use sidecoin_primitives::{ConsensusParams, Height, PosParams, is_coinstake};
use std::sync::Arc;

/// Hash of the stake kernel: `prev block hash ‖ coin height ‖ prevout ‖ block time`.
pub fn stake_kernel_hash(
    prev_block: BlockHash,
    coin_height: Height,
    prevout: &OutPoint,
    time: u32,
) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(prev_block.as_byte_array());
    engine.input(&coin_height.to_le_bytes());
    engine.input(prevout.txid.as_byte_array());
    engine.input(&prevout.vout.to_le_bytes());
    engine.input(&time.to_le_bytes());
    sha256d::Hash::from_engine(engine)
}

fn pos_params(params: &ConsensusParams) -> Option<&PosParams> {
    params.pos.as_ref()
}

/// Block shape of a proof of stake block: empty coinbase, coinstake second, masked timestamp.
pub struct CoinstakeStructureRule {
    params: Arc<ConsensusParams>,
}

impl CoinstakeStructureRule {
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        Self { params }
    }
}

impl ConsensusRule for CoinstakeStructureRule {
    fn name(&self) -> &'static str {
        "coinstake-structure"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let Some(pos) = pos_params(&self.params) else {
            return Ok(());
        };

        let time = ctx.header.header().time();
        if time & pos.stake_timestamp_mask != 0 {
            return Err(ConsensusErrors::BAD_STAKE_TIME.into());
        }

        let block = ctx.block(self.name())?;
        if !block.txdata.get(1).is_some_and(is_coinstake) {
            return Err(ConsensusErrors::COINSTAKE_MISSING.into());
        }

        let pays_out = block
            .coinbase()
            .is_some_and(|coinbase| coinbase.output.iter().any(|output| output.value.to_sat() > 0));
        if pays_out {
            return Err(ConsensusErrors::BAD_COINBASE_NOT_EMPTY.into());
        }

        Ok(())
    }
}

/// The staked coin must be mature and its kernel hash must meet the weighted target.
pub struct StakeKernelRule {
    params: Arc<ConsensusParams>,
    coins: Arc<dyn CoinView>,
}

impl StakeKernelRule {
    pub fn new(params: Arc<ConsensusParams>, coins: Arc<dyn CoinView>) -> Self {
        Self { params, coins }
    }
}

impl ConsensusRule for StakeKernelRule {
    fn name(&self) -> &'static str {
        "stake-kernel"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let Some(pos) = pos_params(&self.params) else {
            return Ok(());
        };
        let Some(prev) = ctx.prev() else {
            return Ok(());
        };

        let header = &ctx.header.header().header;
        let target = header.target();
        if target > pos.pos_limit {
            return Err(ConsensusErrors::BAD_DIFFICULTY_BITS.into());
        }

        let block = ctx.block(self.name())?;
        let coinstake = block
            .txdata
            .get(1)
            .filter(|tx| is_coinstake(tx))
            .ok_or(ConsensusErrors::COINSTAKE_MISSING)?;
        let prevout = coinstake.input[0].previous_output;

        let coin = self
            .coins
            .get_coin(&prevout)?
            .ok_or(ConsensusErrors::BAD_TX_MISSING_INPUTS)?;

        let height = ctx.header.height();
        if coin.confirmations(height) < pos.stake_min_confirmations {
            return Err(ConsensusErrors::STAKE_PREVOUT_NOT_MATURE.into());
        }

        let kernel = stake_kernel_hash(prev.hash(), coin.height, &prevout, header.time);
        let weighted_target = to_biguint(&target) * BigUint::from(coin.amount);

        if BigUint::from_bytes_le(kernel.as_byte_array()) > weighted_target {
            tracing::debug!(
                height,
                %prevout,
                amount = coin.amount,
                "Stake kernel does not meet the target"
            );
            return Err(ConsensusErrors::STAKE_HASH_INVALID_TARGET.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployments::DeploymentFlags;
    use crate::errors::ConsensusError;
    use crate::test_utils::*;
    use bitcoin::CompactTarget;
    use sidecoin_primitives::{ConsensusFamily, Network};

    fn params() -> Arc<ConsensusParams> {
        Arc::new(ConsensusParams::new(Network::Regtest).with_family(ConsensusFamily::Pos))
    }

    fn coinstake(prevout: OutPoint, value: u64) -> bitcoin::Transaction {
        spend(
            &[prevout],
            vec![output(0, bitcoin::ScriptBuf::new()), output(value, p2pkh(3))],
        )
    }

    fn check(rule: &dyn ConsensusRule, ctx: &mut RuleContext) -> Option<ConsensusError> {
        rule.check(ctx).err().and_then(|err| err.consensus_error())
    }

    fn pos_context(
        prev: &Arc<sidecoin_primitives::ChainedHeader>,
        time: u32,
        txdata: Vec<bitcoin::Transaction>,
        bits: u32,
    ) -> RuleContext {
        let (header, block) = block_on(Some(prev), time, txdata);
        let mut raw = header.header().clone();
        raw.header.bits = CompactTarget::from_consensus(bits);
        let header = sidecoin_primitives::ChainedHeader::new(raw, prev.clone());
        RuleContext::new(header, Some(block), DeploymentFlags::default(), time)
    }

    #[test]
    fn structure_rules() {
        let params = params();
        let rule = CoinstakeStructureRule::new(params.clone());
        let chain = chain(2, 1_600_000, 64);
        let tip = chain.last().unwrap();
        let stake = OutPoint::new(bitcoin::Txid::from_byte_array([5; 32]), 0);

        let empty_coinbase = coinbase(3, vec![output(0, bitcoin::ScriptBuf::new())]);
        let aligned = 1_600_000 + 3 * 64;

        let mut ctx = pos_context(tip, aligned, vec![empty_coinbase.clone(), coinstake(stake, 10)], REGTEST_BITS);
        assert_eq!(check(&rule, &mut ctx), None);

        let mut ctx = pos_context(tip, aligned + 1, vec![empty_coinbase.clone(), coinstake(stake, 10)], REGTEST_BITS);
        assert_eq!(check(&rule, &mut ctx), Some(ConsensusErrors::BAD_STAKE_TIME));

        let mut ctx = pos_context(tip, aligned, vec![empty_coinbase], REGTEST_BITS);
        assert_eq!(check(&rule, &mut ctx), Some(ConsensusErrors::COINSTAKE_MISSING));

        let paying = coinbase(3, vec![output(1, p2pkh(1))]);
        let mut ctx = pos_context(tip, aligned, vec![paying, coinstake(stake, 10)], REGTEST_BITS);
        assert_eq!(check(&rule, &mut ctx), Some(ConsensusErrors::BAD_COINBASE_NOT_EMPTY));
    }

    #[test]
    fn kernel_rules() {
        let params = params();
        let min_confirmations = params.pos.as_ref().unwrap().stake_min_confirmations;
        let funding = coinbase(0, vec![output(1_000, p2pkh(9))]);
        let stake = OutPoint::new(funding.compute_txid(), 0);
        let coins = funded_view(std::slice::from_ref(&funding), 0);
        let rule = StakeKernelRule::new(params.clone(), coins);

        let chain = chain(min_confirmations, 1_600_000, 64);
        let tip = chain.last().unwrap();
        let time = 1_600_000 + (min_confirmations + 1) * 64;
        let txdata = || vec![coinbase(min_confirmations + 1, vec![output(0, bitcoin::ScriptBuf::new())]), coinstake(stake, 1_000)];

        // The regtest limit weighted by the coin value exceeds any hash.
        let mut ctx = pos_context(tip, time, txdata(), REGTEST_BITS);
        assert_eq!(check(&rule, &mut ctx), None);

        // Target of one.
        let mut ctx = pos_context(tip, time, txdata(), 0x03000001);
        assert_eq!(check(&rule, &mut ctx), Some(ConsensusErrors::STAKE_HASH_INVALID_TARGET));

        let young = &chain[(min_confirmations - 2) as usize];
        let mut ctx = pos_context(young, time, txdata(), REGTEST_BITS);
        assert_eq!(check(&rule, &mut ctx), Some(ConsensusErrors::STAKE_PREVOUT_NOT_MATURE));

        let unknown = OutPoint::new(bitcoin::Txid::from_byte_array([6; 32]), 0);
        let mut ctx = pos_context(
            tip,
            time,
            vec![coinbase(1, vec![output(0, bitcoin::ScriptBuf::new())]), coinstake(unknown, 1)],
            REGTEST_BITS,
        );
        assert_eq!(check(&rule, &mut ctx), Some(ConsensusErrors::BAD_TX_MISSING_INPUTS));
    }

    #[test]
    fn kernel_hash_commits_to_every_field() {
        let prevout = OutPoint::new(bitcoin::Txid::from_byte_array([1; 32]), 0);
        let base = stake_kernel_hash(BlockHash::all_zeros(), 1, &prevout, 64);
        assert_ne!(base, stake_kernel_hash(BlockHash::all_zeros(), 2, &prevout, 64));
        assert_ne!(base, stake_kernel_hash(BlockHash::all_zeros(), 1, &prevout, 128));
        assert_ne!(
            base,
            stake_kernel_hash(BlockHash::all_zeros(), 1, &OutPoint { vout: 1, ..prevout }, 64)
        );
    }
}
