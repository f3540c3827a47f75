use super::{ConsensusRule, RuleEngineError};
use crate::context::RuleContext;
use crate::errors::ConsensusErrors;
use bitcoin::Target;
use num_bigint::BigUint;
use sidecoin_primitives::{ChainedHeader, ConsensusParams, PowParams};
use std::sync::Arc;

pub(crate) fn to_biguint(target: &Target) -> BigUint {
    BigUint::from_bytes_le(&target.to_le_bytes())
}

/// `value` must fit into 256 bits.
pub(crate) fn from_biguint(value: &BigUint) -> Target {
    let bytes = value.to_bytes_le();
    let mut le = [0u8; 32];
    let len = bytes.len().min(32);
    le[..len].copy_from_slice(&bytes[..len]);
    Target::from_le_bytes(le)
}

/// Usually, it's just the target of last block. However, if we are in a retarget period,
/// it will be calculated from the last `difficulty_adjustment_interval` blocks.
///
/// https://github.com/bitcoin/bitcoin/blob/89b910711c004c21b7d67baa888073742f7f94f0/src/pow.cpp#L13
pub fn get_next_work_required(
    last_block: &Arc<ChainedHeader>,
    params: &ConsensusParams,
    pow: &PowParams,
) -> Target {
    let last_target = last_block.header().header.target();

    if pow.no_pow_retargeting {
        return last_target;
    }

    let height = last_block.height() + 1;
    let difficulty_adjustment_interval = params.difficulty_adjustment_interval();

    // Only change once per difficulty adjustment interval.
    if height % difficulty_adjustment_interval != 0 {
        return last_target;
    }

    let first_block = last_block
        .get_ancestor(height - difficulty_adjustment_interval)
        .expect("Retarget block is an ancestor of the last block; qed");

    calculate_next_work_required(
        last_target,
        first_block.header().time().into(),
        last_block.header().time().into(),
        pow,
    )
}

// https://github.com/bitcoin/bitcoin/blob/89b910711c004c21b7d67baa888073742f7f94f0/src/pow.cpp#L49-L72
pub fn calculate_next_work_required(
    previous_target: Target,
    first_block_time: u64,
    last_block_time: u64,
    pow: &PowParams,
) -> Target {
    let mut actual_timespan = last_block_time.saturating_sub(first_block_time);

    let pow_target_timespan = pow.pow_target_timespan;

    // Limit adjustment step.
    if actual_timespan < pow_target_timespan / 4 {
        actual_timespan = pow_target_timespan / 4;
    }

    if actual_timespan > pow_target_timespan * 4 {
        actual_timespan = pow_target_timespan * 4;
    }

    // Retarget.
    let target = to_biguint(&previous_target) * actual_timespan / pow_target_timespan;

    if target > to_biguint(&pow.pow_limit) {
        pow.pow_limit
    } else {
        from_biguint(&target)
    }
}

/// Difficulty bits must follow the retarget schedule and the block hash must meet them.
pub struct PowDifficultyRule {
    params: Arc<ConsensusParams>,
}

impl PowDifficultyRule {
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        Self { params }
    }
}

impl ConsensusRule for PowDifficultyRule {
    fn name(&self) -> &'static str {
        "pow-difficulty"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let Some(pow) = self.params.pow.as_ref() else {
            return Ok(());
        };
        let Some(prev) = ctx.prev() else {
            return Ok(());
        };

        let header = &ctx.header.header().header;
        let expected = get_next_work_required(prev, &self.params, pow).to_compact_lossy();

        if header.bits != expected {
            tracing::debug!(
                got = header.bits.to_consensus(),
                expected = expected.to_consensus(),
                "Unexpected difficulty bits"
            );
            return Err(ConsensusErrors::BAD_DIFFICULTY_BITS.into());
        }

        if !header.target().is_met_by(ctx.header.hash()) {
            return Err(ConsensusErrors::HIGH_HASH.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployments::DeploymentFlags;
    use crate::test_utils::*;
    use bitcoin::CompactTarget;
    use bitcoin::block::Header;
    use bitcoin::consensus::encode::deserialize_hex;
    use sidecoin_primitives::{ConsensusFamily, Network};

    fn mainnet_pow() -> PowParams {
        PowParams {
            pow_limit: Target::MAX_ATTAINABLE_MAINNET,
            pow_target_timespan: 14 * 24 * 60 * 60,
            no_pow_retargeting: false,
        }
    }

    #[test]
    fn test_calculate_next_work_required() {
        // block_354816
        let block_354816: Header = deserialize_hex
            ("020000003f99814a36d2a2043b1d4bf61a410f71828eca1decbf56000000000000000000b3762ed278ac44bb953e24262cfeb952d0abe6d3b7f8b74fd24e009b96b6cb965d674655dd1317186436e79d").unwrap();

        let expected_target = block_354816.target();

        // block_352800, first block in this period.
        let first_block: Header = deserialize_hex("0200000074c51c1cc53aaf478c643bb612da6bd17b268cd9bdccc4000000000000000000ccc0a2618a1f973dfac37827435b463abd18cbfd0f280a90432d3d78497a36cc02f33355f0171718b72a1dc7").unwrap();

        // block_354815, last block in this period.
        let last_block: Header = deserialize_hex("030000004c9c1b59250f30b8d360886a5433501120b056a000bdc0160000000000000000caca1bf0c55a5ba2299f9e60d10c01c679bb266c7df815ff776a1b97fd3a199ac1644655f01717182707bd59").unwrap();

        let new_target = calculate_next_work_required(
            last_block.target(),
            first_block.time as u64,
            last_block.time as u64,
            &mainnet_pow(),
        );

        assert_eq!(
            new_target.to_compact_lossy().to_consensus(),
            expected_target.to_compact_lossy().to_consensus(),
            "Difficulty bits must match"
        );
    }

    #[test]
    fn adjustment_step_is_clamped() {
        let pow = mainnet_pow();
        let previous = Target::from_compact(CompactTarget::from_consensus(0x1d00ffff));

        let fast = calculate_next_work_required(previous, 1_000, 1_000, &pow);
        assert_eq!(fast.to_compact_lossy().to_consensus(), 0x1c3fffc0);

        let slow = calculate_next_work_required(previous, 0, u32::MAX.into(), &pow);
        assert_eq!(slow, pow.pow_limit);
    }

    #[test]
    fn regtest_keeps_previous_bits() {
        let params = Arc::new(ConsensusParams::new(Network::Regtest).with_family(ConsensusFamily::Pow));
        let rule = PowDifficultyRule::new(params.clone());
        let chain = chain(3, 1_000_000, 600);
        let tip = chain.last().unwrap();
        assert_eq!(
            get_next_work_required(tip, &params, params.pow.as_ref().unwrap()).to_compact_lossy(),
            tip.header().header.bits
        );

        let mut header = tip.header().clone();
        header.header.prev_blockhash = tip.hash();
        header.header.bits = CompactTarget::from_consensus(0x1d00ffff);
        let mut ctx = RuleContext::new(
            ChainedHeader::new(header.clone(), tip.clone()),
            None,
            DeploymentFlags::default(),
            2_000_000,
        );
        let err = rule.check(&mut ctx).unwrap_err().consensus_error();
        assert_eq!(err, Some(ConsensusErrors::BAD_DIFFICULTY_BITS));

        // Grind nonces until one meets the regtest target and one does not.
        header.header.bits = CompactTarget::from_consensus(REGTEST_BITS);
        let mut outcomes = (0..64u32).map(|nonce| {
            header.header.nonce = nonce;
            let mut ctx = RuleContext::new(
                ChainedHeader::new(header.clone(), tip.clone()),
                None,
                DeploymentFlags::default(),
                2_000_000,
            );
            rule.check(&mut ctx).err().and_then(|err| err.consensus_error())
        });
        assert!(outcomes.any(|outcome| outcome.is_none()));

        let mut outcomes = (0..64u32).map(|nonce| {
            header.header.nonce = nonce;
            let mut ctx = RuleContext::new(
                ChainedHeader::new(header.clone(), tip.clone()),
                None,
                DeploymentFlags::default(),
                2_000_000,
            );
            rule.check(&mut ctx).err().and_then(|err| err.consensus_error())
        });
        assert!(outcomes.any(|outcome| outcome == Some(ConsensusErrors::HIGH_HASH)));
    }
}
