//! Rules shared by every consensus family.

use super::{ConsensusRule, RuleEngineError};
use crate::context::RuleContext;
use crate::deployments::LockTimeFlags;
use crate::errors::{ConsensusError, ConsensusErrors};
use bitcoin::absolute::{LOCK_TIME_THRESHOLD, LockTime};
use bitcoin::{Amount, Transaction, Weight};
use sidecoin_primitives::{ConsensusParams, Height, is_coinstake};
use std::collections::HashSet;
use std::sync::Arc;

// MinCoinbaseScriptLen is the minimum length a coinbase script can be.
const MIN_COINBASE_SCRIPT_LEN: usize = 2;

// MaxCoinbaseScriptLen is the maximum length a coinbase script can be.
const MAX_COINBASE_SCRIPT_LEN: usize = 100;

/// Whether `tx` is final at `height`, lock-times by time being compared to `block_time`.
pub fn is_final(tx: &Transaction, height: Height, block_time: u32) -> bool {
    if tx.lock_time == LockTime::ZERO {
        return true;
    }

    let lock_time = if tx.lock_time.to_consensus_u32() < LOCK_TIME_THRESHOLD {
        height
    } else {
        block_time
    };

    if tx.lock_time.to_consensus_u32() < lock_time {
        return true;
    }

    tx.input.iter().all(|txin| txin.sequence.is_final())
}

/// Context free transaction checks.
pub fn check_transaction_sanity(tx: &Transaction) -> Result<(), ConsensusError> {
    if tx.input.is_empty() {
        return Err(ConsensusErrors::BAD_TX_NO_INPUTS);
    }

    if tx.output.is_empty() {
        return Err(ConsensusErrors::BAD_TX_NO_OUTPUTS);
    }

    if tx.weight() > Weight::MAX_BLOCK {
        return Err(ConsensusErrors::BAD_TX_OVERSIZE);
    }

    let mut seen_inputs = HashSet::with_capacity(tx.input.len());
    if !tx.input.iter().all(|txin| seen_inputs.insert(txin.previous_output)) {
        return Err(ConsensusErrors::BAD_TX_DUPLICATE_INPUTS);
    }

    let mut total_output_value = Amount::ZERO;
    for txout in &tx.output {
        if txout.value > Amount::MAX_MONEY {
            return Err(ConsensusErrors::BAD_TX_OUTPUT_TOO_LARGE);
        }

        total_output_value += txout.value;

        if total_output_value > Amount::MAX_MONEY {
            return Err(ConsensusErrors::BAD_TX_TOTAL_OUTPUT_TOO_LARGE);
        }
    }

    if tx.is_coinbase() {
        let script_sig_len = tx.input[0].script_sig.len();

        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&script_sig_len) {
            return Err(ConsensusErrors::BAD_COINBASE_LENGTH);
        }
    } else if tx.input.iter().any(|txin| txin.previous_output.is_null()) {
        return Err(ConsensusErrors::BAD_TX_NULL_PREVOUT);
    }

    Ok(())
}

/// Rejects timestamps too far in the future or not after the median time past.
pub struct HeaderTimeRule {
    params: Arc<ConsensusParams>,
}

impl HeaderTimeRule {
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        Self { params }
    }
}

impl ConsensusRule for HeaderTimeRule {
    fn name(&self) -> &'static str {
        "header-time"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let time = ctx.header.header().time();

        if time > ctx.adjusted_time.saturating_add(self.params.max_future_drift) {
            return Err(ConsensusErrors::TIME_TOO_NEW.into());
        }

        if let Some(prev) = ctx.prev() {
            if time <= prev.median_time_past() {
                return Err(ConsensusErrors::TIME_TOO_OLD.into());
            }
        }

        Ok(())
    }
}

/// Structure of the block body: coinbase placement, duplicates, merkle root and the sanity of
/// every transaction.
pub struct BlockIntegrityRule;

impl ConsensusRule for BlockIntegrityRule {
    fn name(&self) -> &'static str {
        "block-integrity"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let block = ctx.block(self.name())?;

        if block.txdata.is_empty() {
            return Err(ConsensusErrors::BAD_BLOCK_EMPTY.into());
        }

        if !block.txdata[0].is_coinbase() {
            return Err(ConsensusErrors::BAD_COINBASE_MISSING.into());
        }

        if block.txdata.iter().skip(1).any(|tx| tx.is_coinbase()) {
            return Err(ConsensusErrors::BAD_MULTIPLE_COINBASE.into());
        }

        if block.txdata.iter().skip(2).any(is_coinstake) {
            return Err(ConsensusErrors::BAD_MULTIPLE_COINSTAKE.into());
        }

        let mut seen_transactions = HashSet::with_capacity(block.txdata.len());
        let mut txids = Vec::with_capacity(block.txdata.len());
        for tx in &block.txdata {
            let txid = tx.compute_txid();
            if !seen_transactions.insert(txid) {
                return Err(ConsensusErrors::BAD_TX_DUPLICATE.into());
            }

            check_transaction_sanity(tx)?;

            txids.push(txid);
        }

        // Inline `compute_merkle_root()` to avoid redundantly computing txid.
        let merkle_root = bitcoin::merkle_tree::calculate_root(
            txids.iter().map(|txid| txid.to_raw_hash()),
        )
        .map(bitcoin::TxMerkleNode::from);

        if merkle_root != Some(block.header.header.merkle_root) {
            return Err(ConsensusErrors::BAD_MERKLE_ROOT.into());
        }

        Ok(())
    }
}

/// Every transaction must be final at the block height.
pub struct TransactionFinalityRule;

impl ConsensusRule for TransactionFinalityRule {
    fn name(&self) -> &'static str {
        "transaction-finality"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let lock_time_cutoff = match ctx.prev() {
            Some(prev)
                if ctx
                    .flags
                    .lock_time_flags
                    .contains(LockTimeFlags::MEDIAN_TIME_PAST) =>
            {
                prev.median_time_past()
            }
            _ => ctx.header.header().time(),
        };
        let height = ctx.height();

        let block = ctx.block(self.name())?;
        if let Some(index) = block
            .txdata
            .iter()
            .position(|tx| !is_final(tx, height, lock_time_cutoff))
        {
            tracing::debug!(height, index, lock_time_cutoff, "Non-final transaction in block");
            return Err(ConsensusErrors::BAD_TX_NON_FINAL.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployments::DeploymentFlags;
    use crate::test_utils::*;
    use bitcoin::{OutPoint, Sequence, Txid};
    use bitcoin::hashes::Hash;
    use sidecoin_primitives::Network;

    fn run(rule: &dyn ConsensusRule, ctx: &mut RuleContext) -> Option<ConsensusError> {
        rule.check(ctx).err().and_then(|err| err.consensus_error())
    }

    fn context_for(block_txs: Vec<Transaction>) -> RuleContext {
        let genesis = chain(0, 1_000_000, 16).remove(0);
        let (header, block) = block_on(Some(&genesis), 1_000_016, block_txs);
        RuleContext::new(header, Some(block), DeploymentFlags::default(), 1_000_016)
    }

    #[test]
    fn header_time_bounds() {
        let params = Arc::new(ConsensusParams::new(Network::Regtest));
        let rule = HeaderTimeRule::new(params.clone());
        let chain = chain(12, 1_000_000, 16);
        let tip = chain.last().unwrap();

        let (header, _) = block_on(Some(tip), tip.median_time_past(), Vec::new());
        let mut ctx = RuleContext::new(header, None, DeploymentFlags::default(), 2_000_000);
        assert_eq!(run(&rule, &mut ctx), Some(ConsensusErrors::TIME_TOO_OLD));

        let (header, _) = block_on(Some(tip), tip.median_time_past() + 1, Vec::new());
        let mut ctx = RuleContext::new(header, None, DeploymentFlags::default(), 2_000_000);
        assert_eq!(run(&rule, &mut ctx), None);

        let now = 1_000_500;
        let (header, _) = block_on(Some(tip), now + params.max_future_drift + 1, Vec::new());
        let mut ctx = RuleContext::new(header, None, DeploymentFlags::default(), now);
        assert_eq!(run(&rule, &mut ctx), Some(ConsensusErrors::TIME_TOO_NEW));
    }

    #[test]
    fn integrity_accepts_well_formed_block() {
        let cb = coinbase(1, vec![output(50, p2pkh(1))]);
        let tx = spend(
            &[OutPoint::new(Txid::from_byte_array([7; 32]), 0)],
            vec![output(10, p2pkh(2))],
        );
        let mut ctx = context_for(vec![cb, tx]);
        assert_eq!(run(&BlockIntegrityRule, &mut ctx), None);
    }

    #[test]
    fn integrity_failures() {
        let cb = coinbase(1, vec![output(50, p2pkh(1))]);
        let prevout = OutPoint::new(Txid::from_byte_array([7; 32]), 0);
        let tx = spend(&[prevout], vec![output(10, p2pkh(2))]);

        let cases = [
            (vec![], ConsensusErrors::BAD_BLOCK_EMPTY),
            (vec![tx.clone()], ConsensusErrors::BAD_COINBASE_MISSING),
            (vec![cb.clone(), coinbase(2, vec![output(1, p2pkh(1))])], ConsensusErrors::BAD_MULTIPLE_COINBASE),
            (vec![cb.clone(), tx.clone(), tx.clone()], ConsensusErrors::BAD_TX_DUPLICATE),
            (vec![cb.clone(), spend(&[prevout, prevout], vec![output(1, p2pkh(2))])], ConsensusErrors::BAD_TX_DUPLICATE_INPUTS),
            (vec![cb.clone(), spend(&[OutPoint::null()], vec![output(1, p2pkh(2))])], ConsensusErrors::BAD_TX_NULL_PREVOUT),
            (vec![cb.clone(), spend(&[prevout], vec![])], ConsensusErrors::BAD_TX_NO_OUTPUTS),
            (vec![cb.clone(), spend(&[prevout], vec![output(Amount::MAX_MONEY.to_sat() + 1, p2pkh(2))])], ConsensusErrors::BAD_TX_OUTPUT_TOO_LARGE),
        ];

        for (txdata, expected) in cases {
            let mut ctx = context_for(txdata);
            assert_eq!(run(&BlockIntegrityRule, &mut ctx), Some(expected));
        }
    }

    #[test]
    fn integrity_checks_merkle_root() {
        let mut ctx = context_for(vec![coinbase(1, vec![output(50, p2pkh(1))])]);
        let mut block = (**ctx.block.as_ref().unwrap()).clone();
        block.txdata.push(spend(
            &[OutPoint::new(Txid::from_byte_array([7; 32]), 0)],
            vec![output(10, p2pkh(2))],
        ));
        ctx.block = Some(Arc::new(block));
        assert_eq!(run(&BlockIntegrityRule, &mut ctx), Some(ConsensusErrors::BAD_MERKLE_ROOT));
    }

    #[test]
    fn coinbase_script_length_is_bounded() {
        let mut cb = coinbase(1, vec![output(50, p2pkh(1))]);
        cb.input[0].script_sig = bitcoin::ScriptBuf::from_bytes(vec![0x51]);
        assert_eq!(check_transaction_sanity(&cb), Err(ConsensusErrors::BAD_COINBASE_LENGTH));
        cb.input[0].script_sig = bitcoin::ScriptBuf::from_bytes(vec![0x51; 101]);
        assert_eq!(check_transaction_sanity(&cb), Err(ConsensusErrors::BAD_COINBASE_LENGTH));
    }

    #[test]
    fn finality_uses_height_and_time_cutoffs() {
        let prevout = OutPoint::new(Txid::from_byte_array([7; 32]), 0);
        let mut tx = spend(&[prevout], vec![output(10, p2pkh(2))]);
        tx.input[0].sequence = Sequence::ZERO;

        // Height 1 block: a lock-time of 1 is not final yet, 0 is.
        tx.lock_time = LockTime::from_consensus(1);
        assert!(!is_final(&tx, 1, 1_000_016));
        assert!(is_final(&tx, 2, 1_000_016));

        tx.lock_time = LockTime::from_consensus(600_000_000);
        assert!(!is_final(&tx, 1, 600_000_000));
        assert!(is_final(&tx, 1, 600_000_001));

        // Final sequences disable the lock-time.
        tx.input[0].sequence = Sequence::MAX;
        assert!(is_final(&tx, 1, 0));

        tx.input[0].sequence = Sequence::ZERO;
        tx.lock_time = LockTime::from_consensus(5);
        let mut ctx = context_for(vec![coinbase(1, vec![output(50, p2pkh(1))]), tx]);
        assert_eq!(run(&TransactionFinalityRule, &mut ctx), Some(ConsensusErrors::BAD_TX_NON_FINAL));
    }
}
