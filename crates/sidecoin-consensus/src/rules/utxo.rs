use super::contracts::{contract_tx_data, failed_execution_value};
use super::{ConsensusRule, RuleEngineError};
use crate::context::RuleContext;
use crate::errors::ConsensusErrors;
use bitcoin::{OutPoint, Transaction};
use sidecoin_coinview::{CoinView, CoinViewCache};
use sidecoin_primitives::{ConsensusFamily, ConsensusParams, is_coinstake};
use std::sync::Arc;

/// Applies the block to a cached coin view.
///
/// Every input must spend a mature unspent coin, no transaction may create value and the block
/// rewards must stay within the subsidy and the collected fees. The resulting changes are left in
/// [`RuleContext::coin_changes`] for the caller to commit.
pub struct UtxoConnectRule {
    params: Arc<ConsensusParams>,
    coins: Arc<dyn CoinView>,
}

impl UtxoConnectRule {
    pub fn new(params: Arc<ConsensusParams>, coins: Arc<dyn CoinView>) -> Self {
        Self { params, coins }
    }
}

fn value_out(tx: &Transaction) -> u64 {
    tx.output
        .iter()
        .fold(0u64, |total, output| total.saturating_add(output.value.to_sat()))
}

impl ConsensusRule for UtxoConnectRule {
    fn name(&self) -> &'static str {
        "utxo-connect"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let height = ctx.height();
        let block = ctx.block(self.name())?.clone();

        let mut cache = CoinViewCache::new(&*self.coins)?;

        let prevouts = block
            .txdata
            .iter()
            .filter(|tx| !tx.is_coinbase())
            .flat_map(|tx| tx.input.iter().map(|input| input.previous_output))
            .collect::<Vec<OutPoint>>();
        cache.prefetch(&prevouts)?;

        let mut fees = 0u64;
        let mut coinstake_value = None;

        for tx in &block.txdata {
            let txid = tx.compute_txid();
            let coinstake = is_coinstake(tx);

            if !tx.is_coinbase() {
                for input in &tx.input {
                    let Some(coin) = cache.access_coin(&input.previous_output)? else {
                        tracing::debug!(%txid, prevout = %input.previous_output, "Missing input");
                        return Err(ConsensusErrors::BAD_TX_MISSING_INPUTS.into());
                    };

                    if coin.is_reward() && coin.confirmations(height) < self.params.coinbase_maturity {
                        return Err(ConsensusErrors::BAD_TX_PREMATURE_SPEND.into());
                    }
                }

                let value_in = cache.value_in(tx)?;
                let value_out = value_out(tx);

                if coinstake {
                    coinstake_value = Some((value_in, value_out));
                } else {
                    if value_in < value_out {
                        return Err(ConsensusErrors::BAD_TX_IN_BELOW_OUT.into());
                    }

                    let fee = value_in - value_out;
                    if let Some(data) = contract_tx_data(tx)? {
                        if fee < data.gas_cost() {
                            return Err(ConsensusErrors::FEE_TOO_SMALL_FOR_GAS.into());
                        }
                    }

                    fees = fees.saturating_add(fee);
                }

                cache.spend_inputs(tx)?;
            }

            cache.add_outputs(tx, txid, height, coinstake);
        }

        let (failed_value, refunded) = ctx
            .contract_execution
            .as_ref()
            .map(|execution| {
                let refunded = execution
                    .refunds
                    .iter()
                    .fold(0u64, |total, (_, amount)| total.saturating_add(*amount));
                (failed_execution_value(&block, execution), refunded)
            })
            .unwrap_or_default();

        let coinbase_out = block.coinbase().map(value_out).unwrap_or_default();

        match self.params.family {
            ConsensusFamily::Pos => {
                // The coinbase only carries the refunds, their gas part is taken out of the fees
                // collected by the coinstake.
                if coinbase_out > refunded {
                    return Err(ConsensusErrors::BAD_COINBASE_AMOUNT.into());
                }

                let stake_reward = self.params.pos.as_ref().map_or(0, |pos| pos.stake_reward);
                let (stake_in, stake_out) =
                    coinstake_value.ok_or(ConsensusErrors::COINSTAKE_MISSING)?;
                let gas_refunds = refunded.saturating_sub(failed_value);
                let allowed = stake_in
                    .saturating_add(stake_reward)
                    .saturating_add(fees.saturating_sub(gas_refunds));
                if stake_out > allowed {
                    tracing::debug!(height, stake_out, allowed, "Coinstake pays too much");
                    return Err(ConsensusErrors::BAD_COINSTAKE_AMOUNT.into());
                }
            }
            ConsensusFamily::Pow | ConsensusFamily::Poa => {
                let allowed = self
                    .params
                    .subsidy(height)
                    .saturating_add(fees)
                    .saturating_add(failed_value);
                if coinbase_out > allowed {
                    tracing::debug!(height, coinbase_out, allowed, "Coinbase pays too much");
                    return Err(ConsensusErrors::BAD_COINBASE_AMOUNT.into());
                }
            }
        }

        ctx.coin_changes = Some(cache.into_changes(ctx.header.hash(), height));

        Ok(())
    }
}
