//! Proof of authority rules: slot timing, header signatures and collateral commitments.

use super::{ConsensusRule, RuleEngineError};
use crate::context::RuleContext;
use crate::errors::ConsensusErrors;
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{BlockHash, PublicKey};
use parking_lot::RwLock;
use sidecoin_primitives::{ConsensusParams, Height};
use sidecoin_script::{BlockSignature, FederationId, FederationResolver, decode_commitment_height};
use sidecoin_storage::BlockSource;
use std::sync::Arc;

/// Members allowed to produce blocks, in round robin order.
pub struct Federation {
    id: FederationId,
    members: RwLock<Vec<PublicKey>>,
}

impl Federation {
    pub fn new(id: FederationId, members: Vec<PublicKey>) -> Self {
        Self {
            id,
            members: RwLock::new(members),
        }
    }

    pub fn id(&self) -> FederationId {
        self.id
    }

    pub fn members(&self) -> Vec<PublicKey> {
        self.members.read().clone()
    }

    pub fn is_member(&self, key: &PublicKey) -> bool {
        self.members.read().contains(key)
    }

    /// Returns `false` if `key` already is a member.
    pub fn add_member(&self, key: PublicKey) -> bool {
        let mut members = self.members.write();
        if members.contains(&key) {
            return false;
        }
        members.push(key);
        tracing::info!(member = %key, count = members.len(), "Federation member added");
        true
    }

    /// Returns `false` if `key` is not a member.
    pub fn remove_member(&self, key: &PublicKey) -> bool {
        let mut members = self.members.write();
        let Some(index) = members.iter().position(|member| member == key) else {
            return false;
        };
        members.remove(index);
        tracing::info!(member = %key, count = members.len(), "Federation member removed");
        true
    }

    /// Signatures needed to spend federation outputs, a strict majority.
    pub fn required_signatures(&self) -> usize {
        self.members.read().len() / 2 + 1
    }

    /// Member whose slot contains `time`.
    pub fn miner_for_timestamp(&self, time: u32, target_spacing: u32) -> Option<PublicKey> {
        let members = self.members.read();
        if members.is_empty() || target_spacing == 0 {
            return None;
        }
        let slot = (time / target_spacing) as usize;
        Some(members[slot % members.len()])
    }
}

impl FederationResolver for Federation {
    fn resolve(&self, id: &FederationId) -> Option<(usize, Vec<PublicKey>)> {
        (*id == self.id).then(|| (self.required_signatures(), self.members()))
    }
}

/// Block timestamps sit on slot boundaries and strictly increase.
pub struct PoaSlotTimingRule {
    params: Arc<ConsensusParams>,
}

impl PoaSlotTimingRule {
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        Self { params }
    }
}

impl ConsensusRule for PoaSlotTimingRule {
    fn name(&self) -> &'static str {
        "poa-slot-timing"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let time = ctx.header.header().time();

        if time % self.params.target_spacing != 0 {
            return Err(ConsensusErrors::INVALID_HEADER_TIMESTAMP.into());
        }

        if let Some(prev) = ctx.prev() {
            if time <= prev.header().time() {
                return Err(ConsensusErrors::BLOCK_TIMESTAMP_TOO_EARLY.into());
            }
        }

        Ok(())
    }
}

/// The header must be signed by the federation member owning the block's slot.
pub struct PoaHeaderSignatureRule {
    params: Arc<ConsensusParams>,
    federation: Arc<Federation>,
    secp: Secp256k1<VerifyOnly>,
}

impl PoaHeaderSignatureRule {
    pub fn new(params: Arc<ConsensusParams>, federation: Arc<Federation>) -> Self {
        Self {
            params,
            federation,
            secp: Secp256k1::verification_only(),
        }
    }
}

impl ConsensusRule for PoaHeaderSignatureRule {
    fn name(&self) -> &'static str {
        "poa-header-signature"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        if ctx.prev().is_none() {
            return Ok(());
        }

        let header = ctx.header.header();
        let signature = header
            .signature
            .as_deref()
            .and_then(BlockSignature::from_bytes)
            .ok_or(ConsensusErrors::INVALID_HEADER_SIGNATURE)?;

        let members = self.federation.members();
        let hash = ctx.header.hash();
        let signer = signature
            .find_signer(&self.secp, &hash, &members)
            .ok_or(ConsensusErrors::INVALID_HEADER_SIGNATURE)?;

        let expected = self
            .federation
            .miner_for_timestamp(header.time(), self.params.target_spacing);
        if expected.as_ref() != Some(signer) {
            tracing::debug!(
                %hash,
                %signer,
                expected = ?expected.map(|key| key.to_string()),
                "Block signed outside the signer's slot"
            );
            return Err(ConsensusErrors::WRONG_BLOCK_PRODUCER.into());
        }

        Ok(())
    }
}

/// Source of the counter chain tip the collateral commitments refer to.
pub trait CounterChainTip: Send + Sync {
    /// Height of the counter chain tip, `None` while unknown.
    fn tip_height(&self) -> Option<Height>;
}

/// The coinbase must commit to a counter chain height that never decreases and is not ahead of
/// the counter chain.
///
/// The previous commitment is read back from the stored parent block, so the rule keeps no state
/// of its own.
pub struct CollateralCommitmentRule {
    params: Arc<ConsensusParams>,
    counter_chain: Arc<dyn CounterChainTip>,
    blocks: Arc<dyn BlockSource>,
}

impl CollateralCommitmentRule {
    pub fn new(
        params: Arc<ConsensusParams>,
        counter_chain: Arc<dyn CounterChainTip>,
        blocks: Arc<dyn BlockSource>,
    ) -> Self {
        Self {
            params,
            counter_chain,
            blocks,
        }
    }

    /// Counter chain height committed to by the stored block `block_hash`.
    pub fn commitment_of(&self, block_hash: &BlockHash) -> Result<Option<Height>, sidecoin_storage::Error> {
        Ok(self
            .blocks
            .block(block_hash)?
            .and_then(|block| block.coinbase().and_then(|coinbase| decode_commitment_height(coinbase).0)))
    }
}

impl ConsensusRule for CollateralCommitmentRule {
    fn name(&self) -> &'static str {
        "collateral-commitment"
    }

    fn check(&self, ctx: &mut RuleContext) -> Result<(), RuleEngineError> {
        let Some(collateral) = self.params.poa.as_ref().and_then(|poa| poa.collateral.as_ref())
        else {
            return Ok(());
        };

        if ctx.height() < collateral.activation_height {
            return Ok(());
        }

        let block = ctx.block(self.name())?;
        let (committed, magic) = block
            .coinbase()
            .map(decode_commitment_height)
            .unwrap_or((None, None));

        let committed = committed.ok_or(ConsensusErrors::COMMITMENT_HEIGHT_MISSING)?;

        if magic != Some(collateral.counter_chain_magic) {
            return Err(ConsensusErrors::COMMITMENT_INVALID_MAGIC.into());
        }

        if let Some(prev) = ctx.prev() {
            if let Some(previous) = self.commitment_of(&prev.hash())? {
                if committed < previous {
                    tracing::debug!(committed, previous, "Commitment height decreased");
                    return Err(ConsensusErrors::COMMITMENT_HEIGHT_TOO_LOW.into());
                }
            }
        }

        if let Some(tip) = self.counter_chain.tip_height() {
            if committed > tip {
                tracing::debug!(committed, tip, "Commitment ahead of the counter chain");
                return Err(ConsensusErrors::COMMITMENT_HEIGHT_TOO_HIGH.into());
            }
        }

        Ok(())
    }
}
