//! Network consensus parameters.

use crate::{COIN, Height};
use bitcoin::{PublicKey, Target};

/// Network the node participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Message start bytes of the network, also used as the commitment magic.
    pub fn magic(&self) -> u32 {
        match self {
            Self::Mainnet => 0x522357A0,
            Self::Testnet => 0x522357B0,
            Self::Regtest => 0x522357C0,
        }
    }
}

/// Consensus family the chain runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum ConsensusFamily {
    /// Proof-of-Work.
    Pow,
    /// Proof-of-Stake.
    Pos,
    /// Proof-of-Authority.
    Poa,
}

/// Version-bits soft fork deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bip9Deployment {
    /// Human readable deployment name.
    pub name: &'static str,
    /// Bit position in the block version.
    pub bit: u8,
    /// Median time past at which signalling starts, or one of the sentinels.
    pub start_time: i64,
    /// Median time past after which a deployment that did not lock in fails.
    pub timeout: i64,
    /// Signalling blocks required within a window, falls back to the network threshold.
    pub threshold: Option<u32>,
    /// Window length, falls back to the network confirmation window.
    pub window: Option<u32>,
    /// Earliest height at which a locked-in deployment may become active.
    pub min_activation_height: Height,
}

impl Bip9Deployment {
    /// The deployment is active from genesis.
    pub const ALWAYS_ACTIVE: i64 = -1;
    /// The deployment never activates.
    pub const NEVER_ACTIVE: i64 = -2;
    /// No timeout.
    pub const NO_TIMEOUT: i64 = i64::MAX;

    pub fn new(name: &'static str, bit: u8, start_time: i64, timeout: i64) -> Self {
        Self {
            name,
            bit,
            start_time,
            timeout,
            threshold: None,
            window: None,
            min_activation_height: 0,
        }
    }

    /// Deployment that is active on every block.
    pub fn always_active(name: &'static str, bit: u8) -> Self {
        Self::new(name, bit, Self::ALWAYS_ACTIVE, Self::NO_TIMEOUT)
    }
}

/// Parameters specific to Proof-of-Work chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PowParams {
    /// Easiest allowed target.
    pub pow_limit: Target,
    /// Expected time between two retargets, in seconds.
    pub pow_target_timespan: u64,
    /// Keeps the target of the previous block when set.
    pub no_pow_retargeting: bool,
}

/// Parameters specific to Proof-of-Stake chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PosParams {
    /// Easiest allowed stake target.
    pub pos_limit: Target,
    /// Confirmations a coin needs before it can stake.
    pub stake_min_confirmations: u32,
    /// Block timestamps of PoS blocks must be multiples of `mask + 1`.
    pub stake_timestamp_mask: u32,
    /// Reward of a coinstake, in satoshis.
    pub stake_reward: u64,
}

/// Collateral commitment settings of a counter-chain aware PoA network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollateralParams {
    /// Height from which blocks must carry a commitment.
    pub activation_height: Height,
    /// Magic of the counter chain the commitments refer to.
    pub counter_chain_magic: u32,
}

/// Parameters specific to Proof-of-Authority chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoaParams {
    /// Federation members at genesis.
    pub genesis_federation: Vec<PublicKey>,
    /// Collateral commitment rules, if the network is counter-chain aware.
    pub collateral: Option<CollateralParams>,
    /// Minimum collateral a joining member must hold on the counter chain.
    pub collateral_amount: u64,
}

/// Smart contract settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractParams {
    /// Hashes of contract code allowed to be deployed, empty allows everything.
    pub allowed_code_hashes: Vec<[u8; 32]>,
    /// Keys that must sign contract code before it can be deployed.
    pub code_signers: Vec<PublicKey>,
    /// Height from which contract code must be signed.
    pub signed_code_activation_height: Height,
    pub min_gas_price: u64,
    pub max_gas_price: u64,
    pub min_gas_limit: u64,
    pub max_gas_limit: u64,
    /// Upper bound of gas consumed by all contract transactions of a block.
    pub block_gas_limit: u64,
}

impl Default for ContractParams {
    fn default() -> Self {
        Self {
            allowed_code_hashes: Vec::new(),
            code_signers: Vec::new(),
            signed_code_activation_height: Height::MAX,
            min_gas_price: 1,
            max_gas_price: 10_000,
            min_gas_limit: 10_000,
            max_gas_limit: 250_000,
            block_gas_limit: 100_000_000,
        }
    }
}

/// Consensus parameters of a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusParams {
    pub network: Network,
    pub family: ConsensusFamily,
    /// Length of a BIP9 signalling window.
    pub miner_confirmation_window: u32,
    /// Signalling blocks per window needed to lock in a deployment.
    pub rule_change_activation_threshold: u32,
    /// Version-bits deployments, indexed by deployment id.
    pub deployments: Vec<Bip9Deployment>,
    /// Expected seconds between two blocks.
    pub target_spacing: u32,
    /// How far in the future, in seconds, a block timestamp may be.
    pub max_future_drift: u32,
    /// Blocks a coinbase or coinstake output must wait before it can be spent.
    pub coinbase_maturity: u32,
    /// Largest standard `OP_RETURN` output script, in bytes.
    pub max_op_return_relay: usize,
    /// Reward of a block before fees.
    pub block_subsidy: u64,
    /// Blocks between two subsidy halvings, `None` for a flat subsidy.
    pub subsidy_halving_interval: Option<u32>,
    pub pow: Option<PowParams>,
    pub pos: Option<PosParams>,
    pub poa: Option<PoaParams>,
    pub contracts: Option<ContractParams>,
}

impl ConsensusParams {
    /// Constructs the parameters of a federated, contract-enabled PoA sidechain.
    pub fn new(network: Network) -> Self {
        let (window, threshold, spacing) = match network {
            Network::Mainnet => (2016, 1916, 16),
            Network::Testnet => (2016, 1512, 16),
            Network::Regtest => (144, 108, 16),
        };

        Self {
            network,
            family: ConsensusFamily::Poa,
            miner_confirmation_window: window,
            rule_change_activation_threshold: threshold,
            deployments: Vec::new(),
            target_spacing: spacing,
            max_future_drift: 2 * 60 * 60,
            coinbase_maturity: match network {
                Network::Regtest => 10,
                _ => 50,
            },
            max_op_return_relay: 83,
            block_subsidy: 50 * COIN,
            subsidy_halving_interval: None,
            pow: None,
            pos: None,
            poa: Some(PoaParams {
                genesis_federation: Vec::new(),
                collateral: None,
                collateral_amount: 100_000 * COIN,
            }),
            contracts: Some(ContractParams::default()),
        }
    }

    /// Switches the consensus family, filling in default family parameters.
    pub fn with_family(mut self, family: ConsensusFamily) -> Self {
        self.family = family;
        match family {
            ConsensusFamily::Pow => {
                self.poa = None;
                self.pow.get_or_insert_with(|| PowParams {
                    pow_limit: match self.network {
                        Network::Mainnet => Target::MAX_ATTAINABLE_MAINNET,
                        Network::Testnet => Target::MAX_ATTAINABLE_TESTNET,
                        Network::Regtest => Target::MAX_ATTAINABLE_REGTEST,
                    },
                    pow_target_timespan: 14 * 24 * 60 * 60,
                    no_pow_retargeting: self.network == Network::Regtest,
                });
                self.target_spacing = 10 * 60;
                self.subsidy_halving_interval = Some(210_000);
            }
            ConsensusFamily::Pos => {
                self.poa = None;
                self.pos.get_or_insert_with(|| PosParams {
                    pos_limit: Target::MAX_ATTAINABLE_REGTEST,
                    stake_min_confirmations: 50,
                    stake_timestamp_mask: 0x0000000F,
                    stake_reward: COIN,
                });
                self.target_spacing = 64;
            }
            ConsensusFamily::Poa => {
                self.pow = None;
                self.pos = None;
            }
        }
        self
    }

    /// Number of blocks between two difficulty retargets.
    pub fn difficulty_adjustment_interval(&self) -> u32 {
        self.pow
            .as_ref()
            .map(|pow| (pow.pow_target_timespan / self.target_spacing as u64) as u32)
            .unwrap_or(1)
    }

    /// Block subsidy at `height`.
    pub fn subsidy(&self, height: Height) -> u64 {
        match self.subsidy_halving_interval {
            Some(interval) => {
                let halvings = height / interval;
                if halvings >= 64 {
                    0
                } else {
                    self.block_subsidy >> halvings
                }
            }
            None => self.block_subsidy,
        }
    }

    /// Window length used by `deployment`.
    pub fn window(&self, deployment: &Bip9Deployment) -> u32 {
        deployment.window.unwrap_or(self.miner_confirmation_window)
    }

    /// Signalling threshold used by `deployment`.
    pub fn threshold(&self, deployment: &Bip9Deployment) -> u32 {
        deployment
            .threshold
            .unwrap_or(self.rule_change_activation_threshold)
    }
}
