//! Primitives shared by the sidecoin consensus and chain-state engine.

mod address;
pub mod chain;
mod events;
pub mod params;
mod utils;

pub use self::address::Address;
pub use self::chain::{
    ChainIndexer, ChainedHeader, ContractStateRoots, SidechainBlock, SidechainHeader,
    is_coinstake,
};
pub use self::events::{ChainEvent, EventBus, SubscriptionId};
pub use self::params::{
    Bip9Deployment, CollateralParams, ConsensusFamily, ConsensusParams, ContractParams, Network,
    PoaParams, PosParams, PowParams,
};
pub use self::utils::shuffle;

/// Block height.
pub type Height = u32;

/// 1 coin in satoshis.
pub const COIN: u64 = 100_000_000;

/// Height assigned to coins which only exist in the memory pool.
pub const MEMPOOL_HEIGHT: Height = 0x7FFF_FFFF;
