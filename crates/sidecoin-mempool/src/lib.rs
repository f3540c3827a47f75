//! Memory pool of the sidechain.
//!
//! Transactions are admitted through a list of [`MempoolRule`]s followed by input validation
//! against the coin view, and leave the pool when mined, conflicted or invalidated.

mod options;
mod pool;
mod reserved;
mod rules;

pub use self::options::{MAX_OP_RETURN_RELAY, MempoolOptions};
pub use self::pool::{Mempool, MempoolEntry, MempoolError};
pub use self::reserved::ReservedUtxos;
pub use self::rules::{
    ContractTransactionRule, MempoolRule, MempoolValidationContext, OpSpendRule,
    RewardTransactionRule, StandardOutputsRule, TransactionSanityRule, VotingRequestRule,
    check_rules,
};
