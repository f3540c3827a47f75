/// Contract state errors.
///
/// These are storage level faults. Failures of the executed contract code are reported in
/// the [`crate::StateTransitionResult`] instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] sidecoin_storage::Error),

    #[error(transparent)]
    CoinView(#[from] sidecoin_coinview::Error),

    #[error("Failed to decode contract state: {0}")]
    Codec(#[from] codec::Error),

    #[error("Trie node {0} not found")]
    MissingTrieNode(String),

    #[error("Unknown state root {0}")]
    UnknownRoot(String),

    #[error("Account {0} referenced by storage changes does not exist")]
    MissingAccount(sidecoin_primitives::Address),
}
