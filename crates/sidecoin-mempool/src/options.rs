/// Default setting for -datacarriersize.
/// 80 bytes of data, +1 for OP_RETURN, +2 for the pushdata opcodes.
pub const MAX_OP_RETURN_RELAY: usize = 83;

/// Configuration options for the transaction memory pool.
#[derive(Clone, Debug)]
pub struct MempoolOptions {
    /// Maximum number of transactions held by the pool.
    pub max_transactions: usize,

    /// Largest relayed `OP_RETURN` output script, in bytes.
    pub max_op_return_relay: usize,

    /// Whether to require standard output scripts.
    pub require_standard: bool,

    /// Number of transactions announced per relay round.
    pub relay_sample_size: usize,
}

impl Default for MempoolOptions {
    fn default() -> Self {
        Self {
            max_transactions: 50_000,
            max_op_return_relay: MAX_OP_RETURN_RELAY,
            require_standard: true,
            relay_sample_size: 1_000,
        }
    }
}

impl MempoolOptions {
    /// Create new mempool options with default values
    pub fn new() -> Self {
        Self::default()
    }
}
