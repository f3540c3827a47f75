//! Named consensus errors.
//!
//! Codes are part of the protocol: every node must reject the same input with the same code.

use std::fmt;

/// A deterministic rejection reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsensusError {
    /// Stable machine readable code.
    pub code: &'static str,
    pub message: &'static str,
}

impl ConsensusError {
    pub const fn new(code: &'static str, message: &'static str) -> Self {
        Self { code, message }
    }
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ConsensusError {}

macro_rules! consensus_errors {
    ($($(#[$meta:meta])* $name:ident => $code:literal, $message:literal;)+) => {
        /// Catalogue of the consensus errors.
        pub struct ConsensusErrors;

        impl ConsensusErrors {
            $(
                $(#[$meta])*
                pub const $name: ConsensusError = ConsensusError::new($code, $message);
            )+

            pub const ALL: &'static [ConsensusError] = &[$(Self::$name),+];

            /// Looks an error up by code.
            pub fn by_code(code: &str) -> Option<ConsensusError> {
                Self::ALL.iter().copied().find(|error| error.code == code)
            }
        }
    };
}

consensus_errors! {
    // Block integrity.
    BAD_MERKLE_ROOT => "bad-txnmrklroot", "hashMerkleRoot mismatch";
    BAD_BLOCK_EMPTY => "bad-blk-length", "block has no transactions";
    BAD_COINBASE_MISSING => "bad-cb-missing", "first tx is not coinbase";
    BAD_MULTIPLE_COINBASE => "bad-cb-multiple", "more than one coinbase";
    BAD_COINBASE_LENGTH => "bad-cb-length", "coinbase script length out of range";
    BAD_TX_DUPLICATE => "bad-txns-duplicate", "duplicate transaction";
    BAD_TX_NO_INPUTS => "bad-txns-vin-empty", "transaction has no inputs";
    BAD_TX_NO_OUTPUTS => "bad-txns-vout-empty", "transaction has no outputs";
    BAD_TX_DUPLICATE_INPUTS => "bad-txns-inputs-duplicate", "duplicate inputs";
    BAD_TX_OUTPUT_TOO_LARGE => "bad-txns-vout-toolarge", "output value too large";
    BAD_TX_TOTAL_OUTPUT_TOO_LARGE => "bad-txns-txouttotal-toolarge", "total output value too large";
    BAD_TX_NULL_PREVOUT => "bad-txns-prevout-null", "input refers to a null prevout";
    BAD_TX_OVERSIZE => "bad-txns-oversize", "transaction too large";
    BAD_TX_NON_FINAL => "bad-txns-nonfinal", "non-final transaction";

    // Header.
    TIME_TOO_NEW => "time-too-new", "block timestamp too far in the future";
    TIME_TOO_OLD => "time-too-old", "block timestamp too early";
    BAD_DIFFICULTY_BITS => "bad-diffbits", "incorrect difficulty";
    HIGH_HASH => "high-hash", "proof of work failed";
    BAD_VERSION => "bad-version", "block version rejected";

    // Coins.
    BAD_TX_MISSING_INPUTS => "bad-txns-inputs-missingorspent", "input missing or spent";
    BAD_TX_PREMATURE_SPEND => "bad-txns-premature-spend-of-coinbase", "tried to spend an immature reward";
    BAD_TX_IN_BELOW_OUT => "bad-txns-in-belowout", "value in below value out";
    BAD_COINBASE_AMOUNT => "bad-cb-amount", "coinbase pays too much";
    BAD_COINSTAKE_AMOUNT => "bad-cs-amount", "coinstake pays too much";

    // Proof of stake.
    COINSTAKE_MISSING => "bad-cs-missing", "second tx is not a coinstake";
    BAD_MULTIPLE_COINSTAKE => "bad-cs-multiple", "more than one coinstake";
    BAD_COINBASE_NOT_EMPTY => "bad-cb-not-empty", "coinbase of a proof of stake block pays out";
    BAD_STAKE_TIME => "bad-stake-time", "block timestamp violates the stake timestamp mask";
    STAKE_PREVOUT_NOT_MATURE => "stake-prevout-not-mature", "staked coin is not mature";
    STAKE_HASH_INVALID_TARGET => "stake-hash-invalid-target", "stake kernel hash above target";

    // Proof of authority.
    INVALID_HEADER_SIGNATURE => "invalid-header-signature", "block not signed by a federation member";
    WRONG_BLOCK_PRODUCER => "wrong-block-producer", "block signed out of the producer's slot";
    INVALID_HEADER_TIMESTAMP => "invalid-header-timestamp", "timestamp not aligned to a slot";
    BLOCK_TIMESTAMP_TOO_EARLY => "block-timestamp-too-early", "timestamp not after the previous block";

    // Collateral commitments.
    COMMITMENT_HEIGHT_MISSING => "collateral-commitment-height-missing", "coinbase carries no height commitment";
    COMMITMENT_INVALID_MAGIC => "collateral-commitment-invalid-magic", "commitment refers to another counter chain";
    COMMITMENT_HEIGHT_TOO_LOW => "collateral-commitment-height-too-low", "commitment below the previous block's";
    COMMITMENT_HEIGHT_TOO_HIGH => "collateral-commitment-height-too-high", "commitment above the counter chain tip";

    // Smart contracts.
    CONTRACT_CODE_INVALID_HASH => "contract-code-invalid-hash", "contract code hash not allowed";
    CONTRACT_CODE_UNSIGNED => "contract-code-unsigned", "contract code not signed by the required signers";
    CONTRACT_CODE_INVALID_SIGNATURE => "contract-code-invalid-signature", "contract code signature unrecoverable";
    CONTRACT_INVALID_FORMAT => "contract-invalid-format", "malformed contract transaction";
    CONTRACT_MULTIPLE_OUTPUTS => "contract-multiple-outputs", "more than one contract output";
    GAS_PRICE_OUT_OF_RANGE => "gas-price-out-of-range", "gas price out of range";
    GAS_LIMIT_OUT_OF_RANGE => "gas-limit-out-of-range", "gas limit out of range";
    FEE_TOO_SMALL_FOR_GAS => "fee-too-small-for-gas", "fee does not cover the gas limit";
    BLOCK_GAS_LIMIT_EXCEEDED => "block-gas-limit-exceeded", "block consumes too much gas";
    UNRESOLVED_SENDER => "contract-sender-unresolved", "cannot resolve the contract sender";
    MISSING_CONTRACT_STATE => "missing-contract-state", "header carries no contract state";
    INVALID_STATE_ROOT => "invalid-state-root", "contract state root mismatch";
    INVALID_RECEIPT_ROOT => "invalid-receipt-root", "receipt root mismatch";
    MISSING_REFUND_OUTPUT => "missing-refund-output", "coinbase does not pay a gas refund";
    OP_SPEND_IN_BLOCK => "opspend-outside-coinbase", "contract spend outside the block producer's transactions";

    // Memory pool.
    OP_SPEND_IN_MEMPOOL => "opspend-in-mempool", "contract spend opcode in a mempool transaction";
    INVALID_VOTING_REQUEST => "invalid-voting-request", "malformed join federation request";
    TX_COINBASE => "coinbase", "coinbase in the memory pool";
    TX_COINSTAKE => "coinstake", "coinstake in the memory pool";
    TX_ALREADY_IN_MEMPOOL => "txn-already-in-mempool", "transaction already in the memory pool";
    TX_MEMPOOL_CONFLICT => "txn-mempool-conflict", "input spent by a memory pool transaction";
    TX_NON_STANDARD_OUTPUT => "scriptpubkey", "non-standard output script";
    MEMPOOL_FULL => "mempool-full", "memory pool is full";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_unique_and_resolvable() {
        let error = ConsensusErrors::by_code("opspend-in-mempool").unwrap();
        assert_eq!(error, ConsensusErrors::OP_SPEND_IN_MEMPOOL);
        assert_eq!(
            error.to_string(),
            "opspend-in-mempool: contract spend opcode in a mempool transaction"
        );
        assert!(ConsensusErrors::by_code("no-such-code").is_none());

        let codes = ConsensusErrors::ALL
            .iter()
            .map(|error| error.code)
            .collect::<std::collections::HashSet<_>>();
        assert_eq!(codes.len(), ConsensusErrors::ALL.len());
    }
}
