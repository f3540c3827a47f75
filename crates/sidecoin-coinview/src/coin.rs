use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut};
use codec::{Decode, Encode};
use serde::{Deserialize, Serialize};
use sidecoin_primitives::Height;

/// Unspent transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Coin {
    /// Whether the output was created by a coinbase.
    pub is_coinbase: bool,
    /// Whether the output was created by a coinstake.
    pub is_coinstake: bool,
    /// Value in satoshis.
    pub amount: u64,
    /// Height of the block that created the output.
    pub height: Height,
    pub script_pubkey: Vec<u8>,
}

impl Coin {
    pub fn from_txout(txout: &TxOut, height: Height, is_coinbase: bool, is_coinstake: bool) -> Self {
        Self {
            is_coinbase,
            is_coinstake,
            amount: txout.value.to_sat(),
            height,
            script_pubkey: txout.script_pubkey.to_bytes(),
        }
    }

    pub fn tx_out(&self) -> TxOut {
        TxOut {
            value: Amount::from_sat(self.amount),
            script_pubkey: ScriptBuf::from_bytes(self.script_pubkey.clone()),
        }
    }

    /// Whether the coin needs to wait for maturity before being spent.
    pub fn is_reward(&self) -> bool {
        self.is_coinbase || self.is_coinstake
    }

    /// Confirmations of the coin for a spend in a block at `spend_height`.
    pub fn confirmations(&self, spend_height: Height) -> u32 {
        spend_height.saturating_sub(self.height)
    }
}

/// Result of a coin lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub outpoint: OutPoint,
    /// `None` if the outpoint is unknown or spent.
    pub coin: Option<Coin>,
}

impl UnspentOutput {
    pub fn is_unspent(&self) -> bool {
        self.coin.is_some()
    }
}
