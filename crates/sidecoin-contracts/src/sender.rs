//! Resolution of the address a contract transaction is sent from.

use bitcoin::{Script, Transaction};
use sidecoin_coinview::CoinLookup;
use sidecoin_primitives::Address;
use sidecoin_script::{PayToPubkeyHashTemplate, PayToPubkeyTemplate, ScriptTemplate, TxoutType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SenderError {
    #[error("Prevout index is out of range of the funding transaction")]
    InvalidOutputIndex,
    #[error("Prevout is already spent")]
    OutputAlreadySpent,
    #[error("Prevout not found in the coin view")]
    OutputsNotInCoinView,
    #[error("Unable to get the sender")]
    UnableToGetSender,
}

/// Extracts the sender address of a pay-to-pubkey or pay-to-pubkey-hash script.
pub fn address_from_script(script_pubkey: &Script) -> Option<Address> {
    match PayToPubkeyHashTemplate
        .extract(script_pubkey)
        .or_else(|| PayToPubkeyTemplate.extract(script_pubkey))?
    {
        TxoutType::PubKeyHash(hash) => Some(hash.into()),
        TxoutType::PubKey(pubkey) => Some(Address::from_public_key(&pubkey)),
        _ => None,
    }
}

/// Resolves the sender of `tx` from the output spent by its first input.
///
/// Transactions of the same block take precedence over the coin view, which may hold a stale
/// entry for the same outpoint. Storage faults of the coin view surface as
/// [`SenderError::UnableToGetSender`] after being logged.
pub fn get_sender(
    tx: &Transaction,
    coins: Option<&mut dyn CoinLookup>,
    block_txs: Option<&[Transaction]>,
) -> Result<Address, SenderError> {
    let prevout = tx
        .input
        .first()
        .map(|input| input.previous_output)
        .ok_or(SenderError::UnableToGetSender)?;

    if let Some(funding) = block_txs
        .into_iter()
        .flatten()
        .find(|candidate| candidate.compute_txid() == prevout.txid)
    {
        let output = funding
            .output
            .get(prevout.vout as usize)
            .ok_or(SenderError::InvalidOutputIndex)?;
        return address_from_script(&output.script_pubkey).ok_or(SenderError::UnableToGetSender);
    }

    let Some(coins) = coins else {
        return Err(SenderError::UnableToGetSender);
    };

    let unspent = coins
        .lookup(&prevout)
        .map_err(|err| {
            tracing::warn!(%prevout, ?err, "Coin lookup failed while resolving sender");
            SenderError::UnableToGetSender
        })?
        .ok_or(SenderError::OutputsNotInCoinView)?;

    let coin = unspent.coin.ok_or(SenderError::OutputAlreadySpent)?;

    address_from_script(Script::from_bytes(&coin.script_pubkey))
        .ok_or(SenderError::UnableToGetSender)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, OutPoint, PubkeyHash, ScriptBuf, Sequence, TxIn, TxOut, Witness};
    use sidecoin_coinview::{Coin, UnspentOutput};
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapLookup(HashMap<OutPoint, Option<Coin>>);

    impl CoinLookup for MapLookup {
        fn lookup(&mut self, outpoint: &OutPoint) -> sidecoin_coinview::Result<Option<UnspentOutput>> {
            Ok(self.0.get(outpoint).map(|coin| UnspentOutput {
                outpoint: *outpoint,
                coin: coin.clone(),
            }))
        }
    }

    fn p2pkh(byte: u8) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([byte; 20]))
    }

    fn tx(inputs: Vec<OutPoint>, outputs: Vec<ScriptBuf>) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs
                .into_iter()
                .map(|script_pubkey| TxOut {
                    value: Amount::from_sat(1_000),
                    script_pubkey,
                })
                .collect(),
        }
    }

    fn coin(script: ScriptBuf) -> Coin {
        Coin {
            is_coinbase: false,
            is_coinstake: false,
            amount: 1_000,
            height: 1,
            script_pubkey: script.into_bytes(),
        }
    }

    #[test]
    fn block_transactions_take_precedence() {
        let funding = tx(vec![OutPoint::null()], vec![p2pkh(0xaa)]);
        let prevout = OutPoint::new(funding.compute_txid(), 0);
        let spender = tx(vec![prevout], Vec::new());

        let mut coins = MapLookup::default();
        coins.0.insert(prevout, Some(coin(p2pkh(0xbb))));

        let block_txs = [funding];
        assert_eq!(
            get_sender(&spender, Some(&mut coins), Some(&block_txs)),
            Ok(Address([0xaa; 20]))
        );
        assert_eq!(
            get_sender(&spender, Some(&mut coins), None),
            Ok(Address([0xbb; 20]))
        );
    }

    #[test]
    fn failure_reasons() {
        let funding = tx(vec![OutPoint::null()], vec![p2pkh(0xaa)]);
        let out_of_range = tx(vec![OutPoint::new(funding.compute_txid(), 3)], Vec::new());
        assert_eq!(
            get_sender(&out_of_range, None, Some(std::slice::from_ref(&funding))),
            Err(SenderError::InvalidOutputIndex)
        );

        let prevout = OutPoint::new(funding.compute_txid(), 0);
        let spender = tx(vec![prevout], Vec::new());
        assert_eq!(get_sender(&spender, None, None), Err(SenderError::UnableToGetSender));

        let mut coins = MapLookup::default();
        assert_eq!(
            get_sender(&spender, Some(&mut coins), None),
            Err(SenderError::OutputsNotInCoinView)
        );

        coins.0.insert(prevout, None);
        assert_eq!(
            get_sender(&spender, Some(&mut coins), None),
            Err(SenderError::OutputAlreadySpent)
        );

        coins.0.insert(prevout, Some(coin(ScriptBuf::new_op_return([1u8; 4]))));
        assert_eq!(
            get_sender(&spender, Some(&mut coins), None),
            Err(SenderError::UnableToGetSender)
        );
    }

    #[test]
    fn pay_to_pubkey_sender() {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(&[0x42; 32]).unwrap();
        let pubkey = bitcoin::PublicKey::new(secret_key.public_key(&secp));
        let script = ScriptBuf::new_p2pk(&pubkey);
        assert_eq!(address_from_script(&script), Some(Address::from_public_key(&pubkey)));
        assert_eq!(address_from_script(&ScriptBuf::new()), None);
    }
}
