use bitcoin::hashes::{Hash, hash160, sha256d};
use bitcoin::{PubkeyHash, PublicKey, Txid};
use codec::{Decode, Encode};

/// 160-bit account address.
///
/// Used both for externally owned senders (the pubkey hash of the spending key) and for
/// contract accounts (derived from the creating transaction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Encode, Decode)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The all-zero address.
    pub const ZERO: Self = Self([0u8; 20]);

    /// Returns the address of an externally owned account controlled by `pubkey`.
    pub fn from_public_key(pubkey: &PublicKey) -> Self {
        Self::from(pubkey.pubkey_hash())
    }

    /// Derives the address of a contract created by transaction `txid`.
    ///
    /// `nonce` distinguishes contracts created by the same transaction via internal creates.
    pub fn for_contract(txid: Txid, nonce: u64) -> Self {
        let mut data = Vec::with_capacity(40);
        data.extend_from_slice(txid.as_byte_array());
        data.extend_from_slice(&nonce.to_le_bytes());
        let hash = sha256d::Hash::hash(&data);
        let mut address = [0u8; 20];
        address.copy_from_slice(&hash.as_byte_array()[..20]);
        Self(address)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl From<PubkeyHash> for Address {
    fn from(hash: PubkeyHash) -> Self {
        Self(hash.to_byte_array())
    }
}

impl From<hash160::Hash> for Address {
    fn from(hash: hash160::Hash) -> Self {
        Self(hash.to_byte_array())
    }
}

impl From<Address> for PubkeyHash {
    fn from(address: Address) -> Self {
        PubkeyHash::from_byte_array(address.0)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_address_depends_on_nonce() {
        let txid = Txid::all_zeros();
        assert_ne!(Address::for_contract(txid, 0), Address::for_contract(txid, 1));
        assert_eq!(Address::for_contract(txid, 7), Address::for_contract(txid, 7));
    }
}
