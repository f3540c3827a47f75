//! Signature a federation member attaches to a produced block.

use bitcoin::BlockHash;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey, Signing, Verification, ecdsa};

/// DER encoded ECDSA signature over the block hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSignature(ecdsa::Signature);

impl BlockSignature {
    /// Signs `block_hash` with the member key.
    pub fn sign<C: Signing>(secp: &Secp256k1<C>, block_hash: &BlockHash, key: &SecretKey) -> Self {
        Self(secp.sign_ecdsa(&message(block_hash), key))
    }

    /// Decodes a signature blob, `None` if it is empty or not valid DER.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        ecdsa::Signature::from_der(bytes).ok().map(Self)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.serialize_der().to_vec()
    }

    /// Whether the signature over `block_hash` was produced by `public_key`.
    pub fn verify<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        block_hash: &BlockHash,
        public_key: &PublicKey,
    ) -> bool {
        let mut signature = self.0;
        signature.normalize_s();
        secp.verify_ecdsa(&message(block_hash), &signature, public_key)
            .is_ok()
    }

    /// Returns the first of `members` that produced this signature.
    pub fn find_signer<'a, C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        block_hash: &BlockHash,
        members: &'a [bitcoin::PublicKey],
    ) -> Option<&'a bitcoin::PublicKey> {
        members
            .iter()
            .find(|member| self.verify(secp, block_hash, &member.inner))
    }
}

fn message(block_hash: &BlockHash) -> Message {
    Message::from_digest(block_hash.to_byte_array())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SecretKey {
        SecretKey::from_slice(&[seed; 32]).unwrap()
    }

    #[test]
    fn sign_and_verify() {
        let secp = Secp256k1::new();
        let hash = BlockHash::from_byte_array([3u8; 32]);
        let signature = BlockSignature::sign(&secp, &hash, &key(1));

        let decoded = BlockSignature::from_bytes(&signature.to_bytes()).unwrap();
        assert_eq!(decoded, signature);
        assert!(decoded.verify(&secp, &hash, &key(1).public_key(&secp)));
        assert!(!decoded.verify(&secp, &hash, &key(2).public_key(&secp)));
        assert!(!decoded.verify(&secp, &BlockHash::from_byte_array([4u8; 32]), &key(1).public_key(&secp)));
    }

    #[test]
    fn malformed_blobs_are_absent() {
        assert_eq!(BlockSignature::from_bytes(&[]), None);
        assert_eq!(BlockSignature::from_bytes(&[0x30, 0x01, 0x02]), None);
    }

    #[test]
    fn signer_lookup() {
        let secp = Secp256k1::new();
        let hash = BlockHash::from_byte_array([9u8; 32]);
        let members: Vec<_> = (1..=3)
            .map(|seed| bitcoin::PublicKey::new(key(seed).public_key(&secp)))
            .collect();
        let signature = BlockSignature::sign(&secp, &hash, &key(2));
        assert_eq!(signature.find_signer(&secp, &hash, &members), Some(&members[1]));
        assert_eq!(
            BlockSignature::sign(&secp, &hash, &key(7)).find_signer(&secp, &hash, &members),
            None
        );
    }
}
