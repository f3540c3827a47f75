//! Request of a candidate to join the federation, published as an `OP_RETURN` output.
//!
//! Layout: `OP_RETURN <marker> <pubkey (33) ‖ collateral amount (u64 LE) ‖
//! collateral address (20) ‖ signature length (u8) ‖ signature>`.

use crate::Error;
use bitcoin::hashes::{Hash, sha256d};
use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey, Signing, Verification, ecdsa};
use bitcoin::{PublicKey, Script, ScriptBuf, Transaction};
use sidecoin_primitives::Address;

/// Marker push identifying a join-federation request.
pub const JOIN_FEDERATION_MARKER: [u8; 4] = *b"JFED";

const PUBKEY_LEN: usize = 33;
const FIXED_LEN: usize = PUBKEY_LEN + 8 + 20 + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinFederationRequest {
    /// Key the candidate will sign blocks with.
    pub public_key: PublicKey,
    /// Collateral held on the counter chain, in satoshis.
    pub collateral_amount: u64,
    /// Counter chain address holding the collateral.
    pub collateral_address: Address,
    /// Signature by the collateral address key over [`Self::signing_hash`].
    pub signature: Vec<u8>,
}

impl JoinFederationRequest {
    pub fn new(public_key: PublicKey, collateral_amount: u64, collateral_address: Address) -> Self {
        Self {
            public_key,
            collateral_amount,
            collateral_address,
            signature: Vec::new(),
        }
    }

    /// Hash committed to by the signature.
    pub fn signing_hash(&self) -> sha256d::Hash {
        let mut data = Vec::with_capacity(FIXED_LEN - 1);
        self.encode_fixed(&mut data);
        sha256d::Hash::hash(&data)
    }

    /// Signs the request with the key controlling the collateral address.
    pub fn sign<C: Signing>(&mut self, secp: &Secp256k1<C>, collateral_key: &SecretKey) {
        let message = Message::from_digest(self.signing_hash().to_byte_array());
        self.signature = secp
            .sign_ecdsa(&message, collateral_key)
            .serialize_der()
            .to_vec();
    }

    /// Whether `collateral_key` matches the collateral address and signed this request.
    pub fn verify<C: Verification>(&self, secp: &Secp256k1<C>, collateral_key: &PublicKey) -> bool {
        if Address::from_public_key(collateral_key) != self.collateral_address {
            return false;
        }
        let Ok(signature) = ecdsa::Signature::from_der(&self.signature) else {
            return false;
        };
        let message = Message::from_digest(self.signing_hash().to_byte_array());
        secp.verify_ecdsa(&message, &signature, &collateral_key.inner)
            .is_ok()
    }

    fn encode_fixed(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.public_key.inner.serialize());
        out.extend_from_slice(&self.collateral_amount.to_le_bytes());
        out.extend_from_slice(self.collateral_address.as_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_LEN + self.signature.len());
        self.encode_fixed(&mut out);
        out.push(self.signature.len() as u8);
        out.extend_from_slice(&self.signature);
        out
    }

    /// Decodes a payload, `None` if it is truncated, has trailing bytes or an invalid key.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < FIXED_LEN {
            return None;
        }

        let public_key = PublicKey::from_slice(&payload[..PUBKEY_LEN]).ok()?;
        let collateral_amount =
            u64::from_le_bytes(payload[PUBKEY_LEN..PUBKEY_LEN + 8].try_into().ok()?);
        let collateral_address = Address(payload[PUBKEY_LEN + 8..FIXED_LEN - 1].try_into().ok()?);
        let signature_len = payload[FIXED_LEN - 1] as usize;

        let signature = &payload[FIXED_LEN..];
        if signature.len() != signature_len {
            return None;
        }

        Some(Self {
            public_key,
            collateral_amount,
            collateral_address,
            signature: signature.to_vec(),
        })
    }

    pub fn to_script(&self) -> Result<ScriptBuf, Error> {
        Ok(Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(JOIN_FEDERATION_MARKER)
            .push_slice(PushBytesBuf::try_from(self.encode())?)
            .into_script())
    }

    /// Whether the script is tagged as a join-federation request, well formed or not.
    pub fn is_tagged(script: &Script) -> bool {
        let mut instructions = script.instructions();
        match (instructions.next(), instructions.next()) {
            (Some(Ok(Instruction::Op(op))), Some(Ok(Instruction::PushBytes(marker)))) => {
                op == OP_RETURN && marker.as_bytes() == JOIN_FEDERATION_MARKER.as_slice()
            }
            _ => false,
        }
    }

    /// Parses a tagged script, `None` if the script is untagged or malformed.
    pub fn from_script(script: &Script) -> Option<Self> {
        if !Self::is_tagged(script) {
            return None;
        }

        let instructions = script
            .instructions()
            .collect::<Result<Vec<_>, _>>()
            .ok()?;

        match instructions.as_slice() {
            [_, _, Instruction::PushBytes(payload)] => Self::decode(payload.as_bytes()),
            _ => None,
        }
    }

    /// Returns the tagged outputs of the transaction, decoded where possible.
    pub fn tagged_outputs(tx: &Transaction) -> impl Iterator<Item = Option<Self>> + '_ {
        tx.output
            .iter()
            .filter(|output| Self::is_tagged(&output.script_pubkey))
            .map(|output| Self::from_script(&output.script_pubkey))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seed: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
        (secret, PublicKey::new(secret.public_key(&secp)))
    }

    fn signed_request() -> (JoinFederationRequest, PublicKey) {
        let secp = Secp256k1::new();
        let (_, member) = keys(1);
        let (collateral_secret, collateral_public) = keys(2);
        let mut request = JoinFederationRequest::new(
            member,
            10_000 * sidecoin_primitives::COIN,
            Address::from_public_key(&collateral_public),
        );
        request.sign(&secp, &collateral_secret);
        (request, collateral_public)
    }

    #[test]
    fn script_round_trip_and_verify() {
        let secp = Secp256k1::verification_only();
        let (request, collateral_key) = signed_request();
        let script = request.to_script().unwrap();

        assert!(JoinFederationRequest::is_tagged(&script));
        let decoded = JoinFederationRequest::from_script(&script).unwrap();
        assert_eq!(decoded, request);
        assert!(decoded.verify(&secp, &collateral_key));
        assert!(!decoded.verify(&secp, &keys(3).1));
    }

    #[test]
    fn tampered_amount_fails_verification() {
        let secp = Secp256k1::verification_only();
        let (mut request, collateral_key) = signed_request();
        request.collateral_amount += 1;
        assert!(!request.verify(&secp, &collateral_key));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let (request, _) = signed_request();
        let mut payload = request.encode();
        payload.pop();
        assert_eq!(JoinFederationRequest::decode(&payload), None);
        assert_eq!(JoinFederationRequest::decode(&payload[..10]), None);

        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(JOIN_FEDERATION_MARKER)
            .push_slice(PushBytesBuf::try_from(payload).unwrap())
            .into_script();
        assert!(JoinFederationRequest::is_tagged(&script));
        assert_eq!(JoinFederationRequest::from_script(&script), None);
    }
}
