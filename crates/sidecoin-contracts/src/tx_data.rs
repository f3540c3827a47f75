//! Contract transaction payloads.
//!
//! A contract output script is `OP_CREATECONTRACT` or `OP_CALLCONTRACT` followed by the SCALE
//! encoded [`ContractTxData`].

use crate::state::code_hash;
use bitcoin::secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, Verification};
use bitcoin::{Script, ScriptBuf};
use codec::{Decode, DecodeAll, Encode};
use sidecoin_primitives::Address;
use sidecoin_script::opcodes::{OP_CALLCONTRACT, OP_CREATECONTRACT};

/// Only supported contract VM version.
pub const VM_VERSION: u32 = 1;

/// Length of a compact recoverable code signature: recovery id followed by `r ‖ s`.
const CODE_SIGNATURE_LEN: usize = 65;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractTxDataError {
    #[error("Script is not a contract create or call")]
    NotAContractScript,
    #[error("Malformed contract transaction data")]
    Malformed,
    #[error("Payload does not match the script opcode")]
    OpcodeMismatch,
    #[error("Unsupported VM version {0}")]
    UnsupportedVmVersion(u32),
    #[error("Malformed code signature at index {0}")]
    InvalidSignature(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ContractPayload {
    #[codec(index = 0)]
    Create { code: Vec<u8>, params: Vec<Vec<u8>> },
    #[codec(index = 1)]
    Call {
        contract_address: Address,
        method_name: String,
        params: Vec<Vec<u8>>,
    },
}

/// Decoded contract invocation.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ContractTxData {
    pub vm_version: u32,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub payload: ContractPayload,
    /// Signatures over the code hash, only meaningful for creates.
    pub signatures: Vec<Vec<u8>>,
}

impl ContractTxData {
    pub fn create(gas_price: u64, gas_limit: u64, code: Vec<u8>, params: Vec<Vec<u8>>) -> Self {
        Self {
            vm_version: VM_VERSION,
            gas_price,
            gas_limit,
            payload: ContractPayload::Create { code, params },
            signatures: Vec::new(),
        }
    }

    pub fn call(
        gas_price: u64,
        gas_limit: u64,
        contract_address: Address,
        method_name: impl Into<String>,
        params: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            vm_version: VM_VERSION,
            gas_price,
            gas_limit,
            payload: ContractPayload::Call {
                contract_address,
                method_name: method_name.into(),
                params,
            },
            signatures: Vec::new(),
        }
    }

    pub fn is_create(&self) -> bool {
        matches!(self.payload, ContractPayload::Create { .. })
    }

    /// Contract code carried by a create.
    pub fn code(&self) -> Option<&[u8]> {
        match &self.payload {
            ContractPayload::Create { code, .. } => Some(code),
            ContractPayload::Call { .. } => None,
        }
    }

    pub fn code_hash(&self) -> Option<[u8; 32]> {
        self.code().map(code_hash)
    }

    /// Total fee reserved for gas.
    pub fn gas_cost(&self) -> u64 {
        self.gas_price.saturating_mul(self.gas_limit)
    }

    pub fn to_script(&self) -> ScriptBuf {
        let opcode = if self.is_create() {
            OP_CREATECONTRACT
        } else {
            OP_CALLCONTRACT
        };
        let mut bytes = vec![opcode];
        self.encode_to(&mut bytes);
        ScriptBuf::from_bytes(bytes)
    }

    pub fn from_script(script: &Script) -> Result<Self, ContractTxDataError> {
        let (opcode, mut payload) = script
            .as_bytes()
            .split_first()
            .ok_or(ContractTxDataError::NotAContractScript)?;

        let expect_create = match *opcode {
            OP_CREATECONTRACT => true,
            OP_CALLCONTRACT => false,
            _ => return Err(ContractTxDataError::NotAContractScript),
        };

        let data =
            Self::decode_all(&mut payload).map_err(|_| ContractTxDataError::Malformed)?;

        if data.vm_version != VM_VERSION {
            return Err(ContractTxDataError::UnsupportedVmVersion(data.vm_version));
        }
        if data.is_create() != expect_create {
            return Err(ContractTxDataError::OpcodeMismatch);
        }

        Ok(data)
    }

    /// Signs the code hash, appending a compact recoverable signature.
    pub fn sign_code<C: bitcoin::secp256k1::Signing>(
        &mut self,
        secp: &Secp256k1<C>,
        secret_key: &bitcoin::secp256k1::SecretKey,
    ) {
        let Some(hash) = self.code_hash() else {
            return;
        };
        let (recovery_id, compact) = secp
            .sign_ecdsa_recoverable(&Message::from_digest(hash), secret_key)
            .serialize_compact();
        let mut signature = Vec::with_capacity(CODE_SIGNATURE_LEN);
        signature.push(recovery_id.to_i32() as u8);
        signature.extend_from_slice(&compact);
        self.signatures.push(signature);
    }

    /// Recovers the keys that signed the contract code.
    ///
    /// Any malformed or unrecoverable signature fails the whole recovery.
    pub fn recover_code_signers<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
    ) -> Result<Vec<PublicKey>, ContractTxDataError> {
        let Some(hash) = self.code_hash() else {
            return Ok(Vec::new());
        };
        let message = Message::from_digest(hash);

        self.signatures
            .iter()
            .enumerate()
            .map(|(index, signature)| {
                let invalid = || ContractTxDataError::InvalidSignature(index);
                if signature.len() != CODE_SIGNATURE_LEN {
                    return Err(invalid());
                }
                let recovery_id =
                    RecoveryId::from_i32(signature[0] as i32).map_err(|_| invalid())?;
                let signature = RecoverableSignature::from_compact(&signature[1..], recovery_id)
                    .map_err(|_| invalid())?;
                secp.recover_ecdsa(&message, &signature)
                    .map_err(|_| invalid())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    #[test]
    fn script_round_trip_and_opcode_check() {
        let create = ContractTxData::create(1, 50_000, vec![1, 2, 3], vec![b"a".to_vec()]);
        let script = create.to_script();
        assert_eq!(script.as_bytes()[0], OP_CREATECONTRACT);
        assert_eq!(ContractTxData::from_script(&script), Ok(create.clone()));

        let mut mismatched = script.to_bytes();
        mismatched[0] = OP_CALLCONTRACT;
        assert_eq!(
            ContractTxData::from_script(&ScriptBuf::from_bytes(mismatched)),
            Err(ContractTxDataError::OpcodeMismatch)
        );

        let mut truncated = script.to_bytes();
        truncated.pop();
        assert_eq!(
            ContractTxData::from_script(&ScriptBuf::from_bytes(truncated)),
            Err(ContractTxDataError::Malformed)
        );
        assert_eq!(
            ContractTxData::from_script(&ScriptBuf::new()),
            Err(ContractTxDataError::NotAContractScript)
        );
    }

    #[test]
    fn unsupported_vm_version() {
        let mut call = ContractTxData::call(1, 50_000, Address([1; 20]), "go", Vec::new());
        call.vm_version = 2;
        assert_eq!(
            ContractTxData::from_script(&call.to_script()),
            Err(ContractTxDataError::UnsupportedVmVersion(2))
        );
    }

    #[test]
    fn code_signers_are_recovered() {
        let secp = Secp256k1::new();
        let first = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let second = SecretKey::from_slice(&[0x22; 32]).unwrap();

        let mut data = ContractTxData::create(1, 50_000, vec![9, 9, 9], Vec::new());
        data.sign_code(&secp, &first);
        data.sign_code(&secp, &second);

        assert_eq!(
            data.recover_code_signers(&secp).unwrap(),
            vec![first.public_key(&secp), second.public_key(&secp)]
        );

        data.signatures[1].truncate(10);
        assert_eq!(
            data.recover_code_signers(&secp),
            Err(ContractTxDataError::InvalidSignature(1))
        );
    }
}
