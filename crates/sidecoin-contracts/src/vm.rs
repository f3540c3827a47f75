//! Deterministic contract code format.
//!
//! Contract code is a SCALE encoded [`ContractCode`], a list of methods whose bodies are
//! straight-line instruction sequences.

use codec::{Decode, DecodeAll, Encode};
use sidecoin_primitives::Address;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Instruction {
    /// Writes `value` under `key` in the contract storage.
    #[codec(index = 0)]
    Store { key: Vec<u8>, value: Vec<u8> },
    /// Writes a call parameter under `key`.
    #[codec(index = 1)]
    StoreParam { key: Vec<u8>, param: u32 },
    #[codec(index = 2)]
    Delete { key: Vec<u8> },
    #[codec(index = 3)]
    Log { topics: Vec<Vec<u8>>, data: Vec<u8> },
    /// Sends funds held by the contract.
    #[codec(index = 4)]
    Transfer { to: Address, amount: u64 },
    /// Calls another contract. A failed call is rolled back without failing the caller,
    /// except for running out of gas.
    #[codec(index = 5)]
    Call {
        to: Address,
        method: String,
        amount: u64,
        params: Vec<Vec<u8>>,
    },
    #[codec(index = 6)]
    Revert { reason: String },
    #[codec(index = 7)]
    Return { value: Vec<u8> },
    /// Consumes gas without side effect.
    #[codec(index = 8)]
    Burn { gas: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Method {
    pub name: String,
    pub body: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ContractCode {
    pub type_name: String,
    /// Runs once when the contract is created.
    pub constructor: Vec<Instruction>,
    pub methods: Vec<Method>,
}

impl ContractCode {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode()
    }

    /// Decodes contract code, `None` if the bytes are not exactly one [`ContractCode`].
    pub fn from_bytes(mut bytes: &[u8]) -> Option<Self> {
        Self::decode_all(&mut bytes).ok()
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|method| method.name == name)
    }
}
