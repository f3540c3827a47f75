//! Opcodes reserved for smart contracts.
//!
//! They are only meaningful as the first byte of a script.

use bitcoin::Script;

/// Creates a contract, followed by the serialized contract transaction data.
pub const OP_CREATECONTRACT: u8 = 0xc0;
/// Calls a contract method, followed by the serialized contract transaction data.
pub const OP_CALLCONTRACT: u8 = 0xc1;
/// Spends contract funds, only valid in transactions built by the block producer.
pub const OP_SPEND: u8 = 0xc2;
/// Marks an output paying a contract from another contract.
pub const OP_INTERNALCONTRACTTRANSFER: u8 = 0xc3;
/// Marks a pay-to-federation output script.
pub const OP_FEDERATION: u8 = 0xe0;

fn first_byte_is(script: &Script, opcode: u8) -> bool {
    script.as_bytes().first() == Some(&opcode)
}

/// Whether the script creates a contract.
pub fn is_smart_contract_create(script: &Script) -> bool {
    first_byte_is(script, OP_CREATECONTRACT)
}

/// Whether the script calls a contract.
pub fn is_smart_contract_call(script: &Script) -> bool {
    first_byte_is(script, OP_CALLCONTRACT)
}

/// Whether the script creates or calls a contract.
pub fn is_smart_contract_exec(script: &Script) -> bool {
    is_smart_contract_create(script) || is_smart_contract_call(script)
}

/// Whether the script spends contract funds.
pub fn is_smart_contract_spend(script: &Script) -> bool {
    first_byte_is(script, OP_SPEND)
}

/// Whether the script is an internal contract transfer.
pub fn is_smart_contract_internal_call(script: &Script) -> bool {
    first_byte_is(script, OP_INTERNALCONTRACTTRANSFER)
}
