use crate::opcodes::OP_FEDERATION;
use crate::solver::{ScriptTemplate, TxoutType, is_federation_opcode};
use bitcoin::opcodes::Opcode;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::{Builder, Instruction};
use bitcoin::{PublicKey, Script, ScriptBuf};

/// Identifier of a federation, resolved to its members at validation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FederationId(pub [u8; 32]);

impl std::fmt::Display for FederationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Resolves a federation id to its multisig parameters.
pub trait FederationResolver: Send + Sync {
    /// Returns the required signature count and the ordered member keys.
    fn resolve(&self, id: &FederationId) -> Option<(usize, Vec<PublicKey>)>;
}

/// Pay-to-federation: `<federation id> OP_FEDERATION OP_CHECKMULTISIG`.
pub struct PayToFederationTemplate;

impl PayToFederationTemplate {
    pub fn script_pubkey(id: &FederationId) -> ScriptBuf {
        Builder::new()
            .push_slice(id.0)
            .push_opcode(Opcode::from(OP_FEDERATION))
            .push_opcode(OP_CHECKMULTISIG)
            .into_script()
    }
}

impl ScriptTemplate for PayToFederationTemplate {
    fn name(&self) -> &'static str {
        "federation"
    }

    fn extract(&self, script_pubkey: &Script) -> Option<TxoutType> {
        let mut instructions = script_pubkey.instructions();

        let id: [u8; 32] = match instructions.next()?.ok()? {
            Instruction::PushBytes(data) => data.as_bytes().try_into().ok()?,
            Instruction::Op(_) => return None,
        };

        match instructions.next()?.ok()? {
            Instruction::Op(op) if is_federation_opcode(op) => {}
            _ => return None,
        }

        match instructions.next()?.ok()? {
            Instruction::Op(op) if op == OP_CHECKMULTISIG => {}
            _ => return None,
        }

        instructions
            .next()
            .is_none()
            .then_some(TxoutType::Federation(FederationId(id)))
    }
}
