//! Script templates and the fixed-format payloads the sidechain embeds in transactions.

mod block_signature;
mod commitment;
mod federation;
mod join_request;
mod multisig;
pub mod opcodes;
mod solver;

pub use self::block_signature::BlockSignature;
pub use self::commitment::{
    COMMITMENT_PREFIX, decode_commitment_height, encode_commitment_height,
    height_commitment_script,
};
pub use self::federation::{FederationId, FederationResolver, PayToFederationTemplate};
pub use self::join_request::{JOIN_FEDERATION_MARKER, JoinFederationRequest};
pub use self::multisig::{
    combine_multisig_script_sigs, combine_signatures, extract_multisig_script_sig,
    generate_multisig_script_sig, SignatureSlots,
};
pub use self::solver::{
    NullDataTemplate, PayToMultisigTemplate, PayToPubkeyHashTemplate, PayToPubkeyTemplate,
    PayToScriptHashTemplate, PayToWitnessTemplate, ScriptTemplate, StandardScripts, TxoutType,
};

/// Script construction error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Push data exceeds the maximum push size: {0}")]
    PushSize(#[from] bitcoin::script::PushBytesError),
    #[error("Multisig requires {required} signatures from {keys} keys")]
    InvalidMultisig { required: usize, keys: usize },
}
