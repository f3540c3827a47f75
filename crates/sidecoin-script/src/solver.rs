use crate::federation::{FederationId, PayToFederationTemplate};
use crate::opcodes::OP_FEDERATION;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::Opcode;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::script::{Builder, Instruction};
use bitcoin::{
    PubkeyHash, PublicKey, Script, ScriptBuf, ScriptHash, WPubkeyHash, WScriptHash,
    WitnessProgram, WitnessVersion,
};

/// Largest number of keys in a standard bare multisig.
const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Transaction output types
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TxoutType {
    NonStandard,
    PubKey(PublicKey),
    PubKeyHash(PubkeyHash),
    ScriptHash(ScriptHash),
    Multisig {
        required_sigs: u8,
        keys: Vec<PublicKey>,
    },
    /// Multisig controlled by a federation, resolved by id.
    Federation(FederationId),
    // unspendable OP_RETURN script that carries data.
    NullData(Vec<Vec<u8>>),
    WitnessV0KeyHash(WPubkeyHash),
    WitnessV0ScriptHash(WScriptHash),
    // Witness programs not covered above.
    WitnessUnknown { version: u8, program: Vec<u8> },
}

impl TxoutType {
    pub fn script_type(&self) -> &'static str {
        match self {
            Self::NonStandard => "nonstandard",
            Self::PubKey(_) => "pubkey",
            Self::PubKeyHash(_) => "pubkeyhash",
            Self::ScriptHash(_) => "scripthash",
            Self::Multisig { .. } => "multisig",
            Self::Federation(_) => "federation",
            Self::NullData(_) => "nulldata",
            Self::WitnessV0KeyHash(_) => "witness_v0_keyhash",
            Self::WitnessV0ScriptHash(_) => "witness_v0_scripthash",
            Self::WitnessUnknown { .. } => "witness_unknown",
        }
    }

    /// Generates the output script for these parameters.
    ///
    /// Returns `None` for [`TxoutType::NonStandard`] and malformed parameters.
    pub fn to_script_pubkey(&self) -> Option<ScriptBuf> {
        let script = match self {
            Self::NonStandard => return None,
            Self::PubKey(pubkey) => ScriptBuf::new_p2pk(pubkey),
            Self::PubKeyHash(hash) => ScriptBuf::new_p2pkh(hash),
            Self::ScriptHash(hash) => ScriptBuf::new_p2sh(hash),
            Self::Multisig {
                required_sigs,
                keys,
            } => {
                if *required_sigs == 0
                    || *required_sigs as usize > keys.len()
                    || keys.len() > MAX_PUBKEYS_PER_MULTISIG
                {
                    return None;
                }
                let mut builder = Builder::new().push_int(*required_sigs as i64);
                for key in keys {
                    builder = builder.push_key(key);
                }
                builder
                    .push_int(keys.len() as i64)
                    .push_opcode(OP_CHECKMULTISIG)
                    .into_script()
            }
            Self::Federation(id) => PayToFederationTemplate::script_pubkey(id),
            Self::NullData(pushes) => {
                let mut builder = Builder::new().push_opcode(bitcoin::opcodes::all::OP_RETURN);
                for push in pushes {
                    let data = bitcoin::script::PushBytesBuf::try_from(push.clone()).ok()?;
                    builder = builder.push_slice(data);
                }
                builder.into_script()
            }
            Self::WitnessV0KeyHash(hash) => ScriptBuf::new_p2wpkh(hash),
            Self::WitnessV0ScriptHash(hash) => ScriptBuf::new_p2wsh(hash),
            Self::WitnessUnknown { version, program } => {
                let version = WitnessVersion::try_from(*version).ok()?;
                let program = WitnessProgram::new(version, program).ok()?;
                ScriptBuf::new_witness_program(&program)
            }
        };

        Some(script)
    }
}

/// A script template: recognises a script shape and extracts its parameters.
pub trait ScriptTemplate: Send + Sync {
    /// Template name, matches [`TxoutType::script_type`].
    fn name(&self) -> &'static str;

    /// Extracts the parameters if the script matches this template.
    fn extract(&self, script_pubkey: &Script) -> Option<TxoutType>;

    /// Whether the script matches this template.
    fn can_match(&self, script_pubkey: &Script) -> bool {
        self.extract(script_pubkey).is_some()
    }
}

/// Pay-to-pubkey-hash: `OP_DUP OP_HASH160 <hash> OP_EQUALVERIFY OP_CHECKSIG`.
pub struct PayToPubkeyHashTemplate;

impl ScriptTemplate for PayToPubkeyHashTemplate {
    fn name(&self) -> &'static str {
        "pubkeyhash"
    }

    fn extract(&self, script_pubkey: &Script) -> Option<TxoutType> {
        script_pubkey
            .is_p2pkh()
            .then(|| {
                let hash: [u8; 20] = script_pubkey.as_bytes()[3..23].try_into().ok()?;
                Some(TxoutType::PubKeyHash(PubkeyHash::from_byte_array(hash)))
            })
            .flatten()
    }
}

/// Pay-to-pubkey: `<pubkey> OP_CHECKSIG`.
pub struct PayToPubkeyTemplate;

impl ScriptTemplate for PayToPubkeyTemplate {
    fn name(&self) -> &'static str {
        "pubkey"
    }

    fn extract(&self, script_pubkey: &Script) -> Option<TxoutType> {
        script_pubkey.p2pk_public_key().map(TxoutType::PubKey)
    }
}

/// Pay-to-script-hash: `OP_HASH160 <hash> OP_EQUAL`.
pub struct PayToScriptHashTemplate;

impl ScriptTemplate for PayToScriptHashTemplate {
    fn name(&self) -> &'static str {
        "scripthash"
    }

    fn extract(&self, script_pubkey: &Script) -> Option<TxoutType> {
        script_pubkey
            .is_p2sh()
            .then(|| {
                let hash: [u8; 20] = script_pubkey.as_bytes()[2..22].try_into().ok()?;
                Some(TxoutType::ScriptHash(ScriptHash::from_byte_array(hash)))
            })
            .flatten()
    }
}

/// Bare multisig: `m <pubkey1> ... <pubkeyn> n OP_CHECKMULTISIG`.
pub struct PayToMultisigTemplate;

impl ScriptTemplate for PayToMultisigTemplate {
    fn name(&self) -> &'static str {
        "multisig"
    }

    fn extract(&self, script_pubkey: &Script) -> Option<TxoutType> {
        let (required_sigs, keys) = match_multisig(script_pubkey)?;
        Some(TxoutType::Multisig {
            required_sigs,
            keys,
        })
    }
}

/// Null data: `OP_RETURN <push>...`, bounded by the network relay limit.
pub struct NullDataTemplate {
    max_script_size: usize,
}

impl NullDataTemplate {
    pub fn new(max_script_size: usize) -> Self {
        Self { max_script_size }
    }
}

impl ScriptTemplate for NullDataTemplate {
    fn name(&self) -> &'static str {
        "nulldata"
    }

    fn extract(&self, script_pubkey: &Script) -> Option<TxoutType> {
        if !script_pubkey.is_op_return() || script_pubkey.len() > self.max_script_size {
            return None;
        }

        let mut pushes = Vec::new();
        for instruction in script_pubkey.instructions().skip(1) {
            match instruction.ok()? {
                Instruction::PushBytes(data) => pushes.push(data.as_bytes().to_vec()),
                Instruction::Op(_) => return None,
            }
        }

        Some(TxoutType::NullData(pushes))
    }
}

/// Segwit programs.
pub struct PayToWitnessTemplate;

impl ScriptTemplate for PayToWitnessTemplate {
    fn name(&self) -> &'static str {
        "witness"
    }

    fn extract(&self, script_pubkey: &Script) -> Option<TxoutType> {
        let version = script_pubkey.witness_version()?;
        let program = &script_pubkey.as_bytes()[2..];

        let txout_type = match (version, program.len()) {
            (WitnessVersion::V0, 20) => {
                TxoutType::WitnessV0KeyHash(WPubkeyHash::from_byte_array(program.try_into().ok()?))
            }
            (WitnessVersion::V0, 32) => TxoutType::WitnessV0ScriptHash(
                WScriptHash::from_byte_array(program.try_into().ok()?),
            ),
            (WitnessVersion::V0, _) => return None,
            (version, _) => TxoutType::WitnessUnknown {
                version: version.to_num(),
                program: program.to_vec(),
            },
        };

        Some(txout_type)
    }
}

/// Ordered list of templates, the first match wins.
pub struct StandardScripts {
    templates: Vec<Box<dyn ScriptTemplate>>,
}

impl StandardScripts {
    /// Standard templates for a network relaying `OP_RETURN` scripts up to `max_op_return_relay`
    /// bytes.
    ///
    /// The federation template precedes the generic multisig one.
    pub fn new(max_op_return_relay: usize) -> Self {
        Self {
            templates: vec![
                Box::new(PayToPubkeyHashTemplate),
                Box::new(PayToPubkeyTemplate),
                Box::new(PayToScriptHashTemplate),
                Box::new(PayToFederationTemplate),
                Box::new(PayToMultisigTemplate),
                Box::new(NullDataTemplate::new(max_op_return_relay)),
                Box::new(PayToWitnessTemplate),
            ],
        }
    }

    /// Appends a template with the lowest priority.
    pub fn register(&mut self, template: Box<dyn ScriptTemplate>) {
        self.templates.push(template);
    }

    /// Returns the first template matching the script.
    pub fn template_for(&self, script_pubkey: &Script) -> Option<&dyn ScriptTemplate> {
        self.templates
            .iter()
            .find(|template| template.can_match(script_pubkey))
            .map(|template| template.as_ref())
    }

    /// Classifies the script, [`TxoutType::NonStandard`] when nothing matches.
    pub fn solve(&self, script_pubkey: &Script) -> TxoutType {
        self.templates
            .iter()
            .find_map(|template| template.extract(script_pubkey))
            .unwrap_or(TxoutType::NonStandard)
    }

    pub fn is_standard(&self, script_pubkey: &Script) -> bool {
        !matches!(self.solve(script_pubkey), TxoutType::NonStandard)
    }
}

/// Checks whether a script pubkey is a bare multisig output.
///
/// In a bare multisig pubkey script the keys are not hashed, the script
/// is of the form:
///
///    `2 <pubkey1> <pubkey2> <pubkey3> 3 OP_CHECKMULTISIG`
fn match_multisig(script_pubkey: &Script) -> Option<(u8, Vec<PublicKey>)> {
    let mut instructions = script_pubkey.instructions();

    let required_sigs = match instructions.next()?.ok()? {
        Instruction::Op(op) => decode_pushnum(op)?,
        Instruction::PushBytes(_) => return None,
    };

    let mut keys = Vec::new();
    let keys_count = loop {
        match instructions.next()?.ok()? {
            Instruction::PushBytes(key) => {
                keys.push(PublicKey::from_slice(key.as_bytes()).ok()?);
            }
            Instruction::Op(op) => break decode_pushnum(op)?,
        }
    };

    if keys_count as usize != keys.len()
        || keys.len() > MAX_PUBKEYS_PER_MULTISIG
        || required_sigs > keys_count
    {
        return None;
    }

    match instructions.next()?.ok()? {
        Instruction::Op(op) if op == OP_CHECKMULTISIG => {}
        _ => return None,
    }

    instructions
        .next()
        .is_none()
        .then_some((required_sigs, keys))
}

pub(crate) fn decode_pushnum(opcode: Opcode) -> Option<u8> {
    if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&opcode.to_u8()) {
        Some(opcode.to_u8() - 0x50)
    } else {
        None
    }
}

/// Whether `opcode` is the federation marker.
pub(crate) fn is_federation_opcode(opcode: Opcode) -> bool {
    opcode.to_u8() == OP_FEDERATION
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn test_pubkey(seed: u8) -> PublicKey {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[seed; 32]).unwrap();
        PublicKey::new(secret.public_key(&secp))
    }

    #[test]
    fn p2pkh_and_p2pk_round_trip_through_templates() {
        let scripts = StandardScripts::new(83);
        let pubkey = test_pubkey(1);

        let p2pkh = ScriptBuf::new_p2pkh(&pubkey.pubkey_hash());
        assert_eq!(scripts.solve(&p2pkh), TxoutType::PubKeyHash(pubkey.pubkey_hash()));

        let p2pk = TxoutType::PubKey(pubkey).to_script_pubkey().unwrap();
        assert_eq!(scripts.solve(&p2pk), TxoutType::PubKey(pubkey));
        assert_eq!(scripts.template_for(&p2pk).unwrap().name(), "pubkey");
    }

    #[test]
    fn raw_p2pkh_script() {
        let script = ScriptBuf::from_bytes(
            hex_literal::hex!("76a914111111111111111111111111111111111111111188ac").to_vec(),
        );
        assert_eq!(
            StandardScripts::new(83).solve(&script),
            TxoutType::PubKeyHash(PubkeyHash::from_byte_array([0x11; 20]))
        );
        let generated = TxoutType::PubKeyHash(PubkeyHash::from_byte_array([0x11; 20]))
            .to_script_pubkey()
            .unwrap();
        assert_eq!(
            hex::encode(generated.as_bytes()),
            "76a914111111111111111111111111111111111111111188ac"
        );
    }

    #[test]
    fn multisig_is_extracted() {
        let scripts = StandardScripts::new(83);
        let keys = vec![test_pubkey(1), test_pubkey(2), test_pubkey(3)];
        let params = TxoutType::Multisig {
            required_sigs: 2,
            keys: keys.clone(),
        };
        let script = params.to_script_pubkey().unwrap();
        assert_eq!(scripts.solve(&script), params);

        let invalid = TxoutType::Multisig {
            required_sigs: 4,
            keys,
        };
        assert!(invalid.to_script_pubkey().is_none());
    }

    #[test]
    fn multisig_with_trailing_opcode_is_nonstandard() {
        let script = Builder::new()
            .push_int(1)
            .push_key(&test_pubkey(1))
            .push_int(1)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script();
        assert_eq!(PayToMultisigTemplate.extract(&script), None);
    }

    #[test]
    fn null_data_respects_relay_limit() {
        let small = TxoutType::NullData(vec![vec![0xab; 40]]).to_script_pubkey().unwrap();
        let large = TxoutType::NullData(vec![vec![0xab; 100]]).to_script_pubkey().unwrap();

        let scripts = StandardScripts::new(83);
        assert_eq!(scripts.solve(&small), TxoutType::NullData(vec![vec![0xab; 40]]));
        assert_eq!(scripts.solve(&large), TxoutType::NonStandard);
        assert!(StandardScripts::new(200).is_standard(&large));
    }

    #[test]
    fn witness_programs() {
        let pubkey = test_pubkey(9);
        let wpkh = pubkey.wpubkey_hash().unwrap();
        let script = ScriptBuf::new_p2wpkh(&wpkh);
        assert_eq!(
            StandardScripts::new(83).solve(&script),
            TxoutType::WitnessV0KeyHash(wpkh)
        );
    }

    #[test]
    fn federation_precedes_multisig() {
        let id = FederationId([7u8; 32]);
        let script = TxoutType::Federation(id).to_script_pubkey().unwrap();
        let scripts = StandardScripts::new(83);
        assert_eq!(scripts.solve(&script), TxoutType::Federation(id));
        assert!(!PayToMultisigTemplate.can_match(&script));
    }
}
