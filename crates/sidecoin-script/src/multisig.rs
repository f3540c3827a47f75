//! Multisig and federation `scriptSig` handling.
//!
//! A partially signed multisig input carries one slot per member key, in key
//! order. Unsigned slots are rendered as `OP_0` placeholders.

use crate::Error;
use bitcoin::opcodes::OP_0;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{Script, ScriptBuf};

/// Signature slots aligned to the member keys, `None` for an unsigned slot.
pub type SignatureSlots = Vec<Option<Vec<u8>>>;

fn is_present(sig: &Option<Vec<u8>>) -> bool {
    sig.as_ref().is_some_and(|sig| !sig.is_empty())
}

/// Renders `OP_0 <sig_1> ... <sig_n>`, with `OP_0` for every unsigned slot.
pub fn generate_multisig_script_sig(signatures: &[Option<Vec<u8>>]) -> Result<ScriptBuf, Error> {
    let mut builder = Builder::new().push_opcode(OP_0);
    for signature in signatures {
        builder = match signature {
            Some(sig) if !sig.is_empty() => builder.push_slice(PushBytesBuf::try_from(sig.clone())?),
            _ => builder.push_opcode(OP_0),
        };
    }
    Ok(builder.into_script())
}

/// Parses a multisig `scriptSig` back into signature slots.
///
/// Returns `None` unless the script is push-only and starts with `OP_0`.
pub fn extract_multisig_script_sig(script_sig: &Script) -> Option<SignatureSlots> {
    let mut instructions = script_sig.instructions();

    match instructions.next()?.ok()? {
        Instruction::PushBytes(data) if data.is_empty() => {}
        _ => return None,
    }

    instructions
        .map(|instruction| match instruction.ok()? {
            Instruction::PushBytes(data) if data.is_empty() => Some(None),
            Instruction::PushBytes(data) => Some(Some(data.as_bytes().to_vec())),
            Instruction::Op(_) => None,
        })
        .collect()
}

/// Merges two partial signature sets of the same multisig.
///
/// For each key position the first present signature wins, `a` before `b`.
/// The scan stops as soon as `required` signatures are collected, in which case
/// the unsigned slots are dropped. Otherwise the slot layout is kept so the result
/// can be combined again.
pub fn combine_signatures(
    a: &[Option<Vec<u8>>],
    b: &[Option<Vec<u8>>],
    key_count: usize,
    required: usize,
) -> SignatureSlots {
    let mut combined = vec![None; key_count];
    let mut count = 0;

    for (index, slot) in combined.iter_mut().enumerate() {
        let sig_a = a.get(index).filter(|sig| is_present(sig));
        let sig_b = b.get(index).filter(|sig| is_present(sig));

        if let Some(sig) = sig_a.or(sig_b) {
            *slot = sig.clone();
            count += 1;
        }

        if count == required {
            break;
        }
    }

    if count == required {
        combined.retain(is_present);
    }

    combined
}

/// Combines two multisig `scriptSig`s for a `required`-of-`key_count` script.
///
/// A side that does not parse as a multisig `scriptSig` is ignored.
pub fn combine_multisig_script_sigs(
    required: usize,
    key_count: usize,
    a: &Script,
    b: &Script,
) -> Result<ScriptBuf, Error> {
    if required == 0 || required > key_count {
        return Err(Error::InvalidMultisig {
            required,
            keys: key_count,
        });
    }

    let (sigs_a, sigs_b) = match (
        extract_multisig_script_sig(a),
        extract_multisig_script_sig(b),
    ) {
        (Some(sigs_a), Some(sigs_b)) => (sigs_a, sigs_b),
        (Some(_), None) => return Ok(a.to_owned()),
        (None, _) => return Ok(b.to_owned()),
    };

    let combined = combine_signatures(&sigs_a, &sigs_b, key_count, required);

    tracing::trace!(
        required,
        key_count,
        collected = combined.iter().filter(|sig| is_present(sig)).count(),
        "Combined multisig signatures"
    );

    generate_multisig_script_sig(&combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(byte: u8) -> Option<Vec<u8>> {
        Some(vec![0x30, byte, byte, 0x01])
    }

    #[test]
    fn script_sig_round_trip_keeps_placeholders() {
        let slots = vec![sig(1), None, sig(3)];
        let script = generate_multisig_script_sig(&slots).unwrap();
        assert_eq!(script.as_bytes()[0], 0x00);
        assert_eq!(extract_multisig_script_sig(&script), Some(slots));
    }

    #[test]
    fn script_sig_must_start_with_op_0() {
        let script = ScriptBuf::from_bytes(vec![0x01, 0xaa]);
        assert_eq!(extract_multisig_script_sig(&script), None);
    }

    #[test]
    fn combining_with_itself_is_idempotent() {
        let partial = vec![sig(1), None, None];
        assert_eq!(combine_signatures(&partial, &partial, 3, 2), partial);

        let complete = combine_signatures(&[sig(1), None, sig(3)], &[], 3, 2);
        assert_eq!(complete, vec![sig(1), sig(3)]);
        assert_eq!(combine_signatures(&complete, &complete, 3, 2), complete);
    }

    #[test]
    fn complementary_sets_reach_threshold_without_placeholders() {
        let a = vec![sig(1), None, None];
        let b = vec![None, None, sig(3)];
        let combined = combine_signatures(&a, &b, 3, 2);
        assert_eq!(combined, vec![sig(1), sig(3)]);

        let script = combine_multisig_script_sigs(
            2,
            3,
            &generate_multisig_script_sig(&a).unwrap(),
            &generate_multisig_script_sig(&b).unwrap(),
        )
        .unwrap();
        assert_eq!(extract_multisig_script_sig(&script), Some(combined));
    }

    #[test]
    fn first_set_wins_on_conflict() {
        let combined = combine_signatures(&[sig(1), None], &[sig(9), sig(2)], 2, 2);
        assert_eq!(combined, vec![sig(1), sig(2)]);
    }

    #[test]
    fn empty_signatures_count_as_missing() {
        let combined = combine_signatures(&[Some(Vec::new()), None], &[sig(5), None], 2, 2);
        assert_eq!(combined, vec![sig(5), None]);
    }

    #[test]
    fn scan_stops_at_threshold() {
        let combined = combine_signatures(&[sig(1), sig(2), sig(3)], &[], 3, 2);
        assert_eq!(combined, vec![sig(1), sig(2)]);
    }

    #[test]
    fn unparsable_side_is_ignored() {
        let a = generate_multisig_script_sig(&[sig(1), None]).unwrap();
        let garbage = ScriptBuf::from_bytes(vec![0x51]);
        assert_eq!(combine_multisig_script_sigs(1, 2, &a, &garbage).unwrap(), a);
        assert_eq!(combine_multisig_script_sigs(1, 2, &garbage, &a).unwrap(), a);
        assert!(combine_multisig_script_sigs(3, 2, &a, &a).is_err());
    }
}
