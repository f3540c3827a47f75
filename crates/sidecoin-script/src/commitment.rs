//! Collateral height commitment carried in the coinbase.
//!
//! The commitment is an `OP_RETURN` output of the form
//! `OP_RETURN <prefix ‖ height (u32 LE)> [<magic (u32 LE)>]`.

use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::{Builder, Instruction};
use bitcoin::{Script, ScriptBuf, Transaction};
use sidecoin_primitives::Height;

/// Marker preceding the committed height.
pub const COMMITMENT_PREFIX: [u8; 4] = [0x79, 0x0D, 0x06, 0xFD];

const COMMITMENT_LEN: usize = COMMITMENT_PREFIX.len() + 4;

/// Returns `prefix ‖ height` in little endian.
pub fn encode_commitment_height(height: Height) -> [u8; COMMITMENT_LEN] {
    let mut bytes = [0u8; COMMITMENT_LEN];
    bytes[..4].copy_from_slice(&COMMITMENT_PREFIX);
    bytes[4..].copy_from_slice(&height.to_le_bytes());
    bytes
}

/// Builds the commitment output script, optionally tagged with the counter chain magic.
pub fn height_commitment_script(height: Height, magic: Option<u32>) -> ScriptBuf {
    let builder = Builder::new()
        .push_opcode(OP_RETURN)
        .push_slice(encode_commitment_height(height));

    match magic {
        Some(magic) => builder.push_slice(magic.to_le_bytes()).into_script(),
        None => builder.into_script(),
    }
}

/// Scans the coinbase outputs for a height commitment.
///
/// Returns the committed height and magic of the first well formed commitment,
/// `(None, None)` if there is none. Malformed candidates are skipped.
pub fn decode_commitment_height(coinbase: &Transaction) -> (Option<Height>, Option<u32>) {
    coinbase
        .output
        .iter()
        .find_map(|output| decode_script(&output.script_pubkey))
        .map(|(height, magic)| (Some(height), magic))
        .unwrap_or((None, None))
}

fn decode_script(script: &Script) -> Option<(Height, Option<u32>)> {
    if !script.is_op_return() {
        return None;
    }

    let instructions = script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .ok()?;

    if instructions.len() != 2 && instructions.len() != 3 {
        return None;
    }

    let commitment = push_data(&instructions[1])?;
    if commitment.len() < COMMITMENT_LEN || commitment[..4] != COMMITMENT_PREFIX {
        return None;
    }
    let height = Height::from_le_bytes(commitment[4..COMMITMENT_LEN].try_into().ok()?);

    let magic = match instructions.get(2) {
        Some(instruction) => {
            let magic = push_data(instruction)?;
            Some(u32::from_le_bytes(magic.get(..4)?.try_into().ok()?))
        }
        None => None,
    };

    Some((height, magic))
}

fn push_data<'a>(instruction: &Instruction<'a>) -> Option<&'a [u8]> {
    match instruction {
        Instruction::PushBytes(data) => Some(data.as_bytes()),
        Instruction::Op(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::script::PushBytesBuf;
    use bitcoin::{Amount, TxOut};

    fn op_return_with(data: &[u8]) -> ScriptBuf {
        Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(PushBytesBuf::try_from(data.to_vec()).unwrap())
            .into_script()
    }

    fn coinbase_with(scripts: Vec<ScriptBuf>) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: scripts
                .into_iter()
                .map(|script_pubkey| TxOut {
                    value: Amount::ZERO,
                    script_pubkey,
                })
                .collect(),
        }
    }

    #[test]
    fn encoding_layout() {
        assert_eq!(
            encode_commitment_height(0x0102_0304),
            [0x79, 0x0D, 0x06, 0xFD, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn round_trip_without_magic() {
        for height in [0, 1, 73, 500_000, i32::MAX as u32] {
            let tx = coinbase_with(vec![height_commitment_script(height, None)]);
            assert_eq!(decode_commitment_height(&tx), (Some(height), None));
        }
    }

    #[test]
    fn round_trip_with_magic() {
        let tx = coinbase_with(vec![
            ScriptBuf::new(),
            height_commitment_script(1234, Some(0x522357A0)),
        ]);
        assert_eq!(decode_commitment_height(&tx), (Some(1234), Some(0x522357A0)));
    }

    #[test]
    fn short_push_is_skipped() {
        let tx = coinbase_with(vec![op_return_with(&COMMITMENT_PREFIX[..3])]);
        assert_eq!(decode_commitment_height(&tx), (None, None));

        let tx = coinbase_with(vec![op_return_with(&COMMITMENT_PREFIX)]);
        assert_eq!(decode_commitment_height(&tx), (None, None));
    }

    #[test]
    fn malformed_outputs_do_not_stop_the_scan() {
        let wrong_prefix = op_return_with(&[0u8; 8]);
        let bare_op_return = ScriptBuf::from_bytes(vec![OP_RETURN.to_u8()]);
        let tx = coinbase_with(vec![
            wrong_prefix,
            bare_op_return,
            height_commitment_script(42, None),
            height_commitment_script(43, None),
        ]);
        assert_eq!(decode_commitment_height(&tx), (Some(42), None));
    }

    #[test]
    fn too_many_pushes_is_not_a_commitment() {
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(encode_commitment_height(7))
            .push_slice([1u8, 2, 3, 4])
            .push_slice([5u8])
            .into_script();
        let tx = coinbase_with(vec![script]);
        assert_eq!(decode_commitment_height(&tx), (None, None));
    }
}
