//! Script form detection and opcode-level parsing helpers.

/// Step over one operation. Returns the opcode and pushed data, if any,
/// advancing `pos`. `None` marks the end of the script or a truncated
/// push.
pub fn next_op<'a>(script: &'a [u8], pos: &mut usize) -> Option<(u8, Option<&'a [u8]>)> {
    if *pos >= script.len() {
        return None;
    }
    let op = script[*pos];
    *pos += 1;
    let len = match op {
        0x01..=0x4b => op as usize,
        0x4c => {
            let len = *script.get(*pos)? as usize;
            *pos += 1;
            len
        }
        0x4d => {
            let bytes = script.get(*pos..*pos + 2)?;
            *pos += 2;
            u16::from_le_bytes([bytes[0], bytes[1]]) as usize
        }
        0x4e => {
            let bytes = script.get(*pos..*pos + 4)?;
            *pos += 4;
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        }
        _ => return Some((op, None)),
    };
    let data = script.get(*pos..*pos + len)?;
    *pos += len;
    Some((op, Some(data)))
}

/// `OP_HASH160 <20 bytes> OP_EQUAL`.
pub fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == 0xa9 && script[1] == 0x14 && script[22] == 0x87
}

/// A segwit output: a version opcode followed by a single 2-to-40-byte
/// push (BIP141).
pub fn witness_program(script: &[u8]) -> Option<(u8, &[u8])> {
    if script.len() < 4 || script.len() > 42 {
        return None;
    }
    let version = match script[0] {
        0x00 => 0,
        op @ 0x51..=0x60 => op - 0x50,
        _ => return None,
    };
    let push = script[1] as usize;
    if !(2..=40).contains(&push) || script.len() != push + 2 {
        return None;
    }
    Some((version, &script[2..]))
}

pub fn is_push_only(script: &[u8]) -> bool {
    let mut pos = 0;
    while pos < script.len() {
        match next_op(script, &mut pos) {
            Some((op, _)) if op <= 0x60 && op != 0x50 => {}
            _ => return false,
        }
    }
    true
}

/// The last data push of a script, e.g. the redeem script of a P2SH
/// spend.
pub fn last_push(script: &[u8]) -> Option<Vec<u8>> {
    let mut pos = 0;
    let mut last = None;
    while pos < script.len() {
        let (op, data) = next_op(script, &mut pos)?;
        match (op, data) {
            (_, Some(data)) => last = Some(data.to_vec()),
            (0x00, None) => last = Some(Vec::new()),
            (op, None) if (0x51..=0x60).contains(&op) => last = Some(vec![op - 0x50]),
            _ => {}
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pushdata_variants() {
        let script = [0x02, 0xaa, 0xbb, 0x4c, 0x01, 0xcc, 0x76];
        let mut pos = 0;
        assert_eq!(
            next_op(&script, &mut pos),
            Some((0x02, Some(&[0xaa, 0xbb][..])))
        );
        assert_eq!(next_op(&script, &mut pos), Some((0x4c, Some(&[0xcc][..]))));
        assert_eq!(next_op(&script, &mut pos), Some((0x76, None)));
        assert_eq!(next_op(&script, &mut pos), None);
    }

    #[test]
    fn truncated_push_is_rejected() {
        let script = [0x05, 0xaa];
        let mut pos = 0;
        assert_eq!(next_op(&script, &mut pos), None);
        assert!(!is_push_only(&script));
    }

    #[test]
    fn witness_program_forms() {
        let mut p2wpkh = vec![0x00, 0x14];
        p2wpkh.extend_from_slice(&[0xaa; 20]);
        assert_eq!(witness_program(&p2wpkh), Some((0, &p2wpkh[2..])));

        let mut p2wsh = vec![0x00, 0x20];
        p2wsh.extend_from_slice(&[0xbb; 32]);
        assert_eq!(witness_program(&p2wsh), Some((0, &p2wsh[2..])));

        // Not a program: trailing garbage.
        let mut bad = p2wpkh.clone();
        bad.push(0x00);
        assert_eq!(witness_program(&bad), None);
    }

    #[test]
    fn last_push_finds_redeem_script() {
        let script = [0x00, 0x02, 0xaa, 0xbb, 0x51];
        assert_eq!(last_push(&script), Some(vec![1]));
        let script = [0x00, 0x02, 0xaa, 0xbb];
        assert_eq!(last_push(&script), Some(vec![0xaa, 0xbb]));
    }
}
