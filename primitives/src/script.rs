// SPDX-License-Identifier: CC0-1.0

//! Script element parsing and the standard output templates.
//!
//! The engine never interprets scripts; it only needs to take them apart
//! into opcodes and data pushes, recognize the five standard scriptPubKey
//! templates, and emit minimal data pushes when assembling a scriptSig.

/// An empty stack push.
pub const OP_0: u8 = 0x00;
/// Next byte is the push length.
pub const OP_PUSHDATA1: u8 = 0x4c;
/// Next two bytes (LE) are the push length.
pub const OP_PUSHDATA2: u8 = 0x4d;
/// Next four bytes (LE) are the push length.
pub const OP_PUSHDATA4: u8 = 0x4e;
/// Pushes -1.
pub const OP_1NEGATE: u8 = 0x4f;
/// Pushes 1; witness version 1 in a scriptPubKey.
pub const OP_1: u8 = 0x51;
/// Pushes 16; the highest witness version.
pub const OP_16: u8 = 0x60;
/// Duplicates the top stack item.
pub const OP_DUP: u8 = 0x76;
/// Equality check.
pub const OP_EQUAL: u8 = 0x87;
/// Equality check that aborts on mismatch.
pub const OP_EQUALVERIFY: u8 = 0x88;
/// RIPEMD160(SHA256(x)) of the top stack item.
pub const OP_HASH160: u8 = 0xa9;
/// Signature check.
pub const OP_CHECKSIG: u8 = 0xac;

/// One parsed script element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element<'a> {
    /// A non-push opcode.
    Op(u8),
    /// A data push; `opcode` is the leading byte (raw length or
    /// `OP_PUSHDATA{1,2,4}`).
    Push {
        /// Leading opcode byte of the push.
        opcode: u8,
        /// The pushed bytes.
        data: &'a [u8],
    },
}

impl<'a> Element<'a> {
    /// The leading opcode byte of this element.
    pub fn opcode(&self) -> u8 {
        match *self {
            Element::Op(op) => op,
            Element::Push { opcode, .. } => opcode,
        }
    }

    /// The pushed data, if this element is a non-empty push.
    pub fn data(&self) -> Option<&'a [u8]> {
        match *self {
            Element::Push { data, .. } if !data.is_empty() => Some(data),
            _ => None,
        }
    }
}

/// Parses `script` into its element sequence.
///
/// Opcodes up to [`OP_PUSHDATA4`] push their raw length; the `OP_PUSHDATA`
/// forms decode their length prefix. Returns `None` when a push runs past
/// the end of the script.
pub fn elements(script: &[u8]) -> Option<Vec<Element<'_>>> {
    let mut elems = Vec::new();
    let mut off = 0;

    while off < script.len() {
        let opcode = script[off];
        off += 1;

        let len = match opcode {
            OP_PUSHDATA1 => {
                let l = *script.get(off)? as usize;
                off += 1;
                l
            }
            OP_PUSHDATA2 => {
                let b = script.get(off..off + 2)?;
                off += 2;
                u16::from_le_bytes([b[0], b[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let b = script.get(off..off + 4)?;
                off += 4;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            op if op <= OP_PUSHDATA4 => op as usize,
            op => {
                elems.push(Element::Op(op));
                continue;
            }
        };

        let data = script.get(off..off + len)?;
        off += len;
        elems.push(Element::Push { opcode, data });
    }

    Some(elems)
}

/// Appends a minimal data push of `data` to `script`.
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    let len = data.len();
    if len < OP_PUSHDATA1 as usize {
        script.push(len as u8);
    } else if len < u8::MAX as usize {
        script.push(OP_PUSHDATA1);
        script.push(len as u8);
    } else if len < u16::MAX as usize {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(len as u16).to_le_bytes());
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(len as u32).to_le_bytes());
    }
    script.extend_from_slice(data);
}

/// Reassembles an element sequence into script bytes.
pub fn assemble(elems: &[Element<'_>]) -> Vec<u8> {
    let mut script = Vec::new();
    for elem in elems {
        match *elem {
            Element::Op(op) => script.push(op),
            Element::Push { opcode, data } => {
                script.push(opcode);
                match opcode {
                    OP_PUSHDATA1 => script.push(data.len() as u8),
                    OP_PUSHDATA2 => script.extend_from_slice(&(data.len() as u16).to_le_bytes()),
                    OP_PUSHDATA4 => script.extend_from_slice(&(data.len() as u32).to_le_bytes()),
                    _ => {}
                }
                script.extend_from_slice(data);
            }
        }
    }
    script
}

/// The standard output templates the wallet recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template<'a> {
    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`.
    P2pkh(&'a [u8]),
    /// `OP_HASH160 <20> OP_EQUAL`.
    P2sh(&'a [u8]),
    /// `<33|65 byte pubkey> OP_CHECKSIG`.
    P2pk(&'a [u8]),
    /// `OP_0|OP_1..OP_16 <2..40 byte program>`; the whole scriptPubKey is
    /// carried since bech32 encodes it verbatim.
    Witness {
        /// Witness version, 0 through 16.
        version: u8,
        /// The witness program bytes.
        program: &'a [u8],
    },
}

/// Matches `elems` against the standard scriptPubKey templates.
pub fn recognize<'a>(elems: &[Element<'a>]) -> Option<Template<'a>> {
    match elems {
        [Element::Op(OP_DUP), Element::Op(OP_HASH160), hash, Element::Op(OP_EQUALVERIFY), Element::Op(OP_CHECKSIG)]
            if hash.data().map(<[u8]>::len) == Some(20) =>
            Some(Template::P2pkh(hash.data().expect("20 byte push"))),
        [Element::Op(OP_HASH160), hash, Element::Op(OP_EQUAL)]
            if hash.data().map(<[u8]>::len) == Some(20) =>
            Some(Template::P2sh(hash.data().expect("20 byte push"))),
        [pubkey, Element::Op(OP_CHECKSIG)]
            if matches!(pubkey.data().map(<[u8]>::len), Some(33) | Some(65)) =>
            Some(Template::P2pk(pubkey.data().expect("pubkey push"))),
        [version, program] => {
            let data = program.data()?;
            match version.opcode() {
                OP_0 if data.len() == 20 || data.len() == 32 =>
                    Some(Template::Witness { version: 0, program: data }),
                op if (OP_1..=OP_16).contains(&op) && (2..=40).contains(&data.len()) =>
                    Some(Template::Witness { version: op - OP_1 + 1, program: data }),
                _ => None,
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_p2pkh_template() {
        let mut script = vec![OP_DUP, OP_HASH160];
        push_data(&mut script, &[0x11; 20]);
        script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);

        let elems = elements(&script).unwrap();
        assert_eq!(elems.len(), 5);
        assert_eq!(recognize(&elems), Some(Template::P2pkh(&[0x11; 20])));
        assert_eq!(assemble(&elems), script);
    }

    #[test]
    fn parse_witness_template() {
        let mut script = vec![OP_0];
        push_data(&mut script, &[0x22; 20]);

        let elems = elements(&script).unwrap();
        assert_eq!(recognize(&elems), Some(Template::Witness { version: 0, program: &[0x22; 20] }));
    }

    #[test]
    fn truncated_push_rejects() {
        assert_eq!(elements(&[0x05, 0x01, 0x02]), None);
        assert_eq!(elements(&[OP_PUSHDATA1]), None);
        assert_eq!(elements(&[OP_PUSHDATA2, 0x10, 0x00, 0xaa]), None);
    }

    #[test]
    fn pushdata_forms() {
        let mut script = Vec::new();
        push_data(&mut script, &[0xaa; 0x4b]);
        assert_eq!(script[0], 0x4b);

        let mut script = Vec::new();
        push_data(&mut script, &[0xaa; 0x4c]);
        assert_eq!(&script[..2], &[OP_PUSHDATA1, 0x4c]);

        let mut script = Vec::new();
        push_data(&mut script, &[0xaa; 0x100]);
        assert_eq!(&script[..3], &[OP_PUSHDATA2, 0x00, 0x01]);
    }

    proptest! {
        #[test]
        fn elements_reassemble(chunks in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 0..80), 0..8,
        )) {
            let mut script = Vec::new();
            for chunk in &chunks {
                push_data(&mut script, chunk);
            }
            let elems = elements(&script).unwrap();
            prop_assert_eq!(assemble(&elems), script);
        }
    }
}
