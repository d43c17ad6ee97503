// SPDX-License-Identifier: CC0-1.0

//! Consensus byte plumbing: VarInt and little-endian field codecs.
//!
//! Everything on the Litecoin wire is little-endian with VarInt-prefixed
//! vectors. The reader is a plain cursor over a byte slice; short input is
//! always [`CodecError::UnexpectedEof`], never a panic.

use bitcoin_hashes::sha256d;
use bitcoin_hashes::Hash as _;

use crate::CodecError;

/// Maximum value encodable as a single literal byte.
pub const VARINT_MAX_U8: u64 = 0xfc;
const VARINT_U16_HEADER: u8 = 0xfd;
const VARINT_U32_HEADER: u8 = 0xfe;
const VARINT_U64_HEADER: u8 = 0xff;

/// Appends `value` to `buf` in VarInt form.
pub fn write_varint(buf: &mut Vec<u8>, value: u64) {
    if value <= VARINT_MAX_U8 {
        buf.push(value as u8);
    } else if value <= u64::from(u16::MAX) {
        buf.push(VARINT_U16_HEADER);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= u64::from(u32::MAX) {
        buf.push(VARINT_U32_HEADER);
        buf.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        buf.push(VARINT_U64_HEADER);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

/// Number of bytes [`write_varint`] emits for `value`.
pub fn varint_size(value: u64) -> usize {
    if value <= VARINT_MAX_U8 {
        1
    } else if value <= u64::from(u16::MAX) {
        3
    } else if value <= u64::from(u32::MAX) {
        5
    } else {
        9
    }
}

/// Appends a VarInt length prefix followed by `bytes`.
pub fn write_var_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Cursor over a byte slice for decoding consensus data.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    /// Creates a cursor at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self { Cursor { data, position: 0 } }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize { self.position }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize { self.data.len() - self.position }

    /// True once every byte has been consumed.
    pub fn is_empty(&self) -> bool { self.remaining() == 0 }

    /// Takes the next `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.data[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8, CodecError> { Ok(self.read_bytes(1)?[0]) }

    /// Reads a little-endian u16.
    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Reads a little-endian u32.
    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a little-endian u64.
    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.read_bytes(8)?;
        let mut le = [0u8; 8];
        le.copy_from_slice(b);
        Ok(u64::from_le_bytes(le))
    }

    /// Reads a 32-byte hash in wire (little-endian) order.
    pub fn read_hash(&mut self) -> Result<sha256d::Hash, CodecError> {
        let b = self.read_bytes(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(b);
        Ok(sha256d::Hash::from_byte_array(arr))
    }

    /// Reads a VarInt.
    pub fn read_varint(&mut self) -> Result<u64, CodecError> {
        let header = self.read_u8()?;
        match header {
            VARINT_U16_HEADER => Ok(u64::from(self.read_u16()?)),
            VARINT_U32_HEADER => Ok(u64::from(self.read_u32()?)),
            VARINT_U64_HEADER => self.read_u64(),
            n => Ok(u64::from(n)),
        }
    }

    /// Reads a VarInt length prefix bounded by `max`, then that many bytes.
    pub fn read_var_bytes(&mut self, max: usize) -> Result<&'a [u8], CodecError> {
        let len = self.read_varint()?;
        if len > max as u64 {
            return Err(CodecError::Oversize { claimed: len as usize, max });
        }
        self.read_bytes(len as usize)
    }

}

/// Appends a 32-byte hash in wire order.
pub fn write_hash(buf: &mut Vec<u8>, hash: &sha256d::Hash) {
    buf.extend_from_slice(hash.as_ref());
}
