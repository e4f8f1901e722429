//! Fixed-width integer serialization.
//!
//! Child page ids are embedded in internal-page record values as 8-byte
//! little-endian integers; header fields use the same helpers.

use bytes::{Buf, BufMut};

/// Width in bytes of an encoded child address.
pub const ADDRESS_WIDTH: usize = 8;

pub fn encode_u64(value: u64) -> [u8; ADDRESS_WIDTH] {
    let mut out = [0u8; ADDRESS_WIDTH];
    (&mut out[..]).put_u64_le(value);
    out
}

/// Decodes the first 8 bytes of `bytes`. Returns `None` when fewer are
/// available.
pub fn decode_u64(mut bytes: &[u8]) -> Option<u64> {
    if bytes.len() < ADDRESS_WIDTH {
        return None;
    }
    Some(bytes.get_u64_le())
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut field = &buf[offset..offset + 4];
    field.get_u32_le()
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    (&mut buf[offset..offset + 4]).put_u32_le(value);
}
