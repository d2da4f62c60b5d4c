//! Mutable byte buffer with typed endian-aware integer access.
//!
//! `ByteArray` is the substrate every higher ELF structure is built on:
//! section contents, segment blobs, and the final output image are all
//! `ByteArray`s. Integer get/set take an explicit `Endian` so the same
//! model code serves little- and big-endian targets.

use crate::elf::Endian;
use crate::error::{ElfError, Result};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ByteArray {
    data: Vec<u8>,
}

impl ByteArray {
    pub fn new() -> Self {
        ByteArray { data: Vec::new() }
    }

    /// A zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        ByteArray { data: vec![0; len] }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        ByteArray { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(ElfError::OutOfRange { offset, len, size: self.data.len() }),
        }
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append `len` zero bytes.
    pub fn append_zeros(&mut self, len: usize) {
        self.data.resize(self.data.len() + len, 0);
    }

    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// Read an unsigned integer of `len` bytes (1..=8) at `offset`.
    pub fn get_int(&self, offset: usize, len: usize, endian: Endian) -> Result<u64> {
        self.check(offset, len)?;
        let bytes = &self.data[offset..offset + len];
        let mut value: u64 = 0;
        match endian {
            Endian::Little => {
                for (i, b) in bytes.iter().enumerate() {
                    value |= (*b as u64) << (8 * i);
                }
            }
            Endian::Big => {
                for b in bytes {
                    value = (value << 8) | *b as u64;
                }
            }
        }
        Ok(value)
    }

    /// Write the low `len` bytes (1..=8) of `value` at `offset`.
    pub fn set_int(&mut self, offset: usize, len: usize, value: u64, endian: Endian) -> Result<()> {
        self.check(offset, len)?;
        for i in 0..len {
            let byte = (value >> (8 * i)) as u8;
            let pos = match endian {
                Endian::Little => offset + i,
                Endian::Big => offset + len - 1 - i,
            };
            self.data[pos] = byte;
        }
        Ok(())
    }
}

// ── Free read/write helpers for the structure codecs ─────────────────────────
//
// These operate on plain slices during parsing, before any model object
// exists. Callers validate bounds up front (the codecs check total record
// length once, then index freely).

pub fn read_u16(data: &[u8], offset: usize, endian: Endian) -> u16 {
    let b = [data[offset], data[offset + 1]];
    match endian {
        Endian::Little => u16::from_le_bytes(b),
        Endian::Big => u16::from_be_bytes(b),
    }
}

pub fn read_u32(data: &[u8], offset: usize, endian: Endian) -> u32 {
    let b = [data[offset], data[offset + 1], data[offset + 2], data[offset + 3]];
    match endian {
        Endian::Little => u32::from_le_bytes(b),
        Endian::Big => u32::from_be_bytes(b),
    }
}

pub fn read_u64(data: &[u8], offset: usize, endian: Endian) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[offset..offset + 8]);
    match endian {
        Endian::Little => u64::from_le_bytes(b),
        Endian::Big => u64::from_be_bytes(b),
    }
}

pub fn write_u16(out: &mut Vec<u8>, value: u16, endian: Endian) {
    match endian {
        Endian::Little => out.extend_from_slice(&value.to_le_bytes()),
        Endian::Big => out.extend_from_slice(&value.to_be_bytes()),
    }
}

pub fn write_u32(out: &mut Vec<u8>, value: u32, endian: Endian) {
    match endian {
        Endian::Little => out.extend_from_slice(&value.to_le_bytes()),
        Endian::Big => out.extend_from_slice(&value.to_be_bytes()),
    }
}

pub fn write_u64(out: &mut Vec<u8>, value: u64, endian: Endian) {
    match endian {
        Endian::Little => out.extend_from_slice(&value.to_le_bytes()),
        Endian::Big => out.extend_from_slice(&value.to_be_bytes()),
    }
}

/// Read a NUL-terminated string from `data` starting at `offset`.
pub fn read_cstr(data: &[u8], offset: usize) -> String {
    let end = data[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| offset + p)
        .unwrap_or(data.len());
    String::from_utf8_lossy(&data[offset..end]).into_owned()
}

pub fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    value.div_ceil(align) * align
}

/// Advance `value` to the smallest offset congruent to `target` modulo `align`.
/// ELF requires `p_offset % p_align == p_vaddr % p_align` for loadable segments.
pub fn align_congruent(value: u64, target: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    let rem = target % align;
    let base = value / align * align + rem;
    if base >= value {
        base
    } else {
        base + align
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip_both_endians() {
        let mut b = ByteArray::zeroed(8);
        b.set_int(0, 4, 0x1234_5678, Endian::Little).unwrap();
        assert_eq!(b.as_slice()[..4], [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(b.get_int(0, 4, Endian::Little).unwrap(), 0x1234_5678);

        b.set_int(4, 4, 0x1234_5678, Endian::Big).unwrap();
        assert_eq!(b.as_slice()[4..], [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(b.get_int(4, 4, Endian::Big).unwrap(), 0x1234_5678);
    }

    #[test]
    fn out_of_range_is_an_error() {
        let b = ByteArray::zeroed(4);
        assert!(matches!(
            b.get_int(2, 4, Endian::Little),
            Err(ElfError::OutOfRange { .. })
        ));
        let mut b = ByteArray::zeroed(4);
        assert!(b.set_bytes(3, &[1, 2]).is_err());
        // offset + len wrapping around usize is still out of range
        assert!(matches!(
            b.get_int(usize::MAX - 2, 4, Endian::Little),
            Err(ElfError::OutOfRange { .. })
        ));
        assert!(b.set_int(usize::MAX, 8, 0, Endian::Little).is_err());
    }

    #[test]
    fn append_and_zero_fill() {
        let mut b = ByteArray::new();
        b.append(&[1, 2, 3]);
        b.append_zeros(2);
        assert_eq!(b.as_slice(), &[1, 2, 3, 0, 0]);
    }

    #[test]
    fn congruent_alignment() {
        // 0x1000-aligned LOAD at vaddr 0xa0080000: offset must end in 0x000
        assert_eq!(align_congruent(0x74, 0xa008_0000, 0x1000), 0x1000);
        // already congruent
        assert_eq!(align_congruent(0x2034, 0x8034, 0x1000), 0x2034);
        assert_eq!(align_up(0x21, 4), 0x24);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn cstr_reads_stop_at_nul() {
        let data = b".text\0.data\0";
        assert_eq!(read_cstr(data, 0), ".text");
        assert_eq!(read_cstr(data, 6), ".data");
    }
}
