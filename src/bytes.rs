//! Byte-buffer primitives shared by every patch variant: wildcarded
//! substring search, little-endian dword fields, and the UTF-16 encoding
//! used by string patches.

use byteorder::{ByteOrder, LittleEndian};

use crate::{Error, Result};

/// Finds the leftmost offset where `pattern` matches `haystack`, treating
/// pattern bytes equal to `wildcard` as matching anything.
///
/// An empty pattern, or one longer than the haystack, never matches.
pub fn find(haystack: &[u8], pattern: &[u8], wildcard: Option<u8>) -> Option<usize> {
    if pattern.is_empty() || haystack.len() < pattern.len() {
        return None;
    }
    let end = haystack.len() - pattern.len();
    (0..=end).find(|&pos| matches_at(&haystack[pos..], pattern, wildcard))
}

fn matches_at(window: &[u8], pattern: &[u8], wildcard: Option<u8>) -> bool {
    pattern
        .iter()
        .zip(window)
        .all(|(&p, &b)| p == b || Some(p) == wildcard)
}

/// A byte pattern plus an optional wildcard sentinel. `wildcard: None`
/// means every byte is literal.
///
/// Descriptors are built once when the database is parsed and shared
/// read-only across any number of target files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<u8>,
    wildcard: Option<u8>,
}

impl Pattern {
    pub fn new(bytes: Vec<u8>, wildcard: Option<u8>) -> Pattern {
        Pattern { bytes, wildcard }
    }

    /// Builds a pattern from the stored encoding, where a sentinel equal to
    /// the first pattern byte marks a pattern with no wildcards at all.
    pub(crate) fn from_raw(bytes: Vec<u8>, wildcard: u8) -> Pattern {
        let wildcard = match bytes.first() {
            Some(&first) if first != wildcard => Some(wildcard),
            _ => None,
        };
        Pattern { bytes, wildcard }
    }

    /// Copies `template` with every 4-byte field in `fields` replaced by a
    /// freshly chosen sentinel, a byte value no fixed position uses.
    ///
    /// Fails when the fixed positions already use all 256 values.
    pub(crate) fn masked(template: &[u8], fields: &[u16]) -> Result<Pattern> {
        let mut in_field = vec![false; template.len()];
        for &field in fields {
            for flag in &mut in_field[field as usize..field as usize + 4] {
                *flag = true;
            }
        }
        let mut used = [false; 256];
        for (&b, _) in template.iter().zip(&in_field).filter(|&(_, &f)| !f) {
            used[b as usize] = true;
        }
        let sentinel = used.iter().position(|&u| !u).ok_or(Error::NoWildcardValue)? as u8;
        let mut bytes = template.to_vec();
        for (b, _) in bytes.iter_mut().zip(&in_field).filter(|&(_, &f)| f) {
            *b = sentinel;
        }
        Ok(Pattern {
            bytes,
            wildcard: Some(sentinel),
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn wildcard(&self) -> Option<u8> {
        self.wildcard
    }

    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        find(haystack, &self.bytes, self.wildcard)
    }

    /// Offsets of the wildcard positions, in order.
    pub fn wildcard_positions(&self) -> impl Iterator<Item = usize> + '_ {
        let wildcard = self.wildcard;
        self.bytes
            .iter()
            .enumerate()
            .filter(move |&(_, &b)| Some(b) == wildcard)
            .map(|(i, _)| i)
    }
}

pub(crate) fn get_dword(data: &[u8], pos: u16) -> u32 {
    LittleEndian::read_u32(&data[pos as usize..pos as usize + 4])
}

pub(crate) fn set_dword(data: &mut [u8], pos: u16, value: u32) {
    LittleEndian::write_u32(&mut data[pos as usize..pos as usize + 4], value);
}

/// Number of UTF-16 units `s` encodes to; string slots are sized in units,
/// not bytes or chars.
pub(crate) fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Encodes `value` as NUL-terminated UTF-16LE. Given a slot size in UTF-16
/// units, the result is zero-padded to cover the whole slot plus its
/// terminator; the caller guarantees the value fits the slot.
pub(crate) fn encode_utf16(value: &str, slot_units: Option<usize>) -> Vec<u8> {
    let mut out: Vec<u8> = value.encode_utf16().flat_map(u16::to_le_bytes).collect();
    let units = slot_units.unwrap_or(out.len() / 2);
    out.resize((units + 1) * 2, 0);
    out
}

/// Reads a NUL-terminated UTF-16LE string starting at `offset`; an
/// unterminated string stops at the buffer end.
pub(crate) fn read_utf16(data: &[u8], offset: usize) -> Option<String> {
    let tail = data.get(offset..)?;
    let units: Vec<u16> = tail
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    Some(String::from_utf16_lossy(&units))
}
