//! Persistent metadata records kept in the image's slack region, so that a
//! patch can be undone long after the process that applied it is gone.
//!
//! Records are packed from offset 0, each a little-endian `{id: u16,
//! len: u16}` header followed by `len - 4` payload bytes; `len` counts the
//! header. A header with `len < 4` (in practice the zeroed remainder of
//! the region) terminates the list. The region never grows: any operation
//! whose result would not fit fails before touching a byte.

use byteorder::{ByteOrder, LittleEndian};

use crate::{Error, Result};

pub const HEADER_LEN: usize = 4;

struct Found {
    pos: usize,
    len: usize,
}

/// Walks the record list, returning the record with `id` (if present) and
/// the end offset of the last valid record.
fn scan(region: &[u8], id: u16) -> (Option<Found>, usize) {
    let mut pos = 0;
    let mut found = None;
    while pos + HEADER_LEN <= region.len() {
        let rec_id = LittleEndian::read_u16(&region[pos..]);
        let len = LittleEndian::read_u16(&region[pos + 2..]) as usize;
        if len < HEADER_LEN || pos + len > region.len() {
            break;
        }
        if rec_id == id && found.is_none() {
            found = Some(Found { pos, len });
        }
        pos += len;
    }
    (found, pos)
}

/// Payload of the record with `id`.
pub fn get(region: &[u8], id: u16) -> Option<&[u8]> {
    let (found, _) = scan(region, id);
    found.map(|r| &region[r.pos + HEADER_LEN..r.pos + r.len])
}

/// Inserts the record with `id`, or resizes it in place by shifting the
/// records after it. Fails with no partial write when the result would
/// exceed the region.
pub fn set(region: &mut [u8], id: u16, payload: &[u8]) -> Result<()> {
    let new_len = HEADER_LEN + payload.len();
    if new_len > usize::from(u16::MAX) {
        return Err(Error::Capacity);
    }
    let (found, used) = scan(region, id);
    let (pos, old_len) = match found {
        Some(r) => (r.pos, r.len),
        None => (used, 0),
    };
    if used - old_len + new_len > region.len() {
        return Err(Error::Capacity);
    }
    if old_len != 0 && old_len != new_len {
        // open or close the gap, keeping the records behind it intact
        region.copy_within(pos + old_len..used, pos + new_len);
        if new_len < old_len {
            let new_used = used - (old_len - new_len);
            region[new_used..used].fill(0);
        }
    }
    LittleEndian::write_u16(&mut region[pos..], id);
    LittleEndian::write_u16(&mut region[pos + 2..], new_len as u16);
    region[pos + HEADER_LEN..pos + new_len].copy_from_slice(payload);
    Ok(())
}

/// Removes the record with `id`, shifting later records down and zeroing
/// the vacated tail. Removing a missing id does nothing.
pub fn remove(region: &mut [u8], id: u16) {
    let (found, used) = scan(region, id);
    let Some(r) = found else { return };
    region.copy_within(r.pos + r.len..used, r.pos);
    region[used - r.len..used].fill(0);
}
