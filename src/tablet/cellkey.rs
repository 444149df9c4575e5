//! Cell-key packing.
//!
//! A wide-column cell `(row, family, qualifier, timestamp)` is packed into
//! one engine user key so that engine key order groups cells by row, then
//! family, then qualifier, with versions newest-first:
//!
//! ```text
//! packed := row ‖ 0x00 ‖ family_id ‖ qualifier ‖ 0x00 ‖ !timestamp(BE)
//! ```
//!
//! The inverted big-endian timestamp makes a larger (newer) timestamp sort
//! first within a qualifier, and doubles as the trailing timestamp the
//! engine's TTL strategy reads. Row keys must not contain `0x00`; the
//! tablet layer rejects them at the door.

/// Separator between the row and the column coordinates.
const ROW_SEP: u8 = 0x00;

/// Pack one cell coordinate into an engine user key.
pub fn pack(row: &[u8], family_id: u8, qualifier: &[u8], timestamp: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(row.len() + qualifier.len() + 11);
    key.extend_from_slice(row);
    key.push(ROW_SEP);
    key.push(family_id);
    key.extend_from_slice(qualifier);
    key.push(ROW_SEP);
    key.extend_from_slice(&(!timestamp).to_be_bytes());
    key
}

/// Smallest packed key of `row`: the scan lower bound for a row.
pub fn row_lower_bound(row: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(row.len() + 1);
    key.extend_from_slice(row);
    key.push(ROW_SEP);
    key
}

/// Exclusive upper bound covering every packed key of `row`.
pub fn row_upper_bound(row: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(row.len() + 1);
    key.extend_from_slice(row);
    key.push(ROW_SEP + 1);
    key
}

/// A packed cell, decomposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedCell {
    /// Row key.
    pub row: Vec<u8>,

    /// Family id within the owning locality group.
    pub family_id: u8,

    /// Column qualifier.
    pub qualifier: Vec<u8>,

    /// Cell write timestamp, microseconds.
    pub timestamp: u64,
}

/// Decompose a key produced by [`pack`]. Returns `None` on any framing
/// violation.
pub fn unpack(key: &[u8]) -> Option<UnpackedCell> {
    let sep = key.iter().position(|&b| b == ROW_SEP)?;
    let row = key[..sep].to_vec();
    let rest = &key[sep + 1..];
    if rest.len() < 10 {
        return None;
    }
    let family_id = rest[0];
    let qualifier_end = rest.len() - 9;
    if rest[qualifier_end] != ROW_SEP {
        return None;
    }
    let qualifier = rest[1..qualifier_end].to_vec();
    let mut ts_raw = [0u8; 8];
    ts_raw.copy_from_slice(&rest[qualifier_end + 1..]);
    Some(UnpackedCell {
        row,
        family_id,
        qualifier,
        timestamp: !u64::from_be_bytes(ts_raw),
    })
}

/// The row portion of a packed key, without full unpacking.
pub fn row_of(key: &[u8]) -> &[u8] {
    match key.iter().position(|&b| b == ROW_SEP) {
        Some(sep) => &key[..sep],
        None => key,
    }
}

/// True when `row` can be packed unambiguously.
pub fn row_is_packable(row: &[u8]) -> bool {
    !row.is_empty() && !row.contains(&ROW_SEP)
}

/// The smallest packable row strictly greater than `row`; used as a scan
/// resume point after emitting `row` completely.
pub fn row_successor(row: &[u8]) -> Vec<u8> {
    let mut next = row.to_vec();
    next.push(0x01);
    next
}
