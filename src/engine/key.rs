//! Internal keys, sequence numbers, and rollback visibility.
//!
//! Every cell stored by an engine is addressed by an [`InternalKey`]:
//! the raw user key plus the write's sequence number and kind. Ordering is
//! user key **ascending**, then sequence **descending** (newer first), then
//! kind descending so a value sorts before a tombstone written at the same
//! sequence.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::encoding::{Decode, Encode, EncodingError};

/// Monotonically increasing per-engine write counter.
pub type SequenceNumber = u64;

/// Upper bound used when a read carries no snapshot ("read latest").
pub const MAX_SEQUENCE: SequenceNumber = u64::MAX >> 8;

/// What a stored entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ValueKind {
    /// Point tombstone.
    Deletion = 0,
    /// Live value.
    Value = 1,
}

impl ValueKind {
    /// Decode from the low byte of an internal-key trailer.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Deletion),
            1 => Some(Self::Value),
            _ => None,
        }
    }
}

/// The full key under which one cell version is stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    /// Opaque user key (row key + column coordinates, already packed by the
    /// tablet layer).
    pub user_key: Vec<u8>,

    /// Sequence stamped by the engine's write path.
    pub sequence: SequenceNumber,

    /// Value or tombstone.
    pub kind: ValueKind,
}

impl InternalKey {
    /// Build a key for a stored entry.
    pub fn new(user_key: impl Into<Vec<u8>>, sequence: SequenceNumber, kind: ValueKind) -> Self {
        Self {
            user_key: user_key.into(),
            sequence,
            kind,
        }
    }

    /// The largest key sorting at-or-before every entry for `user_key`
    /// visible at `snapshot`. Used as a seek target.
    pub fn seek_to(user_key: impl Into<Vec<u8>>, snapshot: SequenceNumber) -> Self {
        Self {
            user_key: user_key.into(),
            sequence: snapshot,
            kind: ValueKind::Value,
        }
    }

    /// Serialize as `user_key || trailer` where the 8-byte little-endian
    /// trailer packs `(sequence << 8) | kind`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.user_key.len() + 8);
        out.extend_from_slice(&self.user_key);
        let trailer = (self.sequence << 8) | self.kind as u64;
        out.extend_from_slice(&trailer.to_le_bytes());
        out
    }

    /// Parse a key serialized by [`InternalKey::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, EncodingError> {
        if bytes.len() < 8 {
            return Err(EncodingError::UnexpectedEof {
                needed: 8,
                available: bytes.len(),
            });
        }
        let split = bytes.len() - 8;
        let mut trailer_bytes = [0u8; 8];
        trailer_bytes.copy_from_slice(&bytes[split..]);
        let trailer = u64::from_le_bytes(trailer_bytes);
        let kind = ValueKind::from_u8((trailer & 0xFF) as u8).ok_or(EncodingError::InvalidTag {
            tag: (trailer & 0xFF) as u32,
            type_name: "ValueKind",
        })?;
        Ok(Self {
            user_key: bytes[..split].to_vec(),
            sequence: trailer >> 8,
            kind,
        })
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.kind.cmp(&self.kind))
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Encode for InternalKey {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.encode().encode_to(buf)
    }
}

impl Decode for InternalKey {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, consumed) = Vec::<u8>::decode_from(buf)?;
        Ok((Self::decode(&bytes)?, consumed))
    }
}

/// A point lookup target: user key plus the snapshot it reads at.
#[derive(Debug, Clone)]
pub struct LookupKey {
    /// Key being read.
    pub user_key: Vec<u8>,

    /// Highest sequence the read may observe.
    pub snapshot: SequenceNumber,
}

impl LookupKey {
    /// Lookup at an explicit snapshot.
    pub fn at(user_key: impl Into<Vec<u8>>, snapshot: SequenceNumber) -> Self {
        Self {
            user_key: user_key.into(),
            snapshot,
        }
    }

    /// Lookup of the latest visible version.
    pub fn latest(user_key: impl Into<Vec<u8>>) -> Self {
        Self::at(user_key, MAX_SEQUENCE)
    }
}

/// Rollback windows keyed by the snapshot they were issued against.
///
/// `rollbacks[snapshot] = point` hides every entry with
/// `snapshot < sequence ≤ point` from reads and from compaction retention.
pub type Rollbacks = BTreeMap<SequenceNumber, SequenceNumber>;

/// True when `sequence` falls inside any recorded rollback window.
pub fn is_rolled_back(rollbacks: &Rollbacks, sequence: SequenceNumber) -> bool {
    rollbacks
        .iter()
        .any(|(&snapshot, &point)| snapshot < sequence && sequence <= point)
}
