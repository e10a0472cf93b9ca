//! Value address encoding for key index records
//!
//! Every key index record ends in an address slot pointing at the key's value
//! in the log. Two slot widths exist: records allocated while the log was
//! small carry a 4-byte slot, later records an 8-byte one. The encoding packs
//! three states into those bytes and must stay decodable without knowing the
//! slot width in advance:
//!
//! Narrow form (4 bytes, big-endian i32):
//!   0 or -1          - no mapping
//!   negative raw     - small address, offset = -raw - 1
//!
//! Wide form (8 bytes, big-endian u64):
//!   leading i32 0/-1 - no mapping
//!   leading i32 < 0  - small address stored in the first 4 bytes
//!   otherwise        - large address with bit 62 set as the "in use" marker,
//!                      offset = raw & !(1 << 62)
//!
//! The in-use bit distinguishes a genuine large value whose high half happens
//! to be zero from the null sentinel. Offsets at or above bit 62 are not
//! representable; the log would have to exceed 4 EiB first.
//!
//! `Small(0)` encodes to raw -1 and therefore aliases the null sentinel. That
//! offset never occurs in practice: the value log starts with a file header,
//! so every real address is at least the header size.

/// Marker bit set on every stored large-form address.
const USED_LARGE_VALUE_MASK: u64 = 1 << 62;

/// Negative-form shift: a small offset N is stored as -(N + 1) so that
/// offset 0 does not collide with the raw-zero null sentinel.
const POSITIVE_VALUE_SHIFT: i64 = 1;

/// Decoded state of a record's address slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRef {
    /// The key has no current value
    NoMapping,
    /// Value log offset that fits the narrow 4-byte form
    Small(u32),
    /// Value log offset stored in the wide 8-byte form
    Large(u64),
}

impl ValueRef {
    /// Log offset this reference points at, if any.
    pub fn addr(&self) -> Option<u64> {
        match self {
            ValueRef::NoMapping => None,
            ValueRef::Small(offset) => Some(*offset as u64),
            ValueRef::Large(offset) => Some(*offset),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ValueRef::NoMapping)
    }

    /// Serialize into an address slot. The slot must be 4 or 8 bytes; the
    /// wide form requires 8. Returns false if the reference does not fit,
    /// which callers treat as "re-enumerate first".
    #[must_use]
    pub fn encode(&self, slot: &mut [u8]) -> bool {
        debug_assert!(slot.len() == 4 || slot.len() == 8);
        match self {
            ValueRef::NoMapping => {
                slot.fill(0);
                true
            }
            ValueRef::Small(offset) => {
                let raw = -((*offset as i64) + POSITIVE_VALUE_SHIFT) as i32;
                slot[..4].copy_from_slice(&raw.to_be_bytes());
                if slot.len() == 8 {
                    slot[4..].fill(0);
                }
                true
            }
            ValueRef::Large(offset) => {
                if slot.len() < 8 || offset & (USED_LARGE_VALUE_MASK | (1 << 63)) != 0 {
                    return false;
                }
                let raw = offset | USED_LARGE_VALUE_MASK;
                slot[..8].copy_from_slice(&raw.to_be_bytes());
                true
            }
        }
    }

    /// Deserialize from an address slot (4 or 8 bytes).
    pub fn decode(slot: &[u8]) -> ValueRef {
        debug_assert!(slot.len() == 4 || slot.len() == 8);
        let head = i32::from_be_bytes([slot[0], slot[1], slot[2], slot[3]]);
        if head == 0 || head == -(POSITIVE_VALUE_SHIFT as i32) {
            return ValueRef::NoMapping;
        }
        if head < 0 {
            return ValueRef::Small((-(head as i64) - POSITIVE_VALUE_SHIFT) as u32);
        }
        // Wide form: leading int is the high half with the in-use bit set.
        let raw = u64::from_be_bytes([
            slot[0], slot[1], slot[2], slot[3], slot[4], slot[5], slot[6], slot[7],
        ]);
        ValueRef::Large(raw & !USED_LARGE_VALUE_MASK)
    }
}

/// Whether `offset` may be written in the narrow form. Re-enumeration must be
/// structurally possible for the map, and the shifted offset must still fit a
/// signed 32-bit integer (`limit` defaults to `i32::MAX`, configurable so the
/// boundary can be exercised).
pub fn can_use_small_address(can_reenumerate: bool, offset: u64, limit: u64) -> bool {
    can_reenumerate && offset + (POSITIVE_VALUE_SHIFT as u64) < limit
}
