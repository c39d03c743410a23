#![forbid(unsafe_code)]
//! Domain types shared by every crate in the bucket LRU workspace.
//!
//! The LRU index is a persisted, sorted *set* of keys. A key's position packs
//! the logical LRU it belongs to, the ordering time, and the bucket it names:
//!
//! | Field | Bits | Meaning |
//! |-------|------|---------|
//! | `inode[63:48]` | 16 | [`LruId`] |
//! | `inode[47:0]` | 48 | [`LruTime`] |
//! | `offset[63:48]` | 16 | device index of the [`BucketRef`] |
//! | `offset[47:0]` | 48 | bucket index of the [`BucketRef`] |
//!
//! The packing itself lives in `lru-codec`; this crate only carries the
//! unit-bearing wrappers and their range rules.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of bits of an encoded position reserved for the ordering time.
pub const LRU_TIME_BITS: u32 = 48;

/// Largest representable ordering time.
pub const LRU_TIME_MAX: u64 = (1_u64 << LRU_TIME_BITS) - 1;

/// Number of bits of an encoded offset reserved for the bucket index.
pub const BUCKET_BITS: u32 = 48;

/// Largest representable bucket index.
pub const BUCKET_MAX: u64 = (1_u64 << BUCKET_BITS) - 1;

/// Upper bound (exclusive) on device indices a host may register.
pub const MAX_DEVICES: u16 = 256;

// ── Transactions ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CommitSeq(pub u64);

// ── LRU identity ────────────────────────────────────────────────────────────

/// Which logical ordering an index entry belongs to.
///
/// The read LRU is per device (its id is the device index); the
/// fragmentation LRU is one global ordering under a reserved id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LruId(pub u16);

impl LruId {
    /// Reserved id of the global fragmentation LRU.
    pub const FRAGMENTATION: Self = Self(u16::MAX);

    /// Read-recency LRU of device `dev`.
    #[must_use]
    pub fn read(dev: u16) -> Self {
        Self(dev)
    }

    #[must_use]
    pub fn kind(self) -> LruKind {
        if self == Self::FRAGMENTATION {
            LruKind::Fragmentation
        } else {
            LruKind::Read
        }
    }
}

impl fmt::Display for LruId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The policy an [`LruId`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LruKind {
    /// Orders cached buckets by last-read time.
    Read,
    /// Orders movable buckets by how little live data they hold.
    Fragmentation,
}

impl fmt::Display for LruKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Fragmentation => write!(f, "fragmentation"),
        }
    }
}

// ── Ordering time ───────────────────────────────────────────────────────────

/// Ordering value of an LRU entry. Zero means "not a member".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LruTime(pub u64);

impl LruTime {
    /// The "absent" sentinel. Never persisted as a key.
    pub const NONE: Self = Self(0);

    /// Clamp a raw policy value into the encodable range.
    #[must_use]
    pub fn clamped(raw: u64) -> Self {
        Self(raw.min(LRU_TIME_MAX))
    }

    /// Whether this time denotes membership in an LRU.
    #[must_use]
    pub fn is_member(self) -> bool {
        self.0 != 0
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LruTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Buckets ─────────────────────────────────────────────────────────────────

/// One allocation unit: `(device index, bucket index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BucketRef {
    pub dev: u16,
    pub bucket: u64,
}

impl BucketRef {
    /// Create a bucket reference if `bucket` fits the packed encoding.
    pub fn new(dev: u16, bucket: u64) -> Result<Self, KeyError> {
        if bucket > BUCKET_MAX {
            return Err(KeyError::InvalidField {
                field: "bucket",
                reason: "exceeds 48-bit bucket range",
            });
        }
        Ok(Self { dev, bucket })
    }

    /// First bucket of device `dev`, used as a scan start.
    #[must_use]
    pub fn device_start(dev: u16) -> Self {
        Self { dev, bucket: 0 }
    }

    /// The bucket after this one, in `(dev, bucket)` order.
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        if self.bucket < BUCKET_MAX {
            Some(Self {
                dev: self.dev,
                bucket: self.bucket + 1,
            })
        } else {
            self.dev.checked_add(1).map(Self::device_start)
        }
    }
}

impl fmt::Display for BucketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev, self.bucket)
    }
}

// ── Raw keys ────────────────────────────────────────────────────────────────

/// Position of a key in the LRU index, ordered `(inode, offset)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct KeyPos {
    pub inode: u64,
    pub offset: u64,
}

impl KeyPos {
    pub const MIN: Self = Self {
        inode: 0,
        offset: 0,
    };
    pub const MAX: Self = Self {
        inode: u64::MAX,
        offset: u64::MAX,
    };

    #[must_use]
    pub fn new(inode: u64, offset: u64) -> Self {
        Self { inode, offset }
    }

    /// The smallest position strictly greater than `self`.
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        if let Some(offset) = self.offset.checked_add(1) {
            return Some(Self {
                inode: self.inode,
                offset,
            });
        }
        self.inode.checked_add(1).map(|inode| Self { inode, offset: 0 })
    }
}

impl fmt::Display for KeyPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

/// Presence tag of a raw index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Membership marker.
    Set,
    /// Tombstone: the position is not a member.
    Deleted,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Set => write!(f, "set"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A raw key read from, or queued for, the LRU index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LruKey {
    pub pos: KeyPos,
    pub key_type: KeyType,
}

impl LruKey {
    #[must_use]
    pub fn set(pos: KeyPos) -> Self {
        Self {
            pos,
            key_type: KeyType::Set,
        }
    }

    #[must_use]
    pub fn deleted(pos: KeyPos) -> Self {
        Self {
            pos,
            key_type: KeyType::Deleted,
        }
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.key_type == KeyType::Set
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

/// Structural failures detected while encoding or validating LRU keys.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("lru time {time} exceeds 48-bit time range")]
    TimeOutOfRange { time: u64 },
    #[error("lru entry at time=0 at {pos}")]
    ZeroTime { pos: KeyPos },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn lru_id_kinds() {
        assert_eq!(LruId::read(0).kind(), LruKind::Read);
        assert_eq!(LruId::read(MAX_DEVICES - 1).kind(), LruKind::Read);
        assert_eq!(LruId::FRAGMENTATION.kind(), LruKind::Fragmentation);
    }

    #[test]
    fn time_clamps_to_encodable_range() {
        assert_eq!(LruTime::clamped(u64::MAX), LruTime(LRU_TIME_MAX));
        assert_eq!(LruTime::clamped(7), LruTime(7));
        assert!(!LruTime::NONE.is_member());
        assert!(LruTime(1).is_member());
    }

    #[test]
    fn bucket_range_is_enforced() {
        assert!(BucketRef::new(3, BUCKET_MAX).is_ok());
        let err = BucketRef::new(3, BUCKET_MAX + 1).unwrap_err();
        assert!(matches!(err, KeyError::InvalidField { field: "bucket", .. }));
    }

    #[test]
    fn bucket_successor_rolls_into_next_device() {
        let last = BucketRef::new(1, BUCKET_MAX).unwrap();
        assert_eq!(last.successor(), Some(BucketRef::device_start(2)));
        let end = BucketRef {
            dev: u16::MAX,
            bucket: BUCKET_MAX,
        };
        assert_eq!(end.successor(), None);
    }

    #[test]
    fn pos_successor_carries_into_inode() {
        let pos = KeyPos::new(4, u64::MAX);
        assert_eq!(pos.successor(), Some(KeyPos::new(5, 0)));
        assert_eq!(KeyPos::MAX.successor(), None);
    }

    #[test]
    fn key_display() {
        assert_eq!(KeyType::Set.to_string(), "set");
        assert_eq!(LruKind::Fragmentation.to_string(), "fragmentation");
        assert_eq!(
            KeyError::ZeroTime {
                pos: KeyPos::new(0, 9)
            }
            .to_string(),
            "lru entry at time=0 at 0:9"
        );
    }

    proptest! {
        #[test]
        fn successor_is_strictly_greater(inode in any::<u64>(), offset in any::<u64>()) {
            let pos = KeyPos::new(inode, offset);
            if let Some(next) = pos.successor() {
                prop_assert!(next > pos);
            } else {
                prop_assert_eq!(pos, KeyPos::MAX);
            }
        }
    }
}
