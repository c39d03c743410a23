#![forbid(unsafe_code)]
//! Bucket LRU key codec.
//!
//! Packs `(lru_id, time, bucket)` into a [`KeyPos`] so that a forward scan of
//! the index visits one LRU at a time, oldest entry first:
//!
//! ```text
//! inode  = lru_id << 48 | time
//! offset = dev    << 48 | bucket
//! ```
//!
//! Every function here is pure; the validation hook is the only place that
//! rejects keys read back from storage.

use lru_types::{
    BUCKET_BITS, BUCKET_MAX, BucketRef, KeyError, KeyPos, LRU_TIME_BITS, LRU_TIME_MAX, LruId,
    LruKey, LruTime,
};
use std::fmt;

// ── Bucket packing ──────────────────────────────────────────────────────────

/// Pack a bucket reference into a single index offset.
#[must_use]
pub fn bucket_to_offset(bucket: BucketRef) -> u64 {
    (u64::from(bucket.dev) << BUCKET_BITS) | (bucket.bucket & BUCKET_MAX)
}

/// Unpack an index offset into the bucket it names.
#[must_use]
pub fn offset_to_bucket(offset: u64) -> BucketRef {
    // The shift leaves exactly 16 significant bits.
    #[expect(clippy::cast_possible_truncation)]
    let dev = (offset >> BUCKET_BITS) as u16;
    BucketRef {
        dev,
        bucket: offset & BUCKET_MAX,
    }
}

// ── Position encoding ───────────────────────────────────────────────────────

/// Encode the index position of `bucket` in LRU `lru_id` at `time`.
///
/// Callers persisting a key must not pass [`LruTime::NONE`]; encoding it is
/// permitted so range bounds can be built.
pub fn lru_pos(lru_id: LruId, bucket: BucketRef, time: LruTime) -> Result<KeyPos, KeyError> {
    if time.get() > LRU_TIME_MAX {
        return Err(KeyError::TimeOutOfRange { time: time.get() });
    }
    if bucket.bucket > BUCKET_MAX {
        return Err(KeyError::InvalidField {
            field: "bucket",
            reason: "exceeds 48-bit bucket range",
        });
    }
    Ok(KeyPos {
        inode: (u64::from(lru_id.0) << LRU_TIME_BITS) | time.get(),
        offset: bucket_to_offset(bucket),
    })
}

#[must_use]
pub fn lru_pos_id(pos: KeyPos) -> LruId {
    #[expect(clippy::cast_possible_truncation)]
    let id = (pos.inode >> LRU_TIME_BITS) as u16;
    LruId(id)
}

#[must_use]
pub fn lru_pos_time(pos: KeyPos) -> LruTime {
    LruTime(pos.inode & LRU_TIME_MAX)
}

#[must_use]
pub fn lru_pos_bucket(pos: KeyPos) -> BucketRef {
    offset_to_bucket(pos.offset)
}

/// Inclusive `[start, end]` bounds of one LRU's region of the index.
#[must_use]
pub fn lru_range(lru_id: LruId) -> (KeyPos, KeyPos) {
    let base = u64::from(lru_id.0) << LRU_TIME_BITS;
    (
        KeyPos {
            inode: base,
            offset: 0,
        },
        KeyPos {
            inode: base | LRU_TIME_MAX,
            offset: u64::MAX,
        },
    )
}

// ── Decoded view ────────────────────────────────────────────────────────────

/// All fields of an index position, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedLru {
    pub lru_id: LruId,
    pub time: LruTime,
    pub bucket: BucketRef,
}

impl DecodedLru {
    #[must_use]
    pub fn decode(pos: KeyPos) -> Self {
        Self {
            lru_id: lru_pos_id(pos),
            time: lru_pos_time(pos),
            bucket: lru_pos_bucket(pos),
        }
    }
}

impl fmt::Display for DecodedLru {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}", self.lru_id, self.time, self.bucket)
    }
}

// ── Text formatters ─────────────────────────────────────────────────────────

/// `"<lru_id>:<time> -> <dev>:<bucket>"`.
#[must_use]
pub fn lru_pos_to_text(pos: KeyPos) -> String {
    DecodedLru::decode(pos).to_string()
}

/// `"<type> <kind> <lru_id>:<time> -> <dev>:<bucket>"`.
#[must_use]
pub fn lru_key_to_text(key: &LruKey) -> String {
    let decoded = DecodedLru::decode(key.pos);
    format!("{} {} {decoded}", key.key_type, decoded.lru_id.kind())
}

// ── Validation ──────────────────────────────────────────────────────────────

/// Structural validation hook run on every raw key read from or written to
/// the index.
///
/// Time zero is the "not a member" sentinel and must never be stored,
/// whatever the key type.
pub fn validate_lru_key(key: &LruKey) -> Result<(), KeyError> {
    if !lru_pos_time(key.pos).is_member() {
        return Err(KeyError::ZeroTime { pos: key.pos });
    }
    Ok(())
}
