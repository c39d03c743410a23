//! Authoritative per-bucket allocation records and the LRU time policies
//! derived from them.
//!
//! The allocator owns these records; the LRU index is only ever a function
//! of them. [`read_policy`] and [`fragmentation_policy`] are that function.

use crate::device::DeviceInfo;
use lru_types::{LruKind, LruTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What a bucket currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    #[default]
    Free,
    Superblock,
    Journal,
    Btree,
    User,
    Cached,
    NeedDiscard,
}

impl DataType {
    /// Buckets whose live data the copygc path may relocate.
    #[must_use]
    pub fn is_movable(self) -> bool {
        matches!(self, Self::Btree | Self::User)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Superblock => "sb",
            Self::Journal => "journal",
            Self::Btree => "btree",
            Self::User => "user",
            Self::Cached => "cached",
            Self::NeedDiscard => "need_discard",
        };
        f.write_str(name)
    }
}

/// Allocation record of one bucket.
///
/// A bucket with no stored record reads as `AllocEntry::default()` (free,
/// empty, never accessed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocEntry {
    pub data_type: DataType,
    pub generation: u8,
    pub dirty_sectors: u32,
    pub cached_sectors: u32,
    pub io_time_read: u64,
    pub io_time_write: u64,
}

impl fmt::Display for AllocEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gen {} data_type {} dirty_sectors {} cached_sectors {} io_time[READ] {} io_time[WRITE] {}",
            self.generation,
            self.data_type,
            self.dirty_sectors,
            self.cached_sectors,
            self.io_time_read,
            self.io_time_write,
        )
    }
}

/// Time a bucket should occupy in its device's read LRU.
///
/// Only cached buckets are members; they are ordered by last read.
#[must_use]
pub fn read_policy(entry: &AllocEntry) -> LruTime {
    if entry.data_type == DataType::Cached {
        LruTime::clamped(entry.io_time_read)
    } else {
        LruTime::NONE
    }
}

/// Time a bucket should occupy in the fragmentation LRU.
///
/// Movable buckets that are partially full are members, ordered by the
/// fraction of the bucket still holding live data, scaled to 2^31. Emptier
/// buckets sort first.
#[must_use]
pub fn fragmentation_policy(entry: &AllocEntry, device: &DeviceInfo) -> LruTime {
    let bucket_size = u64::from(device.bucket_size);
    let dirty = u64::from(entry.dirty_sectors);
    if !entry.data_type.is_movable() || dirty == 0 || dirty >= bucket_size {
        return LruTime::NONE;
    }
    let scaled = (dirty << 31) / bucket_size;
    LruTime::clamped(scaled.max(1))
}

/// Apply the policy selected by `kind`.
#[must_use]
pub fn expected_time(kind: LruKind, entry: &AllocEntry, device: &DeviceInfo) -> LruTime {
    match kind {
        LruKind::Read => read_policy(entry),
        LruKind::Fragmentation => fragmentation_policy(entry, device),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> DeviceInfo {
        DeviceInfo {
            index: 0,
            bucket_size: 512,
            nbuckets: 1024,
        }
    }

    #[test]
    fn read_policy_tracks_cached_buckets_only() {
        let cached = AllocEntry {
            data_type: DataType::Cached,
            cached_sectors: 64,
            io_time_read: 100,
            ..AllocEntry::default()
        };
        assert_eq!(read_policy(&cached), LruTime(100));

        let user = AllocEntry {
            data_type: DataType::User,
            ..cached
        };
        assert_eq!(read_policy(&user), LruTime::NONE);
        assert_eq!(read_policy(&AllocEntry::default()), LruTime::NONE);
    }

    #[test]
    fn fragmentation_policy_orders_by_live_fraction() {
        let dev = device();
        let quarter = AllocEntry {
            data_type: DataType::User,
            dirty_sectors: 128,
            ..AllocEntry::default()
        };
        let half = AllocEntry {
            dirty_sectors: 256,
            ..quarter
        };
        assert_eq!(fragmentation_policy(&quarter, &dev), LruTime(1 << 29));
        assert_eq!(fragmentation_policy(&half, &dev), LruTime(1 << 30));
        assert!(fragmentation_policy(&quarter, &dev) < fragmentation_policy(&half, &dev));
    }

    #[test]
    fn fragmentation_policy_skips_full_empty_and_unmovable() {
        let dev = device();
        let full = AllocEntry {
            data_type: DataType::User,
            dirty_sectors: 512,
            ..AllocEntry::default()
        };
        let empty = AllocEntry {
            dirty_sectors: 0,
            ..full
        };
        let cached = AllocEntry {
            data_type: DataType::Cached,
            dirty_sectors: 10,
            ..full
        };
        for entry in [full, empty, cached] {
            assert_eq!(fragmentation_policy(&entry, &dev), LruTime::NONE);
        }
    }

    #[test]
    fn expected_time_dispatches_on_kind() {
        let dev = device();
        let entry = AllocEntry {
            data_type: DataType::Cached,
            io_time_read: 77,
            ..AllocEntry::default()
        };
        assert_eq!(expected_time(LruKind::Read, &entry, &dev), LruTime(77));
        assert_eq!(
            expected_time(LruKind::Fragmentation, &entry, &dev),
            LruTime::NONE
        );
    }
}
