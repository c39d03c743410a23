//! LRU mutator: membership updates queued through the write buffer.
//!
//! Nothing here reads the index. Every call encodes one position and queues
//! one upsert in the caller's transaction; the caller's commit decides
//! whether any of it happens.

use lru_codec::lru_pos;
use lru_error::{LruError, Result};
use lru_host::{
    AllocEntry, DeviceInfo, LruHost, LruTrans, commit_do, fragmentation_policy, key_error_to_lru,
    read_policy,
};
use lru_types::{BucketRef, KeyType, LruId, LruKey, LruTime};
use tracing::trace;

fn lru_update(
    trans: &mut dyn LruTrans,
    lru_id: LruId,
    bucket: BucketRef,
    time: LruTime,
    key_type: KeyType,
) -> Result<()> {
    if !time.is_member() {
        return Ok(());
    }
    let pos = lru_pos(lru_id, bucket, time).map_err(|err| key_error_to_lru(&err))?;
    trace!(
        target: "lru::mutate",
        event = "lru_update",
        txn = trans.id().0,
        lru_id = lru_id.0,
        bucket = %bucket,
        time = time.0,
        key_type = %key_type
    );
    trans.update_buffered(LruKey { pos, key_type })
}

/// Make `bucket` a member of `lru_id` at `time`. Time zero is a no-op.
pub fn lru_set(
    trans: &mut dyn LruTrans,
    lru_id: LruId,
    bucket: BucketRef,
    time: LruTime,
) -> Result<()> {
    lru_update(trans, lru_id, bucket, time, KeyType::Set)
}

/// Remove `bucket` from `lru_id` at `time`. Time zero is a no-op.
pub fn lru_del(
    trans: &mut dyn LruTrans,
    lru_id: LruId,
    bucket: BucketRef,
    time: LruTime,
) -> Result<()> {
    lru_update(trans, lru_id, bucket, time, KeyType::Deleted)
}

/// Move `bucket` from `old_time` to `new_time` within `lru_id`.
///
/// Equal times issue no writes. Otherwise the delete is queued first and the
/// first error aborts; the caller's transaction must then be dropped.
pub fn lru_change(
    trans: &mut dyn LruTrans,
    lru_id: LruId,
    bucket: BucketRef,
    old_time: LruTime,
    new_time: LruTime,
) -> Result<()> {
    if old_time == new_time {
        return Ok(());
    }
    lru_del(trans, lru_id, bucket, old_time)?;
    lru_set(trans, lru_id, bucket, new_time)
}

/// Allocator trigger: keep both LRUs in step with an allocation record
/// changing from `old` to `new`.
pub fn update_alloc_lrus(
    trans: &mut dyn LruTrans,
    bucket: BucketRef,
    device: &DeviceInfo,
    old: &AllocEntry,
    new: &AllocEntry,
) -> Result<()> {
    lru_change(
        trans,
        LruId::read(bucket.dev),
        bucket,
        read_policy(old),
        read_policy(new),
    )?;
    lru_change(
        trans,
        LruId::FRAGMENTATION,
        bucket,
        fragmentation_policy(old, device),
        fragmentation_policy(new, device),
    )
}

/// Store `entry` as the allocation record of `bucket` and update its LRU
/// membership, all in one transaction. Returns the previous record.
pub fn update_bucket(
    host: &dyn LruHost,
    bucket: BucketRef,
    entry: AllocEntry,
) -> Result<AllocEntry> {
    let device = host
        .devices()
        .try_get(bucket.dev)
        .ok_or(LruError::DeviceNotFound(bucket.dev))?;
    if !device.contains(bucket) {
        return Err(LruError::InvalidKey(format!(
            "bucket {bucket} beyond device {} ({} buckets)",
            device.index, device.nbuckets
        )));
    }
    commit_do(host, |trans| {
        let old = trans.alloc_entry(bucket)?.unwrap_or_default();
        trans.put_alloc(bucket, entry)?;
        update_alloc_lrus(trans, bucket, &device, &old, &entry)?;
        Ok(old)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lru_host::{DataType, MemHost};
    use lru_types::{KeyPos, LRU_TIME_MAX};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    const B: BucketRef = BucketRef { dev: 0, bucket: 5 };

    fn pos(time: u64) -> KeyPos {
        lru_pos(LruId::read(0), B, LruTime(time)).unwrap()
    }

    fn host_with_device() -> MemHost {
        let host = MemHost::new();
        host.device_table().add(DeviceInfo {
            index: 0,
            bucket_size: 512,
            nbuckets: 64,
        });
        host
    }

    fn members(host: &MemHost) -> Vec<KeyPos> {
        host.flush_write_buffer().unwrap();
        host.index_keys().into_iter().map(|k| k.pos).collect()
    }

    #[test]
    fn zero_time_is_a_no_op() {
        let host = MemHost::new();
        commit_do(&host, |t| {
            lru_set(t, LruId::read(0), B, LruTime::NONE)?;
            lru_del(t, LruId::read(0), B, LruTime::NONE)
        })
        .unwrap();
        assert_eq!(host.pending_updates(), 0);
        assert!(members(&host).is_empty());
    }

    #[test]
    fn set_is_idempotent() {
        let host = MemHost::new();
        for _ in 0..2 {
            commit_do(&host, |t| lru_set(t, LruId::read(0), B, LruTime(100))).unwrap();
        }
        assert_eq!(members(&host), vec![pos(100)]);
    }

    #[test]
    fn set_then_del_leaves_nothing() {
        let host = MemHost::new();
        commit_do(&host, |t| lru_set(t, LruId::read(0), B, LruTime(100))).unwrap();
        commit_do(&host, |t| lru_del(t, LruId::read(0), B, LruTime(100))).unwrap();
        assert!(members(&host).is_empty());
    }

    #[test]
    fn change_with_equal_times_writes_nothing() {
        let host = MemHost::new();
        commit_do(&host, |t| {
            lru_change(t, LruId::read(0), B, LruTime(7), LruTime(7))
        })
        .unwrap();
        assert_eq!(host.pending_updates(), 0);
    }

    #[test]
    fn change_moves_membership() {
        let host = MemHost::new();
        commit_do(&host, |t| lru_set(t, LruId::read(0), B, LruTime(100))).unwrap();
        commit_do(&host, |t| {
            lru_change(t, LruId::read(0), B, LruTime(100), LruTime(200))
        })
        .unwrap();
        assert_eq!(members(&host), vec![pos(200)]);
    }

    #[test]
    fn failed_change_leaves_no_partial_update() {
        let host = MemHost::new();
        let err = commit_do(&host, |t| {
            lru_change(t, LruId::read(0), B, LruTime(5), LruTime(LRU_TIME_MAX + 1))
        })
        .unwrap_err();
        assert!(matches!(err, LruError::InvalidKey(_)));
        assert_eq!(host.pending_updates(), 0);
    }

    #[test]
    fn update_bucket_tracks_both_lrus() {
        let host = host_with_device();
        let cached = AllocEntry {
            data_type: DataType::Cached,
            cached_sectors: 512,
            io_time_read: 100,
            ..AllocEntry::default()
        };
        let old = update_bucket(&host, B, cached).unwrap();
        assert_eq!(old, AllocEntry::default());
        assert_eq!(members(&host), vec![pos(100)]);

        let user = AllocEntry {
            data_type: DataType::User,
            dirty_sectors: 256,
            ..AllocEntry::default()
        };
        assert_eq!(update_bucket(&host, B, user).unwrap(), cached);
        let frag = lru_pos(LruId::FRAGMENTATION, B, LruTime(1 << 30)).unwrap();
        assert_eq!(members(&host), vec![frag]);
    }

    #[test]
    fn update_bucket_rejects_unknown_device_and_range() {
        let host = host_with_device();
        let err = update_bucket(&host, BucketRef { dev: 3, bucket: 1 }, AllocEntry::default())
            .unwrap_err();
        assert!(matches!(err, LruError::DeviceNotFound(3)));
        let err = update_bucket(&host, BucketRef { dev: 0, bucket: 64 }, AllocEntry::default())
            .unwrap_err();
        assert!(matches!(err, LruError::InvalidKey(_)));
        assert_eq!(host.device_table().active_refs(0), 0);
    }

    proptest! {
        #[test]
        fn mutator_matches_set_model(
            ops in proptest::collection::vec((any::<bool>(), 0_u64..4), 0..40)
        ) {
            let host = MemHost::new();
            let mut model = BTreeSet::new();
            for (insert, time) in ops {
                commit_do(&host, |t| {
                    if insert {
                        lru_set(t, LruId::read(0), B, LruTime(time))
                    } else {
                        lru_del(t, LruId::read(0), B, LruTime(time))
                    }
                })
                .unwrap();
                if time != 0 {
                    if insert {
                        model.insert(pos(time));
                    } else {
                        model.remove(&pos(time));
                    }
                }
            }
            prop_assert_eq!(members(&host), model.into_iter().collect::<Vec<_>>());
        }
    }
}
