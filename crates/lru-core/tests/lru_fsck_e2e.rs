#![forbid(unsafe_code)]
//! End-to-end consistency checks of the LRU index against allocation
//! records, driven through the in-memory host.

use lru_core::{
    AllocEntry, BucketRef, CheckSetOutcome, DataType, DeviceInfo, FixPolicy, FsckErrKind,
    LastFlushed, LruHost, LruId, LruKey, LruTime, MemHost, PolicySink, RefKey, check_lrus,
    commit_do, lru_check_set, lru_pos, lru_set, run_lru_fsck, update_bucket,
};

const BUCKET: BucketRef = BucketRef { dev: 0, bucket: 5 };

fn device(index: u16) -> DeviceInfo {
    DeviceInfo {
        index,
        bucket_size: 128,
        nbuckets: 64,
    }
}

fn host_with_devices(devices: &[u16]) -> MemHost {
    let host = MemHost::new();
    for &index in devices {
        assert!(host.device_table().add(device(index)));
    }
    host
}

fn cached(io_time_read: u64) -> AllocEntry {
    AllocEntry {
        data_type: DataType::Cached,
        cached_sectors: 128,
        io_time_read,
        ..AllocEntry::default()
    }
}

fn user(dirty_sectors: u32) -> AllocEntry {
    AllocEntry {
        data_type: DataType::User,
        dirty_sectors,
        ..AllocEntry::default()
    }
}

fn read_key(bucket: BucketRef, time: u64) -> LruKey {
    LruKey::set(lru_pos(LruId::read(bucket.dev), bucket, LruTime(time)).unwrap())
}

fn check_read_100(host: &MemHost, sink: &PolicySink, token: &mut LastFlushed) -> CheckSetOutcome {
    let referring = RefKey::Alloc {
        bucket: BUCKET,
        entry: cached(100),
    };
    commit_do(host, |trans| {
        lru_check_set(trans, sink, LruId::read(0), LruTime(100), &referring, token)
    })
    .unwrap()
}

#[test]
fn scenario_a_set_entry_checks_clean() {
    let host = host_with_devices(&[0]);
    host.insert_alloc(BUCKET, cached(100));
    commit_do(&host, |trans| lru_set(trans, LruId::read(0), BUCKET, LruTime(100))).unwrap();

    let sink = PolicySink::new(FixPolicy::Repair);
    let mut token = LastFlushed::new();
    let outcome = check_read_100(&host, &sink, &mut token);
    assert!(matches!(
        outcome,
        CheckSetOutcome::Present | CheckSetOutcome::PresentAfterFlush
    ));
    assert!(sink.records().is_empty());
}

#[test]
fn scenario_b_missing_entry_is_created_once() {
    let host = host_with_devices(&[0]);
    host.insert_alloc(BUCKET, cached(100));

    let sink = PolicySink::new(FixPolicy::Repair);
    let mut token = LastFlushed::new();
    let first = check_read_100(&host, &sink, &mut token);
    assert!(first.is_fixed());
    assert_eq!(
        first.finding().map(|f| f.kind),
        Some(FsckErrKind::AllocKeyToMissingLruEntry)
    );

    let second = check_read_100(&host, &sink, &mut token);
    assert_eq!(second, CheckSetOutcome::PresentAfterFlush);
    assert_eq!(sink.records().len(), 1);
    assert_eq!(host.index_keys(), vec![read_key(BUCKET, 100)]);
}

#[test]
fn scenario_c_stale_entry_is_deleted_not_replaced() {
    let host = host_with_devices(&[0]);
    host.insert_alloc(BUCKET, cached(200));
    host.insert_raw(read_key(BUCKET, 100));

    let sink = PolicySink::new(FixPolicy::Repair);
    let report = check_lrus(&host, &sink).unwrap();
    assert_eq!(report.count(FsckErrKind::LruEntryBad), 1);
    assert_eq!(report.fixes(), 1);
    assert!(host.index_keys().is_empty());
}

#[test]
fn read_only_pass_reports_but_changes_nothing() {
    let host = host_with_devices(&[0]);
    host.insert_alloc(BUCKET, cached(200));
    host.insert_raw(read_key(BUCKET, 100));
    let before = host.image();

    let sink = PolicySink::new(FixPolicy::ReadOnly);
    let report = run_lru_fsck(&host, &sink).unwrap();
    assert_eq!(report.lrus.count(FsckErrKind::LruEntryBad), 1);
    assert_eq!(
        report.alloc_refs.count(FsckErrKind::AllocKeyToMissingLruEntry),
        1
    );
    assert_eq!(report.fixes(), 0);
    assert_eq!(host.image(), before);
}

#[test]
fn corrupted_index_converges_to_fixed_point() {
    let host = host_with_devices(&[0, 1]);
    for bucket in 0..16 {
        update_bucket(&host, BucketRef { dev: 0, bucket }, cached(1000 + bucket)).unwrap();
        update_bucket(
            &host,
            BucketRef { dev: 1, bucket },
            user(u32::try_from(bucket).unwrap() + 1),
        )
        .unwrap();
    }
    host.flush_write_buffer().unwrap();
    let expected = host.index_keys();

    // Stale, duplicate, foreign and missing entries.
    host.insert_raw(read_key(BucketRef { dev: 0, bucket: 3 }, 7));
    host.insert_raw(LruKey::set(
        lru_pos(LruId::read(1), BucketRef { dev: 0, bucket: 4 }, LruTime(1004)).unwrap(),
    ));
    assert!(host.remove_raw(read_key(BucketRef { dev: 0, bucket: 9 }, 1009).pos));
    assert!(host.remove_raw(expected[expected.len() - 1].pos));

    let sink = PolicySink::new(FixPolicy::Repair);
    let first = run_lru_fsck(&host, &sink).unwrap();
    assert_eq!(first.lrus.fixes(), 2);
    assert_eq!(first.alloc_refs.fixes(), 2);
    assert_eq!(host.index_keys(), expected);

    let second = run_lru_fsck(&host, &sink).unwrap();
    assert!(second.is_clean());
    assert_eq!(second.fixes(), 0);
}

#[test]
fn dangling_device_entries_are_removed_for_good() {
    let host = host_with_devices(&[0, 2]);
    update_bucket(&host, BucketRef { dev: 2, bucket: 1 }, cached(50)).unwrap();
    update_bucket(&host, BUCKET, cached(100)).unwrap();
    host.flush_write_buffer().unwrap();
    assert!(host.device_table().remove(2).is_some());

    let sink = PolicySink::new(FixPolicy::Repair);
    let first = run_lru_fsck(&host, &sink).unwrap();
    assert_eq!(first.lrus.count(FsckErrKind::LruEntryToInvalidBucket), 1);
    assert_eq!(host.index_keys(), vec![read_key(BUCKET, 100)]);

    let second = run_lru_fsck(&host, &sink).unwrap();
    assert!(second.is_clean());
    assert_eq!(host.index_keys(), vec![read_key(BUCKET, 100)]);
}

#[test]
fn zero_time_is_never_persisted_and_rejected_on_read() {
    let host = host_with_devices(&[0]);
    commit_do(&host, |trans| lru_set(trans, LruId::read(0), BUCKET, LruTime::NONE)).unwrap();
    host.flush_write_buffer().unwrap();
    assert!(host.index_keys().is_empty());

    let err = commit_do(&host, |trans| {
        trans.update_buffered(LruKey::set(lru_core::KeyPos::new(0, 5)))
    })
    .unwrap_err();
    assert!(matches!(err, lru_core::LruError::InvalidKey(_)));

    host.insert_raw(LruKey::set(lru_core::KeyPos::new(0, 5)));
    let sink = PolicySink::new(FixPolicy::Repair);
    let report = check_lrus(&host, &sink).unwrap();
    assert_eq!(report.count(FsckErrKind::LruKeyInvalid), 1);
    assert_eq!(report.fixes(), 0);
}

#[test]
fn equal_move_and_repeated_updates_leave_one_entry() {
    let host = host_with_devices(&[0]);
    update_bucket(&host, BUCKET, cached(100)).unwrap();
    update_bucket(&host, BUCKET, cached(100)).unwrap();
    assert_eq!(host.pending_updates(), 1);
    host.flush_write_buffer().unwrap();
    assert_eq!(host.index_keys(), vec![read_key(BUCKET, 100)]);

    update_bucket(&host, BUCKET, AllocEntry::default()).unwrap();
    host.flush_write_buffer().unwrap();
    assert!(host.index_keys().is_empty());
}

#[test]
fn concurrent_allocator_updates_stay_consistent() {
    let host = host_with_devices(&[0]);
    std::thread::scope(|scope| {
        for worker in 0..4_u64 {
            let host = &host;
            scope.spawn(move || {
                for round in 1..=25_u64 {
                    let bucket = BucketRef {
                        dev: 0,
                        bucket: (worker + round) % 8,
                    };
                    let entry = if round % 3 == 0 {
                        user(u32::try_from(round).unwrap())
                    } else {
                        cached(worker * 100 + round)
                    };
                    update_bucket(host, bucket, entry).unwrap();
                }
            });
        }
    });

    let sink = PolicySink::new(FixPolicy::ReadOnly);
    let report = run_lru_fsck(&host, &sink).unwrap();
    assert!(report.is_clean(), "{report}");
    assert!(sink.records().is_empty());
}
