//! Full-scan checker: walk the whole index and verify every entry against
//! the allocation record it names.
//!
//! Per key:
//!
//! 1. Structural validation. Failures are reported and left alone.
//! 2. Device and bucket range. Entries naming a bucket that cannot exist
//!    are deleted.
//! 3. Expected time from the bucket's allocation record. On mismatch the
//!    write buffer is flushed once for the key and the key re-read, since a
//!    pending update may already fix it. A mismatch that survives is deleted.
//!
//! Mismatches are only ever deleted here. Inserting the correct entry is the
//! job of the allocator trigger, or of
//! [`check_alloc_to_lru_refs`](crate::check::check_alloc_to_lru_refs).

use crate::check::{ReportOnce, check_alloc_to_lru_refs};
use crate::report::{LruCheckReport, LruFinding, LruFsckReport};
use lru_codec::{DecodedLru, lru_key_to_text, lru_range, validate_lru_key};
use lru_error::Result;
use lru_host::{
    DeviceTable, FsckErrKind, FsckSink, LastFlushed, LruHost, LruTrans, RefKey, expected_time,
    for_each_lru_key_commit,
};
use lru_types::{BucketRef, KeyPos, LruId, LruKey, LruKind, LruTime};
use tracing::{info, warn};

fn finding(
    trans: &mut dyn LruTrans,
    fsck: &dyn FsckSink,
    kind: FsckErrKind,
    pos: KeyPos,
    detail: String,
) -> Result<LruFinding> {
    let fixed = fsck.report(kind, &detail).should_fix();
    if fixed {
        trans.update_buffered(LruKey::deleted(pos))?;
    }
    Ok(LruFinding {
        kind,
        pos,
        detail,
        fixed,
    })
}

/// Check one index key. Returns the finding, if any.
pub fn check_lru_key(
    trans: &mut dyn LruTrans,
    devices: &dyn DeviceTable,
    fsck: &dyn FsckSink,
    key: LruKey,
    last_flushed: &mut LastFlushed,
) -> Result<Option<LruFinding>> {
    if let Err(err) = validate_lru_key(&key) {
        let kind = FsckErrKind::LruKeyInvalid;
        let detail = format!("{err}\n  {}", lru_key_to_text(&key));
        fsck.report(kind, &detail);
        return Ok(Some(LruFinding {
            kind,
            pos: key.pos,
            detail,
            fixed: false,
        }));
    }

    let decoded = DecodedLru::decode(key.pos);
    let bucket = decoded.bucket;
    let device = match devices.try_get(bucket.dev) {
        Some(device) if device.contains(bucket) => device,
        _ => {
            let detail = format!(
                "lru key points to nonexistent device:bucket {bucket}\n  {}",
                lru_key_to_text(&key)
            );
            return finding(
                trans,
                fsck,
                FsckErrKind::LruEntryToInvalidBucket,
                key.pos,
                detail,
            )
            .map(Some);
        }
    };

    let kind = decoded.lru_id.kind();
    let wrong_lru = kind == LruKind::Read && decoded.lru_id != LruId::read(bucket.dev);
    let mut key = key;
    loop {
        let entry = trans.alloc_entry(bucket)?.unwrap_or_default();
        let expected = expected_time(kind, &entry, &device);
        if key.is_set() && !wrong_lru && decoded.time == expected {
            return Ok(None);
        }
        if last_flushed.maybe_flush(trans, &RefKey::Lru(key), key.pos)? {
            match trans.peek(key.pos)? {
                Some(current) => {
                    key = current;
                    continue;
                }
                None => return Ok(None),
            }
        }
        let detail = format!(
            "incorrect lru entry: lru {kind} time {}\n  {}\n  for {bucket}: {entry}",
            decoded.time,
            lru_key_to_text(&key)
        );
        return finding(trans, fsck, FsckErrKind::LruEntryBad, key.pos, detail).map(Some);
    }
}

/// Check every key in the index, one transaction per key, then flush the
/// write buffer so the repairs are visible.
///
/// An inconsistency found again after a transaction restart is reported to
/// `fsck` only once.
pub fn check_lrus(host: &dyn LruHost, fsck: &dyn FsckSink) -> Result<LruCheckReport> {
    let sink = ReportOnce::new(fsck);
    let mut last_flushed = LastFlushed::new();
    let mut findings = Vec::new();

    let scanned = for_each_lru_key_commit(
        host,
        KeyPos::MIN,
        KeyPos::MAX,
        |trans, key| check_lru_key(trans, host.devices(), &sink, key, &mut last_flushed),
        |_, found| {
            sink.settle();
            findings.extend(found);
        },
    )?;
    host.flush_write_buffer()?;

    let report = LruCheckReport {
        keys_scanned: scanned,
        findings,
        buffer_flushes: last_flushed.flushes(),
    };
    info!(
        target: "lru::scan",
        event = "check_lrus_done",
        scanned = report.keys_scanned,
        findings = report.findings.len(),
        fixed = report.fixes()
    );
    Ok(report)
}

/// The first `limit` members of `lru_id`, oldest first.
///
/// Only flushed entries are visible. Keys failing structural validation are
/// never members; they are skipped and left for [`check_lrus`].
pub fn lru_walk(
    trans: &mut dyn LruTrans,
    lru_id: LruId,
    limit: usize,
) -> Result<Vec<(LruTime, BucketRef)>> {
    let (start, end) = lru_range(lru_id);
    let mut out = Vec::new();
    let mut pos = start;
    while out.len() < limit {
        let Some(key) = trans.peek_next(pos)? else {
            break;
        };
        if key.pos > end {
            break;
        }
        if let Err(err) = validate_lru_key(&key) {
            warn!(
                target: "lru::scan",
                event = "walk_skip_invalid",
                key = %lru_key_to_text(&key),
                error = %err
            );
        } else if key.is_set() {
            let decoded = DecodedLru::decode(key.pos);
            out.push((decoded.time, decoded.bucket));
        }
        match key.pos.successor() {
            Some(next) => pos = next,
            None => break,
        }
    }
    Ok(out)
}

/// Both consistency passes: index to allocation records, then allocation
/// records to index.
pub fn run_lru_fsck(host: &dyn LruHost, fsck: &dyn FsckSink) -> Result<LruFsckReport> {
    let lrus = check_lrus(host, fsck)?;
    let alloc_refs = check_alloc_to_lru_refs(host, fsck)?;
    let report = LruFsckReport { lrus, alloc_refs };
    info!(
        target: "lru::scan",
        event = "lru_fsck_done",
        clean = report.is_clean(),
        fixed = report.fixes()
    );
    Ok(report)
}
