//! Lazy repair: verify that an allocation record's expected LRU entry exists.
//!
//! A missing entry may just be an update still sitting in the write buffer,
//! so the first miss for a referring key forces a targeted flush and looks
//! again. Only a miss that survives the flush is reported.

use crate::mutate::lru_set;
use crate::report::{LruCheckReport, LruFinding};
use lru_codec::{lru_pos, lru_pos_to_text};
use lru_error::Result;
use lru_host::{
    FsckErrKind, FsckSink, FsckVerdict, LastFlushed, LruHost, LruTrans, RefKey,
    for_each_alloc_commit, fragmentation_policy, key_error_to_lru, read_policy,
};
use lru_types::{KeyPos, LruId, LruTime};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Sink adapter that forwards each distinct report once per committed step.
///
/// Checks run inside transactions that may restart. A restarted attempt
/// that finds the same inconsistency gets the verdict recorded the first
/// time instead of reporting it again. Call [`ReportOnce::settle`] once the
/// step has committed.
pub struct ReportOnce<'a> {
    inner: &'a dyn FsckSink,
    seen: Mutex<Vec<(FsckErrKind, String, FsckVerdict)>>,
}

impl<'a> ReportOnce<'a> {
    #[must_use]
    pub fn new(inner: &'a dyn FsckSink) -> Self {
        Self {
            inner,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Forget the verdicts of the step that just committed.
    pub fn settle(&self) {
        self.seen.lock().clear();
    }
}

impl FsckSink for ReportOnce<'_> {
    fn report(&self, kind: FsckErrKind, msg: &str) -> FsckVerdict {
        let mut seen = self.seen.lock();
        if let Some((_, _, verdict)) = seen.iter().find(|(k, m, _)| *k == kind && m == msg) {
            return *verdict;
        }
        let verdict = self.inner.report(kind, msg);
        seen.push((kind, msg.to_owned(), verdict));
        verdict
    }
}

/// Result of [`lru_check_set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckSetOutcome {
    /// Time zero: the bucket is not expected in this LRU.
    NotMember,
    Present,
    /// Visible only after flushing the write buffer for the position.
    PresentAfterFlush,
    /// Still absent after a flush; reported, and repaired if the sink agreed.
    Missing(LruFinding),
}

impl CheckSetOutcome {
    #[must_use]
    pub fn finding(&self) -> Option<&LruFinding> {
        match self {
            Self::Missing(finding) => Some(finding),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_fixed(&self) -> bool {
        self.finding().is_some_and(|f| f.fixed)
    }
}

fn is_present(trans: &mut dyn LruTrans, pos: KeyPos) -> Result<bool> {
    Ok(trans.peek(pos)?.is_some_and(|key| key.is_set()))
}

/// Check that `referring` has its entry in `lru_id` at `time`.
///
/// Reports go straight to `fsck`. Callers running this under a restarting
/// driver should wrap their sink in a [`ReportOnce`].
pub fn lru_check_set(
    trans: &mut dyn LruTrans,
    fsck: &dyn FsckSink,
    lru_id: LruId,
    time: LruTime,
    referring: &RefKey,
    last_flushed: &mut LastFlushed,
) -> Result<CheckSetOutcome> {
    if !time.is_member() {
        return Ok(CheckSetOutcome::NotMember);
    }
    let bucket = referring.bucket();
    let pos = lru_pos(lru_id, bucket, time).map_err(|err| key_error_to_lru(&err))?;

    if is_present(trans, pos)? {
        return Ok(CheckSetOutcome::Present);
    }
    if last_flushed.maybe_flush(trans, referring, pos)? && is_present(trans, pos)? {
        debug!(
            target: "lru::check",
            event = "present_after_flush",
            pos = %lru_pos_to_text(pos)
        );
        return Ok(CheckSetOutcome::PresentAfterFlush);
    }

    let kind = FsckErrKind::AllocKeyToMissingLruEntry;
    let detail = format!(
        "missing {} lru entry at pos {}\n  for {referring}",
        lru_id.kind(),
        lru_pos_to_text(pos)
    );
    let fixed = fsck.report(kind, &detail).should_fix();
    if fixed {
        lru_set(trans, lru_id, bucket, time)?;
        last_flushed.invalidate();
    }
    Ok(CheckSetOutcome::Missing(LruFinding {
        kind,
        pos,
        detail,
        fixed,
    }))
}

/// Walk every allocation record and check that both of its expected LRU
/// entries exist. Records on devices that no longer exist are skipped.
pub fn check_alloc_to_lru_refs(host: &dyn LruHost, fsck: &dyn FsckSink) -> Result<LruCheckReport> {
    let sink = ReportOnce::new(fsck);
    let mut last_flushed = LastFlushed::new();
    let mut findings = Vec::new();

    let scanned = for_each_alloc_commit(
        host,
        |trans, bucket, entry| {
            let mut found = Vec::new();
            let Some(device) = host.devices().try_get(bucket.dev) else {
                return Ok(found);
            };
            if !device.contains(bucket) {
                return Ok(found);
            }
            let referring = RefKey::Alloc { bucket, entry };
            let expected = [
                (LruId::read(bucket.dev), read_policy(&entry)),
                (LruId::FRAGMENTATION, fragmentation_policy(&entry, &device)),
            ];
            for (lru_id, time) in expected {
                let outcome =
                    lru_check_set(trans, &sink, lru_id, time, &referring, &mut last_flushed)?;
                if let CheckSetOutcome::Missing(finding) = outcome {
                    found.push(finding);
                }
            }
            Ok(found)
        },
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
        target: "lru::check",
        event = "check_alloc_to_lru_refs_done",
        scanned = report.keys_scanned,
        findings = report.findings.len(),
        fixed = report.fixes()
    );
    Ok(report)
}
