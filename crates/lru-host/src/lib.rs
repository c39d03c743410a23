#![forbid(unsafe_code)]
//! Host storage-engine interfaces for the bucket LRU index.
//!
//! The LRU engine never owns storage. It runs inside transactions handed out
//! by an [`LruHost`] and touches the world only through [`LruTrans`]:
//!
//! - point and ranged lookups of raw LRU keys (committed state only),
//! - allocation-record reads and writes,
//! - batched LRU key upserts and targeted write-buffer flushes.
//!
//! Devices come from a [`DeviceTable`], fsck decisions from an [`FsckSink`].
//!
//! Transactions are optimistic. A conflicting commit fails with
//! [`LruError::TransactionConflict`] and the drivers in this crate
//! ([`commit_do`], [`for_each_lru_key_commit`], [`for_each_alloc_commit`])
//! restart the closure from scratch. Nothing else in the workspace retries.
//!
//! [`MemHost`] is an in-memory implementation of the whole contract.

pub mod alloc;
pub mod device;
pub mod fsck;
pub mod mem;
pub mod write_buffer;

pub use alloc::{AllocEntry, DataType, expected_time, fragmentation_policy, read_policy};
pub use device::{DeviceInfo, DeviceRef, DeviceTable, MemDeviceTable};
pub use fsck::{FixPolicy, FsckErrKind, FsckRecord, FsckSink, FsckVerdict, PolicySink};
pub use mem::{AllocRecord, HostImage, MemHost};
pub use write_buffer::{LastFlushed, RefKey, WriteBufferConfig};

use lru_error::{LruError, Result};
use lru_types::{BucketRef, CommitSeq, KeyError, KeyPos, LruKey, TxnId};
use tracing::{debug, trace, warn};

/// Default bound on transaction restarts per driver step.
pub const DEFAULT_MAX_TRANS_RESTARTS: usize = 64;

/// Default bound on LRU updates staged by one transaction.
pub const DEFAULT_MAX_TRANS_UPDATES: usize = 4096;

/// Host tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfig {
    pub write_buffer: WriteBufferConfig,
    pub max_trans_restarts: usize,
    /// Staged updates past this fail with [`LruError::NoSpace`].
    pub max_trans_updates: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            write_buffer: WriteBufferConfig::default(),
            max_trans_restarts: DEFAULT_MAX_TRANS_RESTARTS,
            max_trans_updates: DEFAULT_MAX_TRANS_UPDATES,
        }
    }
}

/// One optimistic transaction.
pub trait LruTrans {
    fn id(&self) -> TxnId;

    /// Committed key at exactly `pos`, if any. Buffered updates that have not
    /// been flushed are not visible.
    fn peek(&mut self, pos: KeyPos) -> Result<Option<LruKey>>;

    /// First committed key at or after `from`.
    fn peek_next(&mut self, from: KeyPos) -> Result<Option<LruKey>>;

    /// Allocation record of `bucket`, including this transaction's own writes.
    fn alloc_entry(&mut self, bucket: BucketRef) -> Result<Option<AllocEntry>>;

    /// First stored allocation record at or after `from`.
    fn next_alloc(&mut self, from: BucketRef) -> Result<Option<(BucketRef, AllocEntry)>>;

    fn put_alloc(&mut self, bucket: BucketRef, entry: AllocEntry) -> Result<()>;

    /// Queue an upsert of `key` in the write buffer, applied after commit.
    fn update_buffered(&mut self, key: LruKey) -> Result<()>;

    /// Apply every pending buffered update for `pos` to the index now.
    /// Returns the number of updates applied.
    fn flush_write_buffer_for(&mut self, pos: KeyPos) -> Result<usize>;

    fn commit(self: Box<Self>) -> Result<CommitSeq>;
}

/// Source of transactions and shared host services.
pub trait LruHost: Send + Sync {
    fn begin(&self) -> Box<dyn LruTrans + '_>;

    fn devices(&self) -> &dyn DeviceTable;

    /// Apply every pending buffered update. Returns the number applied.
    fn flush_write_buffer(&self) -> Result<usize>;

    fn max_trans_restarts(&self) -> usize {
        DEFAULT_MAX_TRANS_RESTARTS
    }
}

/// Convert a structural key error into the runtime error type.
#[must_use]
pub fn key_error_to_lru(err: &KeyError) -> LruError {
    LruError::InvalidKey(err.to_string())
}

// ── Drivers ─────────────────────────────────────────────────────────────────

/// Run `f` in a fresh transaction and commit it, restarting on conflict.
pub fn commit_do<T, F>(host: &dyn LruHost, mut f: F) -> Result<T>
where
    F: FnMut(&mut dyn LruTrans) -> Result<T>,
{
    let max_attempts = host.max_trans_restarts().max(1);
    for attempt in 1..=max_attempts {
        let mut trans = host.begin();
        let txn = trans.id();
        let out = match f(&mut *trans) {
            Ok(out) => out,
            Err(err) if err.is_restart() => {
                debug!(
                    target: "lru::host",
                    event = "trans_restart",
                    txn = txn.0,
                    attempt,
                    error = %err
                );
                continue;
            }
            Err(err) => return Err(err),
        };
        match trans.commit() {
            Ok(seq) => {
                trace!(
                    target: "lru::host",
                    event = "trans_commit",
                    txn = txn.0,
                    commit_seq = seq.0,
                    attempt
                );
                return Ok(out);
            }
            Err(err) if err.is_restart() => {
                debug!(
                    target: "lru::host",
                    event = "trans_restart",
                    txn = txn.0,
                    attempt,
                    error = %err
                );
            }
            Err(err) => return Err(err),
        }
    }
    warn!(
        target: "lru::host",
        event = "trans_restarts_exhausted",
        max_attempts
    );
    Err(LruError::RestartsExhausted {
        attempts: max_attempts,
    })
}

/// Visit every committed LRU key in `[start, end]`, one transaction per key.
///
/// `f` may be re-run for the same key after a conflict; `on_commit` runs
/// exactly once per key with the output of the attempt that committed.
/// Returns the number of keys visited.
pub fn for_each_lru_key_commit<T, F, C>(
    host: &dyn LruHost,
    start: KeyPos,
    end: KeyPos,
    mut f: F,
    mut on_commit: C,
) -> Result<u64>
where
    F: FnMut(&mut dyn LruTrans, LruKey) -> Result<T>,
    C: FnMut(LruKey, T),
{
    let mut pos = start;
    let mut visited = 0_u64;
    loop {
        let step = commit_do(host, |trans| {
            let Some(key) = trans.peek_next(pos)? else {
                return Ok(None);
            };
            if key.pos > end {
                return Ok(None);
            }
            let out = f(trans, key)?;
            Ok(Some((key, out)))
        })?;
        let Some((key, out)) = step else {
            break;
        };
        visited += 1;
        on_commit(key, out);
        match key.pos.successor() {
            Some(next) if next <= end => pos = next,
            _ => break,
        }
    }
    Ok(visited)
}

/// Visit every stored allocation record, one transaction per bucket.
///
/// Same restart contract as [`for_each_lru_key_commit`].
pub fn for_each_alloc_commit<T, F, C>(host: &dyn LruHost, mut f: F, mut on_commit: C) -> Result<u64>
where
    F: FnMut(&mut dyn LruTrans, BucketRef, AllocEntry) -> Result<T>,
    C: FnMut(BucketRef, T),
{
    let mut from = BucketRef::device_start(0);
    let mut visited = 0_u64;
    loop {
        let step = commit_do(host, |trans| {
            let Some((bucket, entry)) = trans.next_alloc(from)? else {
                return Ok(None);
            };
            let out = f(trans, bucket, entry)?;
            Ok(Some((bucket, out)))
        })?;
        let Some((bucket, out)) = step else {
            break;
        };
        visited += 1;
        on_commit(bucket, out);
        match bucket.successor() {
            Some(next) => from = next,
            None => break,
        }
    }
    Ok(visited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lru_types::LruTime;

    fn pos(time: u64, bucket: u64) -> KeyPos {
        lru_codec::lru_pos(
            lru_types::LruId::read(0),
            BucketRef { dev: 0, bucket },
            LruTime(time),
        )
        .unwrap()
    }

    #[test]
    fn commit_do_retries_conflicts() {
        let host = MemHost::new();
        let mut attempts = 0;
        let out = commit_do(&host, |trans| {
            attempts += 1;
            if attempts < 3 {
                // Race a competing writer onto the slot this transaction reads.
                trans.peek(pos(1, 1))?;
                commit_do(&host, |other| other.update_buffered(LruKey::set(pos(1, 1))))?;
            }
            trans.update_buffered(LruKey::set(pos(1, 1)))?;
            Ok(attempts)
        })
        .unwrap();
        assert_eq!(out, 3);
    }

    #[test]
    fn commit_do_gives_up_after_bound() {
        let host = MemHost::with_config(HostConfig {
            max_trans_restarts: 2,
            ..HostConfig::default()
        });
        let err = commit_do(&host, |trans| {
            trans.peek(pos(1, 1))?;
            commit_do(&host, |other| other.update_buffered(LruKey::set(pos(1, 1))))?;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, LruError::RestartsExhausted { attempts: 2 }));
    }

    #[test]
    fn commit_do_propagates_hard_errors() {
        let host = MemHost::new();
        let err = commit_do(&host, |_| -> Result<()> {
            Err(LruError::Corruption("boom".into()))
        })
        .unwrap_err();
        assert!(matches!(err, LruError::Corruption(_)));
    }

    #[test]
    fn for_each_visits_range_in_order() {
        let host = MemHost::new();
        for (time, bucket) in [(30, 1), (10, 2), (20, 3)] {
            host.insert_raw(LruKey::set(pos(time, bucket)));
        }
        let mut seen = Vec::new();
        let visited = for_each_lru_key_commit(
            &host,
            KeyPos::MIN,
            pos(20, u64::from(u32::MAX)),
            |_, key| Ok(key.pos),
            |_, p| seen.push(p),
        )
        .unwrap();
        assert_eq!(visited, 2);
        assert_eq!(seen, vec![pos(10, 2), pos(20, 3)]);
    }

    #[test]
    fn for_each_alloc_visits_every_record() {
        let host = MemHost::new();
        for bucket in [7, 3, 5] {
            host.insert_alloc(BucketRef { dev: 1, bucket }, AllocEntry::default());
        }
        let mut seen = Vec::new();
        let visited =
            for_each_alloc_commit(&host, |_, b, _| Ok(b.bucket), |_, b| seen.push(b)).unwrap();
        assert_eq!(visited, 3);
        assert_eq!(seen, vec![3, 5, 7]);
    }

    #[test]
    fn key_errors_become_invalid_key() {
        let err = key_error_to_lru(&KeyError::ZeroTime { pos: KeyPos::MIN });
        assert!(matches!(err, LruError::InvalidKey(ref m) if m.contains("time=0")));
    }
}
