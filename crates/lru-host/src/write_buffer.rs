//! Batched LRU key updates.
//!
//! Committed transactions do not touch the LRU index directly: their updates
//! are queued here and applied in bulk later. Until a queued update is
//! flushed, point lookups do not see it.
//!
//! Ordering: updates are applied in submission order, so a delete followed by
//! a set for the same position always leaves the set.
//!
//! [`LastFlushed`] bounds how often a checker forces a flush while examining
//! the same referring key.

use crate::LruTrans;
use crate::alloc::AllocEntry;
use lru_codec::{lru_key_to_text, lru_pos_bucket};
use lru_error::Result;
use lru_types::{BucketRef, KeyPos, LruKey, TxnId};
use std::fmt;

/// Write buffer sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteBufferConfig {
    /// Pending updates at which the buffer is drained into the index.
    /// Default: 1024.
    pub max_entries: usize,
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self { max_entries: 1024 }
    }
}

/// One queued update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferedUpdate {
    /// Submission sequence, global to the buffer.
    pub seq: u64,
    pub txn: TxnId,
    pub key: LruKey,
}

/// FIFO of pending LRU key updates.
#[derive(Debug)]
pub struct WriteBuffer {
    entries: Vec<BufferedUpdate>,
    next_seq: u64,
    config: WriteBufferConfig,
}

impl WriteBuffer {
    #[must_use]
    pub fn new(config: WriteBufferConfig) -> Self {
        Self {
            entries: Vec::new(),
            next_seq: 1,
            config,
        }
    }

    /// Queue an update. Returns `true` if the buffer has reached its
    /// threshold and should be drained.
    pub fn push(&mut self, txn: TxnId, key: LruKey) -> bool {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.entries.push(BufferedUpdate { seq, txn, key });
        tracing::trace!(
            target: "lru::host",
            event = "wb_push",
            seq,
            txn = txn.0,
            pending = self.entries.len(),
            key = %lru_key_to_text(&key)
        );
        self.entries.len() >= self.config.max_entries
    }

    /// Remove and return every pending update, oldest first.
    pub fn drain_all(&mut self) -> Vec<BufferedUpdate> {
        std::mem::take(&mut self.entries)
    }

    /// Remove and return the pending updates for `pos`, oldest first.
    pub fn drain_pos(&mut self, pos: KeyPos) -> Vec<BufferedUpdate> {
        let (matching, rest): (Vec<_>, Vec<_>) =
            self.entries.drain(..).partition(|u| u.key.pos == pos);
        self.entries = rest;
        matching
    }

    #[must_use]
    pub fn pending_for(&self, pos: KeyPos) -> usize {
        self.entries.iter().filter(|u| u.key.pos == pos).count()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn iter(&self) -> impl Iterator<Item = &BufferedUpdate> {
        self.entries.iter()
    }
}

// ── Flush deduplication ─────────────────────────────────────────────────────

/// The key a check is examining when it decides whether to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKey {
    /// An allocation record expecting a companion LRU entry.
    Alloc {
        bucket: BucketRef,
        entry: AllocEntry,
    },
    /// An LRU entry under verification.
    Lru(LruKey),
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc { bucket, entry } => write!(f, "alloc {bucket}: {entry}"),
            Self::Lru(key) => write!(f, "lru {}", lru_key_to_text(key)),
        }
    }
}

impl RefKey {
    /// The bucket the referring key is about.
    #[must_use]
    pub fn bucket(&self) -> BucketRef {
        match self {
            Self::Alloc { bucket, .. } => *bucket,
            Self::Lru(key) => lru_pos_bucket(key.pos),
        }
    }
}

/// Remembers the referring key (and the position checked for it) for which
/// a flush was last forced.
///
/// A check that finds drift flushes once per distinct referring key and
/// position; seeing the same pair again, with the key unchanged, means the
/// drift survived a flush and is real.
#[derive(Debug, Clone, Default)]
pub struct LastFlushed {
    key: Option<(RefKey, KeyPos)>,
    flushes: u64,
}

impl LastFlushed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flush pending updates for `pos` unless `referring` was the subject of
    /// the previous flush. Returns whether a flush happened.
    pub fn maybe_flush(
        &mut self,
        trans: &mut dyn LruTrans,
        referring: &RefKey,
        pos: KeyPos,
    ) -> Result<bool> {
        if self.key == Some((*referring, pos)) {
            return Ok(false);
        }
        let applied = trans.flush_write_buffer_for(pos)?;
        tracing::debug!(
            target: "lru::host",
            event = "wb_maybe_flush",
            pos = %pos,
            applied,
            referring = %referring
        );
        self.key = Some((*referring, pos));
        self.flushes = self.flushes.saturating_add(1);
        Ok(true)
    }

    /// Forget the last flushed key, e.g. after queueing a repair for it.
    pub fn invalidate(&mut self) {
        self.key = None;
    }

    #[must_use]
    pub fn last(&self) -> Option<&RefKey> {
        self.key.as_ref().map(|(key, _)| key)
    }

    /// Number of flushes this token has forced.
    #[must_use]
    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}
