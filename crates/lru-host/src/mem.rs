//! In-memory reference host.
//!
//! Committed state is one `RwLock`-protected map per keyspace plus a version
//! per slot (an LRU position or a bucket). Transactions are
//! first-committer-wins: a commit fails if any slot it read or wrote was
//! committed by someone else after its snapshot.
//!
//! Buffered LRU updates bump their slot version when the transaction commits,
//! not when the write buffer later applies them, so a flush never causes a
//! conflict by itself.
//!
//! # Concurrency
//!
//! Lock order is `state` then `write_buffer`. Transactions hold no lock
//! between calls.

use crate::alloc::AllocEntry;
use crate::device::{DeviceInfo, DeviceTable, MemDeviceTable};
use crate::write_buffer::WriteBuffer;
use crate::{HostConfig, LruHost, LruTrans, key_error_to_lru};
use lru_codec::validate_lru_key;
use lru_error::{LruError, Result};
use lru_types::{BucketRef, CommitSeq, KeyPos, KeyType, LruKey, TxnId};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Slot {
    Lru(KeyPos),
    Alloc(BucketRef),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lru(pos) => write!(f, "lru {}", lru_codec::lru_pos_to_text(*pos)),
            Self::Alloc(bucket) => write!(f, "alloc {bucket}"),
        }
    }
}

#[derive(Debug)]
struct HostState {
    next_commit: u64,
    index: BTreeMap<KeyPos, KeyType>,
    alloc: BTreeMap<BucketRef, AllocEntry>,
    versions: HashMap<Slot, CommitSeq>,
}

impl HostState {
    fn new() -> Self {
        Self {
            next_commit: 1,
            index: BTreeMap::new(),
            alloc: BTreeMap::new(),
            versions: HashMap::new(),
        }
    }

    fn snapshot(&self) -> CommitSeq {
        CommitSeq(self.next_commit.saturating_sub(1))
    }

    fn version(&self, slot: Slot) -> CommitSeq {
        self.versions.get(&slot).copied().unwrap_or_default()
    }

    fn next_seq(&mut self) -> CommitSeq {
        let seq = CommitSeq(self.next_commit);
        self.next_commit = self.next_commit.saturating_add(1);
        seq
    }

    fn apply(&mut self, key: LruKey) {
        match key.key_type {
            KeyType::Set => {
                self.index.insert(key.pos, KeyType::Set);
            }
            KeyType::Deleted => {
                self.index.remove(&key.pos);
            }
        }
    }
}

/// Serializable snapshot of a [`MemHost`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostImage {
    pub devices: Vec<DeviceInfo>,
    pub alloc: Vec<AllocRecord>,
    pub lru: Vec<LruKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocRecord {
    pub bucket: BucketRef,
    pub entry: AllocEntry,
}

/// In-memory host implementing [`LruHost`].
#[derive(Debug)]
pub struct MemHost {
    state: RwLock<HostState>,
    write_buffer: Mutex<WriteBuffer>,
    devices: MemDeviceTable,
    config: HostConfig,
    next_txn: AtomicU64,
}

impl Default for MemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MemHost {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HostConfig::default())
    }

    #[must_use]
    pub fn with_config(config: HostConfig) -> Self {
        Self {
            state: RwLock::new(HostState::new()),
            write_buffer: Mutex::new(WriteBuffer::new(config.write_buffer)),
            devices: MemDeviceTable::new(),
            config,
            next_txn: AtomicU64::new(1),
        }
    }

    /// Rebuild a host from an image. LRU keys are loaded verbatim, without
    /// validation, so a checker can find whatever the image holds.
    pub fn from_image(image: &HostImage, config: HostConfig) -> Result<Self> {
        let host = Self::with_config(config);
        for info in &image.devices {
            if !host.devices.add(*info) {
                return Err(LruError::Corruption(format!(
                    "device index {} out of range",
                    info.index
                )));
            }
        }
        for record in &image.alloc {
            host.insert_alloc(record.bucket, record.entry);
        }
        for key in &image.lru {
            host.insert_raw(*key);
        }
        Ok(host)
    }

    /// Snapshot devices, allocation records and the index. Pending buffered
    /// updates are flushed first.
    #[must_use]
    pub fn image(&self) -> HostImage {
        self.flush_all();
        let state = self.state.read();
        HostImage {
            devices: self.devices.list(),
            alloc: state
                .alloc
                .iter()
                .map(|(bucket, entry)| AllocRecord {
                    bucket: *bucket,
                    entry: *entry,
                })
                .collect(),
            lru: state
                .index
                .iter()
                .map(|(pos, key_type)| LruKey {
                    pos: *pos,
                    key_type: *key_type,
                })
                .collect(),
        }
    }

    #[must_use]
    pub fn device_table(&self) -> &MemDeviceTable {
        &self.devices
    }

    /// Write a key straight into the index, bypassing the write buffer and
    /// validation. Counts as a commit for conflict detection.
    pub fn insert_raw(&self, key: LruKey) {
        let mut state = self.state.write();
        let seq = state.next_seq();
        state.index.insert(key.pos, key.key_type);
        state.versions.insert(Slot::Lru(key.pos), seq);
    }

    /// Remove a key straight from the index. Returns whether it was present.
    pub fn remove_raw(&self, pos: KeyPos) -> bool {
        let mut state = self.state.write();
        let seq = state.next_seq();
        state.versions.insert(Slot::Lru(pos), seq);
        state.index.remove(&pos).is_some()
    }

    /// Store an allocation record without running any trigger.
    pub fn insert_alloc(&self, bucket: BucketRef, entry: AllocEntry) {
        let mut state = self.state.write();
        let seq = state.next_seq();
        state.alloc.insert(bucket, entry);
        state.versions.insert(Slot::Alloc(bucket), seq);
    }

    /// Every committed index key, in order.
    #[must_use]
    pub fn index_keys(&self) -> Vec<LruKey> {
        self.state
            .read()
            .index
            .iter()
            .map(|(pos, key_type)| LruKey {
                pos: *pos,
                key_type: *key_type,
            })
            .collect()
    }

    #[must_use]
    pub fn alloc_entries(&self) -> Vec<(BucketRef, AllocEntry)> {
        self.state
            .read()
            .alloc
            .iter()
            .map(|(bucket, entry)| (*bucket, *entry))
            .collect()
    }

    #[must_use]
    pub fn pending_updates(&self) -> usize {
        self.write_buffer.lock().len()
    }

    fn flush_all(&self) -> usize {
        let mut state = self.state.write();
        let updates = self.write_buffer.lock().drain_all();
        for update in &updates {
            state.apply(update.key);
        }
        if !updates.is_empty() {
            debug!(target: "lru::host", event = "wb_flush_all", applied = updates.len());
        }
        updates.len()
    }

    fn flush_pos(&self, pos: KeyPos) -> usize {
        let mut state = self.state.write();
        let updates = self.write_buffer.lock().drain_pos(pos);
        for update in &updates {
            state.apply(update.key);
        }
        updates.len()
    }

    fn commit_trans(&self, trans: MemTrans<'_>) -> Result<CommitSeq> {
        let mut state = self.state.write();

        let written = trans
            .buffered
            .iter()
            .map(|key| Slot::Lru(key.pos))
            .chain(trans.alloc_writes.keys().map(|bucket| Slot::Alloc(*bucket)));
        for slot in trans.reads.iter().copied().chain(written) {
            let observed = state.version(slot);
            if observed > trans.snapshot {
                return Err(LruError::TransactionConflict {
                    txn: trans.id.0,
                    slot: slot.to_string(),
                    snapshot: trans.snapshot.0,
                    observed: observed.0,
                });
            }
        }

        if trans.buffered.is_empty() && trans.alloc_writes.is_empty() {
            return Ok(trans.snapshot);
        }

        let seq = state.next_seq();
        for (bucket, entry) in trans.alloc_writes {
            state.alloc.insert(bucket, entry);
            state.versions.insert(Slot::Alloc(bucket), seq);
        }

        let mut write_buffer = self.write_buffer.lock();
        let mut drain = false;
        for key in trans.buffered {
            state.versions.insert(Slot::Lru(key.pos), seq);
            drain |= write_buffer.push(trans.id, key);
        }
        if drain {
            let updates = write_buffer.drain_all();
            for update in &updates {
                state.apply(update.key);
            }
            debug!(
                target: "lru::host",
                event = "wb_auto_flush",
                applied = updates.len(),
                commit_seq = seq.0
            );
        }
        Ok(seq)
    }
}

impl LruHost for MemHost {
    fn begin(&self) -> Box<dyn LruTrans + '_> {
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::AcqRel));
        let snapshot = self.state.read().snapshot();
        Box::new(MemTrans {
            host: self,
            id,
            snapshot,
            reads: BTreeSet::new(),
            buffered: Vec::new(),
            alloc_writes: BTreeMap::new(),
        })
    }

    fn devices(&self) -> &dyn DeviceTable {
        &self.devices
    }

    fn flush_write_buffer(&self) -> Result<usize> {
        Ok(self.flush_all())
    }

    fn max_trans_restarts(&self) -> usize {
        self.config.max_trans_restarts
    }
}

struct MemTrans<'h> {
    host: &'h MemHost,
    id: TxnId,
    snapshot: CommitSeq,
    reads: BTreeSet<Slot>,
    buffered: Vec<LruKey>,
    alloc_writes: BTreeMap<BucketRef, AllocEntry>,
}

impl LruTrans for MemTrans<'_> {
    fn id(&self) -> TxnId {
        self.id
    }

    fn peek(&mut self, pos: KeyPos) -> Result<Option<LruKey>> {
        self.reads.insert(Slot::Lru(pos));
        let state = self.host.state.read();
        Ok(state
            .index
            .get(&pos)
            .map(|key_type| LruKey {
                pos,
                key_type: *key_type,
            }))
    }

    fn peek_next(&mut self, from: KeyPos) -> Result<Option<LruKey>> {
        let found = self
            .host
            .state
            .read()
            .index
            .range(from..)
            .next()
            .map(|(pos, key_type)| LruKey {
                pos: *pos,
                key_type: *key_type,
            });
        if let Some(key) = found {
            self.reads.insert(Slot::Lru(key.pos));
        }
        Ok(found)
    }

    fn alloc_entry(&mut self, bucket: BucketRef) -> Result<Option<AllocEntry>> {
        if let Some(entry) = self.alloc_writes.get(&bucket) {
            return Ok(Some(*entry));
        }
        self.reads.insert(Slot::Alloc(bucket));
        Ok(self.host.state.read().alloc.get(&bucket).copied())
    }

    fn next_alloc(&mut self, from: BucketRef) -> Result<Option<(BucketRef, AllocEntry)>> {
        let committed = self
            .host
            .state
            .read()
            .alloc
            .range(from..)
            .next()
            .map(|(bucket, entry)| (*bucket, *entry));
        let own = self
            .alloc_writes
            .range(from..)
            .next()
            .map(|(bucket, entry)| (*bucket, *entry));
        let found = match (committed, own) {
            (Some(c), Some(o)) if o.0 <= c.0 => Some(o),
            (Some(c), _) => Some(c),
            (None, o) => o,
        };
        if let Some((bucket, _)) = found {
            self.reads.insert(Slot::Alloc(bucket));
        }
        Ok(found)
    }

    fn put_alloc(&mut self, bucket: BucketRef, entry: AllocEntry) -> Result<()> {
        self.alloc_writes.insert(bucket, entry);
        Ok(())
    }

    fn update_buffered(&mut self, key: LruKey) -> Result<()> {
        validate_lru_key(&key).map_err(|e| key_error_to_lru(&e))?;
        if self.buffered.len() >= self.host.config.max_trans_updates {
            return Err(LruError::NoSpace(format!(
                "transaction {} staging ({} updates)",
                self.id.0,
                self.buffered.len()
            )));
        }
        self.buffered.push(key);
        Ok(())
    }

    fn flush_write_buffer_for(&mut self, pos: KeyPos) -> Result<usize> {
        Ok(self.host.flush_pos(pos))
    }

    fn commit(self: Box<Self>) -> Result<CommitSeq> {
        let host = self.host;
        host.commit_trans(*self)
    }
}
