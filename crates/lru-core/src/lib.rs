#![forbid(unsafe_code)]
//! Bucket LRU index engine.
//!
//! The index is a sorted set of keys, one per `(lru, time, bucket)`
//! membership. It is never authoritative: every entry must be derivable from
//! the allocation record of the bucket it names. This crate keeps the two in
//! step and repairs them when they drift.
//!
//! - [`mutate`]: `set`/`del`/`change` through the write buffer, plus the
//!   allocator trigger that drives them.
//! - [`check`]: lazy repair of a single expected entry, and the pass that
//!   applies it to every allocation record.
//! - [`scan`]: full-scan checker over the index, the ordered reclaim walk,
//!   and [`run_lru_fsck`] tying both passes together.
//! - [`report`]: what the passes found.
//!
//! All storage access goes through the `lru-host` traits; [`MemHost`] is the
//! in-memory implementation used by tests and the CLI.

pub mod check;
pub mod mutate;
pub mod report;
pub mod scan;

pub use check::{CheckSetOutcome, ReportOnce, check_alloc_to_lru_refs, lru_check_set};
pub use mutate::{lru_change, lru_del, lru_set, update_alloc_lrus, update_bucket};
pub use report::{LruCheckReport, LruFinding, LruFsckReport};
pub use scan::{check_lru_key, check_lrus, lru_walk, run_lru_fsck};

pub use lru_codec::{
    DecodedLru, lru_key_to_text, lru_pos, lru_pos_to_text, lru_range, validate_lru_key,
};
pub use lru_error::{LruError, Result};
pub use lru_host::{
    AllocEntry, AllocRecord, DataType, DeviceInfo, DeviceRef, DeviceTable, FixPolicy,
    FsckErrKind, FsckSink, FsckVerdict, HostConfig, HostImage, LastFlushed, LruHost, LruTrans,
    MemDeviceTable, MemHost, PolicySink, RefKey, WriteBufferConfig, commit_do,
    fragmentation_policy, read_policy,
};
pub use lru_types::{
    BucketRef, KeyError, KeyPos, KeyType, LRU_TIME_MAX, LruId, LruKey, LruKind, LruTime,
    MAX_DEVICES,
};
